use clap::{App, Arg};
use hvacd::client::HvacClient;
use hvacd::datalog::{FileSink, Record, RecordSink};
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn, Level};

const DEFAULT_ADDRESS: &str = "unix:///tmp/bbb_hvac";
const DEFAULT_ROTATE_SIZE: &str = "1048576";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hvac-logger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("📝 Record hvacd telemetry to rotating CSV files")
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .value_name("ADDRESS")
                .help("Daemon socket (tcp://host:port or unix:///path)")
                .takes_value(true)
                .default_value(DEFAULT_ADDRESS),
        )
        .arg(
            Arg::with_name("dir")
                .short("d")
                .long("dir")
                .value_name("DIR")
                .help("Directory for data files")
                .takes_value(true)
                .default_value("."),
        )
        .arg(
            Arg::with_name("prefix")
                .long("prefix")
                .value_name("NAME")
                .help("Data file name prefix")
                .takes_value(true)
                .default_value("hvac"),
        )
        .arg(
            Arg::with_name("rotate-size")
                .long("rotate-size")
                .value_name("BYTES")
                .help("Start a new file once the current one reaches this size")
                .takes_value(true)
                .default_value(DEFAULT_ROTATE_SIZE),
        )
        .arg(
            Arg::with_name("points")
                .multiple(true)
                .help("Point ids to record (all when omitted)"),
        )
        .arg(
            Arg::with_name("fail-hard")
                .long("fail-hard")
                .help("Exit on the first connection or write error instead of retrying"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let address = matches.value_of("address").unwrap_or(DEFAULT_ADDRESS).to_string();
    let rotate_size: u64 = matches.value_of("rotate-size").unwrap_or(DEFAULT_ROTATE_SIZE).parse()?;
    let points: Vec<String> = matches
        .values_of("points")
        .map(|v| v.map(str::to_string).collect())
        .unwrap_or_default();
    let fail_hard = matches.is_present("fail-hard");

    let mut sink = FileSink::new(
        matches.value_of("dir").unwrap_or("."),
        matches.value_of("prefix").unwrap_or("hvac"),
        rotate_size,
    )?;
    info!(path = %sink.current_path().display(), "📝 data logger starting");

    loop {
        match record(&address, points.clone(), &mut sink).await {
            Ok(()) => return Ok(()),
            Err(e) if fail_hard => {
                error!("❌ logging stopped: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!("connection lost ({}), retrying in {:?}", e, RECONNECT_DELAY);
                let _ = sink.flush();
                time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn record(
    address: &str,
    points: Vec<String>,
    sink: &mut FileSink,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = HvacClient::connect(address).await?;
    client.hello().await?;
    client.subscribe(points).await?;
    info!("🔗 subscribed to {}", address);

    loop {
        let telemetry = client.next_telemetry().await?;
        for record in Record::from_telemetry(&telemetry) {
            sink.append(&record)?;
        }
        sink.flush()?;
    }
}
