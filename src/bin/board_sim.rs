use clap::{App, Arg};
use hvacd::payload::{BoardCommand, Reading, TelemetryPayload};
use hvacd::protocol::{encode, FrameDecoder, Message, MessageType, NO_CORRELATION};
use hvacd::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, info, warn, Level};

const DEFAULT_PORT: &str = "7000";
const HEATER_POWER_W: f64 = 3_000.0;
const COOLING_POWER_W: f64 = 3_500.0;
const ENVELOPE_UA_W_PER_K: f64 = 150.0;
// Scaled down so a zone responds within minutes instead of hours.
const ZONE_THERMAL_MASS_J_PER_K: f64 = 60_000.0;
const OUTDOOR_SWING_C: f64 = 4.0;
const OUTDOOR_PERIOD_S: f64 = 600.0;

/// Single-zone building model behind the simulated I/O board.
#[derive(Debug)]
struct ZoneModel {
    space_temp_c: f64,
    supply_temp_c: f64,
    space_rh_pct: f64,
    outdoor_mean_c: f64,
    outdoor_temp_c: f64,
    heater: bool,
    compressor: bool,
    fan: bool,
    elapsed_s: f64,
}

impl ZoneModel {
    fn new(start_temp_c: f64, outdoor_mean_c: f64) -> Self {
        Self {
            space_temp_c: start_temp_c,
            supply_temp_c: start_temp_c,
            space_rh_pct: 45.0,
            outdoor_mean_c,
            outdoor_temp_c: outdoor_mean_c,
            heater: false,
            compressor: false,
            fan: false,
            elapsed_s: 0.0,
        }
    }

    fn step(&mut self, dt_s: f64) {
        self.elapsed_s += dt_s;
        let phase = self.elapsed_s / OUTDOOR_PERIOD_S * 2.0 * std::f64::consts::PI;
        self.outdoor_temp_c = self.outdoor_mean_c + OUTDOOR_SWING_C * phase.sin();

        let heating_w = if self.heater { HEATER_POWER_W } else { 0.0 };
        // The compressor only moves heat when the air handler runs.
        let cooling_w = if self.compressor && self.fan { COOLING_POWER_W } else { 0.0 };
        let loss_w = (self.space_temp_c - self.outdoor_temp_c) * ENVELOPE_UA_W_PER_K;

        let net_w = heating_w - cooling_w - loss_w;
        self.space_temp_c += net_w * dt_s / ZONE_THERMAL_MASS_J_PER_K;

        let supply_offset = if self.heater { 15.0 } else { 0.0 }
            - if cooling_w > 0.0 { 10.0 } else { 0.0 };
        let supply_target = self.space_temp_c + supply_offset;
        self.supply_temp_c += (supply_target - self.supply_temp_c) * (dt_s / 10.0).min(1.0);

        let rh_target = if cooling_w > 0.0 { 38.0 } else { 48.0 };
        self.space_rh_pct += (rh_target - self.space_rh_pct) * (dt_s / 120.0).min(1.0);

        debug_assert!(self.space_temp_c.is_finite(), "zone temperature diverged");
    }

    fn apply(&mut self, command: &BoardCommand) -> bool {
        let on = command.value >= 0.5;
        match command.point_id.as_str() {
            "heater" => self.heater = on,
            "ac_comp" => self.compressor = on,
            "air_handler" => self.fan = on,
            _ => return false,
        }
        true
    }

    /// Raw board counts: temperatures as (°C + 40) * 100, humidity as ‰.
    fn readings(&self) -> Vec<Reading> {
        let temp_raw = |c: f64| ((c + 40.0) * 100.0).round();
        let digital = |on: bool| if on { 1.0 } else { 0.0 };
        vec![
            Reading::new("space_temp", temp_raw(self.space_temp_c)),
            Reading::new("supply_temp", temp_raw(self.supply_temp_c)),
            Reading::new("outdoor_temp", temp_raw(self.outdoor_temp_c)),
            Reading::new("space_rh", (self.space_rh_pct * 10.0).round()),
            Reading::new("heater", digital(self.heater)),
            Reading::new("ac_comp", digital(self.compressor)),
            Reading::new("air_handler", digital(self.fan)),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("board-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🔌 Simulated HVAC I/O board speaking the hvacd frame protocol over TCP")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("period")
                .long("period-ms")
                .value_name("MS")
                .help("Telemetry and simulation period")
                .takes_value(true)
                .default_value("500"),
        )
        .arg(
            Arg::with_name("start-temp")
                .long("start-temp")
                .value_name("CELSIUS")
                .help("Initial zone temperature")
                .takes_value(true)
                .default_value("18.0"),
        )
        .arg(
            Arg::with_name("outdoor")
                .long("outdoor")
                .value_name("CELSIUS")
                .help("Mean outdoor temperature")
                .takes_value(true)
                .default_value("5.0"),
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

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let period = Duration::from_millis(matches.value_of("period").unwrap_or("500").parse()?);
    let start_temp: f64 = matches.value_of("start-temp").unwrap_or("18.0").parse()?;
    let outdoor: f64 = matches.value_of("outdoor").unwrap_or("5.0").parse()?;

    println!("🔌 HVAC I/O Board Simulator");
    println!("===========================");

    let model = Arc::new(Mutex::new(ZoneModel::new(start_temp, outdoor)));

    let sim_model = Arc::clone(&model);
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            let mut zone = sim_model.lock().await;
            zone.step(period.as_secs_f64());
            debug!(
                "🌡️  space {:.2}°C supply {:.2}°C outdoor {:.2}°C heater={} comp={} fan={}",
                zone.space_temp_c, zone.supply_temp_c, zone.outdoor_temp_c, zone.heater, zone.compressor, zone.fan
            );
        }
    });

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("🌐 board listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 controller connected: {}", addr);
                let client_model = Arc::clone(&model);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, client_model, period).await {
                        warn!("controller {} error: {}", addr, e);
                    }
                    info!("🔌 controller {} disconnected", addr);
                });
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    model: Arc<Mutex<ZoneModel>>,
    period: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut decoder = FrameDecoder::new(4_096);
    let mut buf = [0u8; 256];
    let mut interval = time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let readings = model.lock().await.readings();
                let payload = TelemetryPayload { timestamp_ms: now_millis(), readings };
                let message = Message::json(MessageType::BoardTelemetry, NO_CORRELATION, &payload)?;
                stream.write_all(&encode(&message)).await?;
            }
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    decoder.finish()?;
                    return Ok(());
                }
                decoder.feed(&buf[..n]);
                while let Some(message) = decoder.next_message()? {
                    match message.message_type {
                        MessageType::BoardCommand => {
                            let command: BoardCommand = message.parse_json()?;
                            if model.lock().await.apply(&command) {
                                info!("⚙️  {} <- {}", command.point_id, command.value);
                            } else {
                                warn!("command for unknown output {}", command.point_id);
                            }
                        }
                        MessageType::Heartbeat => {
                            stream.write_all(&encode(&Message::heartbeat(message.correlation))).await?;
                        }
                        other => warn!("ignoring {:?} frame", other),
                    }
                }
            }
        }
    }
}
