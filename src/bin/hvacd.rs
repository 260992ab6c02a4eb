use clap::{App, Arg};
use hvacd::link::connector_for;
use hvacd::{Configurator, Daemon};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, Level};

const DEFAULT_CONFIG: &str = "/etc/hvacd/hvac.json";
const HEALTH_CHECK_PERIOD: Duration = Duration::from_millis(500);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hvacd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🌡️  HVAC control daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (points, set points, settings)")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("link")
                .short("l")
                .long("link")
                .value_name("ENDPOINT")
                .help("Board link endpoint, overrides settings.serial.endpoint (tcp://host:port or serial:///dev/ttyS1?baud=115200)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .value_name("ADDRESS")
                .help("Client socket, overrides settings.listener.address (tcp://host:port or unix:///path)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ignore-stdin")
                .long("ignore-stdin")
                .help("Do not stop when stdin reaches EOF (for use under a process launcher)"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let (mut settings, config) = Configurator::load(config_path)?;
    if let Some(endpoint) = matches.value_of("link") {
        settings.serial.endpoint = endpoint.to_string();
    }
    if let Some(address) = matches.value_of("listen") {
        settings.listener.address = address.to_string();
    }

    let connector = connector_for(
        &settings.serial.endpoint,
        settings.serial.read_timeout(),
        settings.serial.write_timeout(),
    )?;
    let mut daemon = Daemon::new(settings, config, Arc::from(connector))?;
    daemon.start()?;

    let quit = Arc::new(AtomicBool::new(false));
    watch_stdin(Arc::clone(&quit), !matches.is_present("ignore-stdin"));

    while daemon.is_healthy() && !quit.load(Ordering::SeqCst) {
        thread::sleep(HEALTH_CHECK_PERIOD);
    }

    let healthy = daemon.is_healthy();
    daemon.graceful_stop();

    if healthy {
        info!("hvacd exited cleanly");
        Ok(())
    } else {
        for alert in daemon.alerts().active() {
            error!(alert = %alert.alert, fatal = alert.fatal, "unresolved alert");
        }
        error!("hvacd exiting after a fatal fault");
        std::process::exit(1);
    }
}

/// Sets `quit` on a `quit`/`stop` line, or on EOF when `stop_on_eof`.
fn watch_stdin(quit: Arc<AtomicBool>, stop_on_eof: bool) {
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if matches!(line.trim(), "quit" | "stop") => {
                        info!("stop requested on stdin");
                        quit.store(true, Ordering::SeqCst);
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            if stop_on_eof {
                info!("stdin closed");
                quit.store(true, Ordering::SeqCst);
            }
        });
    if let Err(e) = spawned {
        error!("could not watch stdin: {}", e);
    }
}
