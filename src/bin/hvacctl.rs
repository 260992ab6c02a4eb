use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use hvacd::client::HvacClient;
use hvacd::payload::{Query, Reply};
use hvacd::threads::ThreadState;
use std::time::Duration;
use tokio::time;

const DEFAULT_ADDRESS: &str = "unix:///tmp/bbb_hvac";
const DEFAULT_TIMEOUT_MS: &str = "3000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hvacctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🌡️  Query and control a running hvacd")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .value_name("ADDRESS")
                .help("Daemon socket (tcp://host:port or unix:///path)")
                .takes_value(true)
                .default_value(DEFAULT_ADDRESS)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("MS")
                .help("Reply timeout in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_MS)
                .global(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Timeout must be a number of milliseconds".into()),
                }),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Check that the daemon answers"))
        .subcommand(SubCommand::with_name("status").about("📊 Show every cached board point"))
        .subcommand(SubCommand::with_name("points").about("📋 List configured board points"))
        .subcommand(SubCommand::with_name("setpoints").about("🎯 List set points"))
        .subcommand(
            SubCommand::with_name("read")
                .about("🔎 Read one board point")
                .arg(Arg::with_name("point").required(true).help("Board point id")),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("🎯 Change a set point target")
                .arg(Arg::with_name("name").required(true).help("Set point name"))
                .arg(Arg::with_name("target").required(true).help("New target value")),
        )
        .subcommand(
            SubCommand::with_name("force")
                .about("📌 Pin a board point to a value (debug)")
                .arg(Arg::with_name("point").required(true).help("Board point id"))
                .arg(Arg::with_name("value").required(true).help("Forced value")),
        )
        .subcommand(
            SubCommand::with_name("unforce")
                .about("📍 Release a forced board point")
                .arg(Arg::with_name("point").required(true).help("Board point id")),
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("🔢 Read the unscaled board value of a point")
                .arg(Arg::with_name("point").required(true).help("Board point id")),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("🎛️  Command an output point directly")
                .arg(Arg::with_name("point").required(true).help("Output point id"))
                .arg(Arg::with_name("value").required(true).help("Value in engineering units")),
        )
        .subcommand(SubCommand::with_name("logic").about("🧮 Show control loop counters"))
        .subcommand(SubCommand::with_name("threads").about("🧵 Show supervised workers"))
        .subcommand(SubCommand::with_name("health").about("🩺 Show health and alerts"))
        .subcommand(
            SubCommand::with_name("watch")
                .about("📡 Stream telemetry as it changes")
                .arg(
                    Arg::with_name("points")
                        .multiple(true)
                        .help("Point ids to watch (all when omitted)"),
                ),
        )
        .get_matches();

    let address = matches.value_of("address").unwrap_or(DEFAULT_ADDRESS);
    let format = matches.value_of("format").unwrap_or("table");
    let timeout = Duration::from_millis(
        matches
            .value_of("timeout")
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .parse()?,
    );

    let mut client = time::timeout(timeout, HvacClient::connect(address)).await??;
    time::timeout(timeout, client.hello()).await??;

    let query = match matches.subcommand() {
        ("watch", Some(sub)) => return watch(&mut client, sub, format).await,
        ("ping", _) => Query::Ping,
        ("status", _) => Query::ReadAll,
        ("points", _) => Query::ListPoints,
        ("setpoints", _) => Query::ListSetPoints,
        ("logic", _) => Query::LogicStatus,
        ("threads", _) => Query::Threads,
        ("health", _) => Query::Health,
        ("read", Some(sub)) => Query::ReadPoint {
            point_id: required(sub, "point")?,
        },
        ("set", Some(sub)) => Query::SetSetPoint {
            name: required(sub, "name")?,
            target: required(sub, "target")?.parse()?,
        },
        ("force", Some(sub)) => Query::ForcePoint {
            point_id: required(sub, "point")?,
            value: required(sub, "value")?.parse()?,
        },
        ("unforce", Some(sub)) => Query::UnforcePoint {
            point_id: required(sub, "point")?,
        },
        ("raw", Some(sub)) => Query::ReadRaw {
            point_id: required(sub, "point")?,
        },
        ("write", Some(sub)) => Query::WriteOutput {
            point_id: required(sub, "point")?,
            value: required(sub, "value")?.parse()?,
        },
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            return Ok(());
        }
    };

    let reply = time::timeout(timeout, client.query(query)).await??;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        print_reply(&reply);
    }

    if matches!(reply, Reply::Failed { .. }) {
        std::process::exit(2);
    }
    Ok(())
}

fn required(matches: &ArgMatches<'_>, name: &str) -> Result<String, Box<dyn std::error::Error>> {
    matches
        .value_of(name)
        .map(str::to_string)
        .ok_or_else(|| format!("missing argument <{}>", name).into())
}

async fn watch(
    client: &mut HvacClient,
    matches: &ArgMatches<'_>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let points: Vec<String> = matches
        .values_of("points")
        .map(|v| v.map(str::to_string).collect())
        .unwrap_or_default();
    client.subscribe(points).await?;
    println!("{}", "📡 Watching telemetry (Ctrl+C to stop)".bright_blue());

    loop {
        let telemetry = client.next_telemetry().await?;
        if format == "json" {
            println!("{}", serde_json::to_string(&telemetry)?);
            continue;
        }
        for reading in &telemetry.readings {
            println!(
                "{} {:<20} {:>10.2} {}",
                telemetry.timestamp_ms.to_string().dimmed(),
                reading.point_id.bright_white(),
                reading.value,
                format!("v{}", reading.version.unwrap_or_default()).dimmed()
            );
        }
    }
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Pong => println!("{} {}", "✅".green(), "hvacd is responsive".bright_green()),
        Reply::Ack => println!("{} {}", "✅".green(), "Done".bright_green()),
        Reply::Hello { version } => println!("protocol version {}", version),
        Reply::Failed { reason } => println!("{} {}", "❌".red(), reason.bright_red()),
        Reply::Point(entry) => {
            let forced = if entry.forced { " (forced)".yellow().to_string() } else { String::new() };
            println!(
                "{} = {}{}  {}",
                entry.point_id.bright_white().bold(),
                format!("{:.2}", entry.value).bright_cyan(),
                forced,
                format!("v{} @ {}", entry.version, entry.timestamp_ms).dimmed()
            );
        }
        Reply::Raw { point_id, raw } => println!(
            "{} = {} {}",
            point_id.bright_white().bold(),
            format!("{}", raw).bright_cyan(),
            "(raw)".dimmed()
        ),
        Reply::Snapshot(snapshot) => {
            println!("{} {}", "📊".bright_blue(), format!("Board state (version {})", snapshot.version).bright_blue().bold());
            if snapshot.is_empty() {
                println!("  {}", "no readings yet".dimmed());
            }
            for entry in snapshot.entries.values() {
                let marker = if entry.forced { "📌" } else { "  " };
                println!(
                    "{} {:<20} {:>10.2}  {}",
                    marker,
                    entry.point_id.bright_white(),
                    entry.value,
                    format!("v{}", entry.version).dimmed()
                );
            }
        }
        Reply::Points(points) => {
            println!("{}", "Board points".bright_blue().bold());
            for point in points {
                println!(
                    "  {:<20} {:<7} {:<8} gain {:<8} offset {:<8} {}",
                    point.id.bright_white(),
                    format!("{:?}", point.direction),
                    format!("{:?}", point.data_type),
                    point.scaling.gain,
                    point.scaling.offset,
                    point.description.dimmed()
                );
            }
        }
        Reply::SetPoints(set_points) => {
            println!("{}", "Set points".bright_blue().bold());
            for sp in set_points {
                println!(
                    "  {:<20} target {:>7.2}  {:?}  {} -> {}",
                    sp.name.bright_white(),
                    sp.target,
                    sp.rule,
                    sp.input,
                    sp.outputs.join(", ")
                );
            }
        }
        Reply::SetPoint(sp) => println!(
            "{} {} target = {}",
            "🎯".bright_blue(),
            sp.name.bright_white().bold(),
            format!("{:.2}", sp.target).bright_cyan()
        ),
        Reply::LogicStatus(status) => {
            println!("{}", "Control loop".bright_blue().bold());
            println!("  {:<16} {}", "Iterations:".bright_white(), status.iterations);
            println!("  {:<16} {}", "Commands:".bright_white(), status.commands_issued);
            println!("  {:<16} {}", "Rule errors:".bright_white(), status.rule_errors);
            if let Some(err) = &status.last_error {
                println!("  {:<16} {}", "Last error:".bright_white(), err.yellow());
            }
        }
        Reply::Threads(threads) => {
            println!("{}", "Workers".bright_blue().bold());
            for t in threads {
                let state = match t.state {
                    ThreadState::Running => "Running".bright_green(),
                    ThreadState::Starting => "Starting".cyan(),
                    ThreadState::Stalled => "Stalled".bright_red(),
                    ThreadState::Terminated => "Terminated".dimmed(),
                };
                let age = t
                    .heartbeat_age_ms
                    .map_or_else(|| "-".to_string(), |ms| format!("{} ms", ms));
                println!(
                    "  {:<14} {:<12} gen {:<4} restarts {:<3} heartbeat {}",
                    t.name.bright_white(),
                    state,
                    t.generation,
                    t.restarts,
                    age
                );
            }
        }
        Reply::Health(report) => {
            if report.healthy {
                println!("{} {}", "🟢".green(), "Healthy".bright_green().bold());
            } else {
                println!("{} {}", "🔴".red(), "UNHEALTHY".bright_red().bold());
            }
            for record in &report.alerts {
                let line = format!("#{} {}", record.id, record.alert);
                if record.resolved {
                    println!("  {}", line.dimmed());
                } else if record.fatal {
                    println!("  {}", line.bright_red());
                } else {
                    println!("  {}", line.yellow());
                }
            }
        }
    }
}
