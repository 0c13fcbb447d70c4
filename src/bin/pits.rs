use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use pits::capabilities::FlightLog;
use pits::codec::{RebuiltFrame, TelemetryCodec};
use pits::config::FlightConfig;
use pits::flight::FlightSystem;
use pits::logbook::FileLog;
use pits::ports::{PortOpener, PortRegistry, SystemPorts};
use pits::reconnect::{NoResetLine, ResetLine, SysfsResetLine};
use pits::sim::{SimulatedDevice, SimulatedPorts};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};

const SIMULATED_PORT: &str = "/dev/ttySIM0";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("pits")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🎈 PiTS - balloon payload serial link and telemetry")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file (built-in defaults when omitted)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("🛰️  Run the flight link until Ctrl+C")
                .arg(
                    Arg::with_name("simulate")
                        .long("simulate")
                        .help("Talk to a simulated payload controller instead of real ports"),
                ),
        )
        .subcommand(SubCommand::with_name("ports").about("🔌 List the serial ports discovery would open"))
        .subcommand(
            SubCommand::with_name("encode")
                .about("📦 Pack a measurement line into a downlink frame")
                .arg(
                    Arg::with_name("LINE")
                        .help("Comma-delimited measurement line, timestamp first")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("📡 Rebuild a measurement line from a downlink frame")
                .arg(
                    Arg::with_name("HEX")
                        .help("Frame bytes as hex, with or without the TX tag")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .value_name("FORMAT")
                        .help("Output format")
                        .takes_value(true)
                        .possible_values(&["table", "json", "line"])
                        .default_value("table"),
                ),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = FlightConfig::load_or_default(matches.value_of("config").map(Path::new))?;

    match matches.subcommand() {
        ("run", Some(sub_matches)) => handle_run(sub_matches, config).await?,
        ("ports", _) => handle_ports(&config)?,
        ("encode", Some(sub_matches)) => handle_encode(sub_matches, &config)?,
        ("decode", Some(sub_matches)) => handle_decode(sub_matches, &config)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Dry-run against a simulated controller", "pits run --simulate".bright_cyan());
            println!("  {} List serial ports", "pits ports".bright_cyan());
            println!("  {} Decode a received frame", "pits decode <HEX>".bright_cyan());
        }
    }

    Ok(())
}

async fn handle_run(matches: &ArgMatches<'_>, config: FlightConfig) -> Result<(), Box<dyn std::error::Error>> {
    let simulate = matches.is_present("simulate");
    println!("{}", format!("🎈 {} flight link starting", config.system_name).bright_blue().bold());

    let schema = config.schema()?;
    let (opener, reset_line): (Box<dyn PortOpener>, Box<dyn ResetLine>) = if simulate {
        println!("{} Simulated controller on {}", "🧪".yellow(), SIMULATED_PORT.bright_cyan());
        let device = SimulatedDevice::payload_controller(SIMULATED_PORT, &schema);
        (Box::new(SimulatedPorts::new().with_device(device)), Box::new(NoResetLine))
    } else {
        (Box::new(SystemPorts::new()?), open_reset_line(&config))
    };

    let log: Arc<dyn FlightLog> = Arc::new(FileLog::open(&config.logging.directory, config.system_name.clone())?);
    let mut system = FlightSystem::new(config, opener, reset_line, log, Vec::new())?;
    if system.ports().is_empty() {
        println!("{} No serial ports yet, will keep looking", "⚠️".yellow());
    } else {
        println!("{} Ports open: {}", "✅".green(), system.ports().join(", ").bright_white());
    }

    let stop = system.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current tick");
            stop.stop();
        }
    });

    let report = tokio::task::spawn_blocking(move || system.run()).await??;

    println!("{}", "🛬 Flight link stopped".bright_green().bold());
    println!("{} {}", "Writes serviced:".bright_white(), report.scheduler.writes_serviced);
    println!("{} {}", "Reads serviced:".bright_white(), report.scheduler.reads_serviced);
    println!("{} {}", "Uplinks received:".bright_white(), report.scheduler.uplinks_received);
    println!("{} {}", "Downlink frames:".bright_white(), report.cadence.downlinks_enqueued);
    let faults = format!("{}", report.scheduler.link_faults);
    println!(
        "{} {}",
        "Link faults:".bright_white(),
        if report.scheduler.link_faults == 0 { faults.bright_green() } else { faults.bright_red() }
    );
    println!("{} {}", "Reconnection cycles:".bright_white(), report.reconnection_cycles);
    println!("{} {}", "Dropped requests:".bright_white(), report.dropped_requests);
    Ok(())
}

fn open_reset_line(config: &FlightConfig) -> Box<dyn ResetLine> {
    let Some(pin) = config.serial_communication.arduino_reset_pin else {
        return Box::new(NoResetLine);
    };
    match SysfsResetLine::open(pin) {
        Ok(line) => Box::new(line),
        Err(e) => {
            warn!("Reset line on GPIO {} unavailable ({}), continuing without it", pin, e);
            Box::new(NoResetLine)
        }
    }
}

fn handle_ports(config: &FlightConfig) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.line_settings();
    let mut registry = PortRegistry::with_exclusions(
        Box::new(SystemPorts::new()?),
        config.serial_communication.excluded_ports.clone(),
    );
    let ports = registry.discover(settings.baud_rate, settings.timeout)?;

    if ports.is_empty() {
        println!("{} {}", "❌".red(), "No usable serial ports".bright_red());
    } else {
        println!("{} {}", "🔌".bright_blue(), "Serial ports".bright_blue().bold());
        for port in &ports {
            println!("  {}", port.bright_cyan());
        }
    }
    Ok(())
}

fn handle_encode(matches: &ArgMatches<'_>, config: &FlightConfig) -> Result<(), Box<dyn std::error::Error>> {
    let codec = TelemetryCodec::with_mode(config.schema()?, config.packing);
    let line = matches.value_of("LINE").unwrap_or_default();
    let frame = codec.encode_frame(line)?;

    println!("{}", to_hex(&frame.bytes).bright_white());
    for failure in &frame.substituted {
        println!(
            "{} {} [{}] sent as sentinel",
            "⚠️".yellow(),
            failure.field.bright_white(),
            failure.text.bright_red()
        );
    }
    Ok(())
}

fn handle_decode(matches: &ArgMatches<'_>, config: &FlightConfig) -> Result<(), Box<dyn std::error::Error>> {
    let codec = TelemetryCodec::with_mode(config.schema()?, config.packing);
    let bytes = parse_hex(matches.value_of("HEX").unwrap_or_default())?;
    let frame_bytes = match bytes.strip_prefix(b"TX") {
        Some(rest) if bytes.len() > codec.frame_len() => rest,
        _ => &bytes[..],
    };
    let frame = codec.decode(frame_bytes)?;

    match matches.value_of("format").unwrap_or("table") {
        "json" => println!("{}", serde_json::to_string_pretty(&frame)?),
        "line" => println!("{}", frame.to_line()),
        _ => print_frame_table(&frame),
    }
    Ok(())
}

fn print_frame_table(frame: &RebuiltFrame) {
    let width = frame.fields.iter().map(|field| field.name.len()).max().unwrap_or(0).max(9);
    println!("{} {}", "📡".bright_blue(), frame.timestamp.bright_blue().bold());
    println!("{}", "─".repeat(width + 16).bright_white());
    for field in &frame.fields {
        println!(
            "{}  {}",
            format!("{:<width$}", field.name).bright_white(),
            format!("{:>12}", field.value).bright_cyan()
        );
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if !digits.is_ascii() {
        return Err("hex frame contains non-ASCII characters".to_string());
    }
    if digits.len() % 2 != 0 {
        return Err(format!("hex frame has an odd number of digits ({})", digits.len()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}
