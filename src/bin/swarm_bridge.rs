use clap::{App, Arg};
use std::time::Duration;
use swarm_bridge::codec::{ChecksumMode, WireFormat};
use swarm_bridge::config::{BridgeConfig, ListenerConfig};
use swarm_bridge::SwarmBridge;
use tokio::{signal, time};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("swarm-bridge")
        .version("0.1.0")
        .author("Swarm Systems Engineering Team")
        .about("UDP telemetry bridge for drone swarms")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Run a single listener for this wire format")
                .takes_value(true)
                .possible_values(&["binary", "text", "json"]),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Listener port (requires --format)")
                .takes_value(true)
                .requires("format")
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be 0-65535".into()),
                }),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Bind address for every listener")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("units")
                .short("u")
                .long("units")
                .value_name("COUNT")
                .help("Telemetry records held per listener")
                .takes_value(true)
                .validator(|v| match v.parse::<usize>() {
                    Ok(n) if (1..=255).contains(&n) => Ok(()),
                    _ => Err("Unit count must be between 1 and 255".into()),
                }),
        )
        .arg(
            Arg::with_name("rate")
                .short("r")
                .long("rate")
                .value_name("HZ")
                .help("Tick rate in Hz")
                .takes_value(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Tick rate must be a positive integer".into()),
                }),
        )
        .arg(
            Arg::with_name("checksum")
                .long("checksum")
                .value_name("MODE")
                .help("Binary checksum acceptance; accept_complement also takes the negated sum")
                .takes_value(true)
                .possible_values(&["strict", "accept_complement"]),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level and publish per-unit snapshots"),
        )
        .get_matches();

    let default_level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("swarm_bridge={default_level}"))),
        )
        .init();

    let mut config = match matches.value_of("config") {
        Some(path) => {
            info!("Loading configuration from {}", path);
            BridgeConfig::from_file(path)?
        }
        None => BridgeConfig::default(),
    };

    if let Some(format) = matches.value_of("format") {
        let format: WireFormat = format.parse()?;
        let mut listener = config
            .listener(format)
            .cloned()
            .unwrap_or_else(|| ListenerConfig::for_format(format));
        if let Some(port) = matches.value_of("port") {
            listener.port = port.parse()?;
        }
        config.listeners = vec![listener];
    }
    for listener in &mut config.listeners {
        if let Some(bind) = matches.value_of("bind") {
            listener.bind_address = bind.to_string();
        }
        if let Some(units) = matches.value_of("units") {
            listener.unit_capacity = units.parse()?;
        }
    }
    if let Some(rate) = matches.value_of("rate") {
        config.tick_rate_hz = rate.parse()?;
    }
    match matches.value_of("checksum") {
        Some("strict") => config.checksum_mode = ChecksumMode::Strict,
        Some("accept_complement") => config.checksum_mode = ChecksumMode::AcceptComplement,
        _ => {}
    }
    config.validate()?;

    let mut bridges: Vec<SwarmBridge> = config
        .listeners
        .iter()
        .map(|listener| SwarmBridge::new(listener, &config))
        .collect();

    for bridge in &mut bridges {
        if let Err(e) = bridge.start() {
            warn!(format = %bridge.format(), "listener unavailable, retrying each tick: {}", e);
        }
    }
    info!(
        listeners = bridges.len(),
        tick_hz = config.tick_rate_hz,
        checksum = ?config.checksum_mode,
        "swarm bridge running"
    );

    let mut interval = time::interval(config.tick_period());
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    let mut status_interval = time::interval(STATUS_INTERVAL);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for bridge in &mut bridges {
                    tick(bridge);
                }
            }
            _ = status_interval.tick() => {
                for bridge in &bridges {
                    info!("{}", bridge.status_line());
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("failed to listen for shutdown signal: {}", e);
                }
                info!("shutdown requested");
                break;
            }
        }
    }

    for bridge in &mut bridges {
        bridge.stop();
        info!("{}", bridge.status_line());
    }
    info!("swarm bridge stopped");

    Ok(())
}

fn tick(bridge: &mut SwarmBridge) {
    match bridge.update() {
        Ok(Some(report)) => {
            for fault in &report.faults {
                debug!(
                    format = %bridge.format(),
                    sequence = fault.sequence,
                    source = %fault.source,
                    kind = ?fault.kind,
                    "{}",
                    fault.detail
                );
            }
            if report.applied > 0 && tracing::enabled!(Level::DEBUG) {
                publish_snapshots(bridge);
            }
        }
        Ok(None) => {}
        Err(e) => warn!(format = %bridge.format(), "tick failed: {}", e),
    }
}

fn publish_snapshots(bridge: &SwarmBridge) {
    for record in bridge.registered_records() {
        match serde_json::to_string(&record) {
            Ok(line) => debug!(format = %bridge.format(), "{}", line),
            Err(e) => warn!("failed to serialize snapshot: {}", e),
        }
    }
}
