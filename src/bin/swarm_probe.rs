use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use swarm_bridge::codec::{codec_for, WireCodec, WireFormat};
use swarm_bridge::registry::Endpoint;
use swarm_bridge::telemetry::{Attitude, PidGains, Position, TelemetryUpdate, ACTUATOR_COUNT};
use swarm_bridge::transport::{RawMessage, TransportConfig, UdpTransport};
use tokio::{signal, time};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_LOCAL_PORT: &str = "0";

type ProbeResult<T> = Result<T, Box<dyn std::error::Error>>;

fn i16_arg(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .help(help)
        .required(true)
        .validator(|v| match v.parse::<i16>() {
            Ok(_) => Ok(()),
            Err(_) => Err("Value must fit a signed 16-bit integer".into()),
        })
}

fn u8_arg(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .help(help)
        .required(true)
        .validator(|v| match v.parse::<u8>() {
            Ok(_) => Ok(()),
            Err(_) => Err("Value must be between 0 and 255".into()),
        })
}

#[tokio::main]
async fn main() -> ProbeResult<()> {
    let matches = App::new("swarm-probe")
        .version("0.1.0")
        .author("Swarm Systems Engineering Team")
        .about("Send and watch swarm telemetry datagrams")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bridge port (defaults to the format's listener port)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Wire format")
                .takes_value(true)
                .possible_values(&["binary", "text", "json"])
                .default_value("binary")
                .global(true),
        )
        .arg(
            Arg::with_name("local-port")
                .short("l")
                .long("local-port")
                .value_name("PORT")
                .help("Local port to send from; fixes the endpoint the bridge registers")
                .takes_value(true)
                .default_value(DEFAULT_LOCAL_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("unit")
                .short("u")
                .long("unit")
                .value_name("ID")
                .help(
                    "Address the message to this unit id explicitly. Over binary the id \
                     frame goes first and binds this local port to the unit on the bridge",
                )
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Print every datagram sent")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("attitude")
                .about("Send roll, pitch and yaw")
                .setting(AppSettings::AllowNegativeNumbers)
                .arg(i16_arg("roll", "Roll").index(1))
                .arg(i16_arg("pitch", "Pitch").index(2))
                .arg(i16_arg("yaw", "Yaw").index(3)),
        )
        .subcommand(
            SubCommand::with_name("position")
                .about("Send x, y and z")
                .setting(AppSettings::AllowNegativeNumbers)
                .arg(i16_arg("x", "X").index(1))
                .arg(i16_arg("y", "Y").index(2))
                .arg(i16_arg("z", "Z").index(3)),
        )
        .subcommand(
            SubCommand::with_name("battery")
                .about("Send battery level")
                .arg(u8_arg("level", "Battery level").index(1)),
        )
        .subcommand(
            SubCommand::with_name("id")
                .about("Send a unit id announcement")
                .arg(u8_arg("id", "Unit id").index(1)),
        )
        .subcommand(
            SubCommand::with_name("pid")
                .about("Send PID gains for one actuator")
                .arg(
                    Arg::with_name("actuator")
                        .help("Actuator index (0-3)")
                        .required(true)
                        .index(1)
                        .validator(|v| match v.parse::<usize>() {
                            Ok(a) if a < ACTUATOR_COUNT => Ok(()),
                            _ => Err(format!("Actuator must be between 0 and {}", ACTUATOR_COUNT - 1)),
                        }),
                )
                .arg(u8_arg("kp", "Proportional gain").index(2))
                .arg(u8_arg("ki", "Integral gain").index(3))
                .arg(u8_arg("kd", "Derivative gain").index(4)),
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send a datagram verbatim")
                .arg(
                    Arg::with_name("payload")
                        .help("Hex bytes (\"EE EE 02 01 4B ...\") or text with --text")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("text")
                        .short("t")
                        .long("text")
                        .help("Send the payload as UTF-8 text instead of hex"),
                ),
        )
        .subcommand(
            SubCommand::with_name("listen")
                .about("Print decoded datagrams arriving on the local port")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds (default: until Ctrl-C)")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let format: WireFormat = matches.value_of("format").unwrap_or("binary").parse()?;
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = match matches.value_of("port") {
        Some(p) => p.parse::<u16>()?,
        None => format.default_port(),
    };
    let local_port = matches
        .value_of("local-port")
        .unwrap_or(DEFAULT_LOCAL_PORT)
        .parse::<u16>()?;
    let unit = matches.value_of("unit").map(str::parse::<u8>).transpose()?;
    let verbose = matches.is_present("verbose");

    let probe = Probe {
        codec: codec_for(format),
        local_port,
        verbose,
    };

    let update = match matches.subcommand() {
        ("attitude", Some(sub)) => TelemetryUpdate::new().with_attitude(Attitude {
            roll: parse(sub, "roll")?,
            pitch: parse(sub, "pitch")?,
            yaw: parse(sub, "yaw")?,
        }),
        ("position", Some(sub)) => TelemetryUpdate::new().with_position(Position {
            x: parse(sub, "x")?,
            y: parse(sub, "y")?,
            z: parse(sub, "z")?,
        }),
        ("battery", Some(sub)) => TelemetryUpdate::new().with_battery(parse(sub, "level")?),
        ("id", Some(sub)) => TelemetryUpdate::new().with_unit_id(parse(sub, "id")?),
        ("pid", Some(sub)) => TelemetryUpdate::new().with_pid(
            parse(sub, "actuator")?,
            PidGains {
                kp: parse(sub, "kp")?,
                ki: parse(sub, "ki")?,
                kd: parse(sub, "kd")?,
            },
        ),
        ("raw", Some(sub)) => {
            let payload = sub.value_of("payload").unwrap_or_default();
            let bytes = if sub.is_present("text") {
                payload.as_bytes().to_vec()
            } else {
                parse_hex(payload)?
            };
            return probe.send_raw(&bytes, host, port);
        }
        ("listen", Some(sub)) => {
            let duration = sub
                .value_of("duration")
                .map(str::parse::<u64>)
                .transpose()?
                .map(Duration::from_secs);
            return probe.listen(duration).await;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Send a battery level", "swarm-probe battery 75".bright_cyan());
            println!("  {} Send a position over JSON", "swarm-probe -f json position 10 -20 5".bright_cyan());
            println!("  {} Watch datagrams on a port", "swarm-probe -l 9000 listen".bright_cyan());
            return Ok(());
        }
    };

    let update = match unit {
        Some(id) => update.with_unit_id(id),
        None => update,
    };
    probe.send_update(&update, host, port)
}

fn parse<T>(matches: &ArgMatches<'_>, name: &str) -> ProbeResult<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    let value = matches
        .value_of(name)
        .ok_or_else(|| format!("missing argument <{name}>"))?;
    Ok(value.parse::<T>()?)
}

fn parse_hex(input: &str) -> ProbeResult<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != ':')
        .collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {input:?}").into());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(Into::into))
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve(host: &str, port: u16) -> ProbeResult<Endpoint> {
    let addr = (host, port)
        .to_socket_addrs()?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| format!("cannot resolve {host}:{port}"))?;
    Ok(Endpoint::from(addr))
}

struct Probe {
    codec: Arc<dyn WireCodec>,
    local_port: u16,
    verbose: bool,
}

impl Probe {
    fn transport(&self) -> ProbeResult<UdpTransport> {
        let mut transport = UdpTransport::new(
            TransportConfig::new(format!("0.0.0.0:{}", self.local_port)),
            self.codec.clone(),
        );
        transport.start()?;
        Ok(transport)
    }

    fn send_update(&self, update: &TelemetryUpdate, host: &str, port: u16) -> ProbeResult<()> {
        let endpoint = resolve(host, port)?;
        let transport = self.transport()?;
        let datagrams = self.codec.encode(update)?;

        for datagram in &datagrams {
            transport.send_to_endpoint(datagram, &endpoint)?;
            if self.verbose {
                self.print_datagram(datagram);
            }
        }

        println!(
            "{} Sent {} {} datagram(s) to {}",
            "✅".green(),
            datagrams.len(),
            self.codec.format().to_string().bright_white(),
            endpoint.to_string().bright_cyan()
        );
        Ok(())
    }

    fn send_raw(&self, payload: &[u8], host: &str, port: u16) -> ProbeResult<()> {
        let endpoint = resolve(host, port)?;
        let transport = self.transport()?;
        let sent = transport.send_to_endpoint(payload, &endpoint)?;
        if self.verbose {
            self.print_datagram(payload);
        }
        println!(
            "{} Sent {} raw bytes to {}",
            "✅".green(),
            sent,
            endpoint.to_string().bright_cyan()
        );
        Ok(())
    }

    fn print_datagram(&self, datagram: &[u8]) {
        match self.codec.format() {
            WireFormat::Binary => println!("  {}", hex(datagram).dimmed()),
            _ => println!("  {}", String::from_utf8_lossy(datagram).dimmed()),
        }
    }

    async fn listen(&self, duration: Option<Duration>) -> ProbeResult<()> {
        let transport = self.transport()?;
        let codec = self.codec.clone();
        transport.set_callback(move |message: RawMessage| print_message(codec.as_ref(), &message));

        let addr = transport
            .local_addr()
            .map_or_else(|| "?".to_string(), |a| a.to_string());
        println!(
            "{} Listening for {} datagrams on {} (Ctrl-C to stop)",
            "📡".bright_blue(),
            self.codec.format().to_string().bright_white(),
            addr.bright_cyan()
        );

        match duration {
            Some(limit) => {
                if time::timeout(limit, signal::ctrl_c()).await.is_err() {
                    println!("{}", "Listen window elapsed".dimmed());
                }
            }
            None => signal::ctrl_c().await?,
        }

        let stats = transport.stats();
        println!(
            "{} {} datagrams, {} bytes",
            "Received:".bright_white(),
            stats.datagrams_received,
            stats.bytes_received
        );
        Ok(())
    }
}

fn print_message(codec: &dyn WireCodec, message: &RawMessage) {
    let header = format!("#{} from {}", message.sequence, message.source);
    match codec.decode(&message.payload) {
        Ok(update) if update.is_empty() => {
            println!("{} {}", header.bright_white(), "(no fields)".dimmed());
        }
        Ok(update) => match serde_json::to_string(&update) {
            Ok(json) => println!("{} {}", header.bright_white(), json.bright_green()),
            Err(e) => println!("{} {}", header.bright_white(), e.to_string().bright_red()),
        },
        Err(e) => println!(
            "{} {} {}",
            header.bright_white(),
            "❌".red(),
            e.to_string().bright_red()
        ),
    }
}
