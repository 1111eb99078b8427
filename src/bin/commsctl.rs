use std::env;
use std::process;
use std::time::Duration;

use radio_comms::control::api::{self, StationStatus};
use radio_comms::{CommsConfig, LoopbackSession, init_tracing};

const USAGE: &str = "Usage: commsctl [--status] [--json] [--channels N] [--threshold T]

Without --status the interactive console launches.";

struct Options {
    status: bool,
    json: bool,
    config: CommsConfig,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        status: false,
        json: false,
        config: CommsConfig::default(),
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" | "-s" => options.status = true,
            "--json" => options.json = true,
            "--channels" | "-n" => {
                let value = args.next().ok_or("--channels needs a value")?;
                let count: usize = value
                    .parse()
                    .map_err(|_| format!("invalid channel count '{value}'"))?;
                if count == 0 {
                    return Err("channel count must be at least 1".to_string());
                }
                options.config = options.config.with_stream_count(count);
            }
            "--threshold" | "-t" => {
                let value = args.next().ok_or("--threshold needs a value")?;
                options.config.monitor_threshold = value
                    .parse()
                    .map_err(|_| format!("invalid threshold '{value}'"))?;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                process::exit(0);
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(options)
}

fn print_status(status: &StationStatus) {
    println!("Station     : {}", status.name);
    println!("Connection  : {}", status.connection);
    println!("Negotiation : {}", status.negotiation);
    println!("Microphone  : {}", status.capture);
    println!("Contexts    : {}", status.open_contexts);
    println!("Channels:");
    for row in &status.channels {
        let position = row
            .position
            .map(|[x, y, z]| format!("({x:+.2}, {y:+.2}, {z:+.2})"))
            .unwrap_or_else(|| "unplaced".to_string());
        println!(
            "  [{}] monitor={} ptt={} tx={} rx={} at {}",
            row.channel,
            if row.monitoring { "on" } else { "off" },
            if row.transmitting { "on" } else { "off" },
            if row.sending { "yes" } else { "no" },
            if row.receiving { "yes" } else { "no" },
            position,
        );
    }
}

fn run_status(options: &Options) -> Result<(), String> {
    init_tracing();
    let mut session = LoopbackSession::new(&options.config);
    let connected = session
        .connect(Duration::from_secs(1))
        .map_err(|err| err.to_string())?;
    if !connected {
        return Err("loopback session did not connect".to_string());
    }
    session
        .advance(Duration::from_millis(200))
        .map_err(|err| err.to_string())?;

    for station in [&session.experimenter, &session.participant] {
        let status = api::station_status(station);
        if options.json {
            println!("{}", status.to_json().map_err(|err| err.to_string())?);
        } else {
            print_status(&status);
        }
    }
    Ok(())
}

fn main() {
    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("commsctl: {err}\n\n{USAGE}");
            process::exit(1);
        }
    };

    if options.status {
        if let Err(err) = run_status(&options) {
            eprintln!("commsctl: {err}");
            process::exit(1);
        }
        return;
    }

    if let Err(err) = radio_comms::control::ui::run(&options.config) {
        eprintln!("commsctl: {err}");
        process::exit(1);
    }
}
