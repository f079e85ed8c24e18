//! Portway - a tunnel-terminating relay

use std::path::PathBuf;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use portway::config::Config;
use portway::relay;

fn main() {
    let args = Args::parse();

    if args.version {
        print_version();
        return;
    }

    if args.gen_config {
        match serde_json::to_string_pretty(&Config::sample()) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("failed to render sample config: {}", e);
                std::process::exit(2);
            }
        }
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => {
            eprintln!("no config file given, see --help");
            std::process::exit(2);
        }
    };

    if let Some(port) = args.listen {
        config.listen_port = port;
    }

    // RUST_LOG wins over the config file.
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set tracing subscriber");
        std::process::exit(2);
    }

    info!("Portway v{} starting...", env!("CARGO_PKG_VERSION"));

    let code = match tokio::runtime::Runtime::new() {
        Ok(rt) => match rt.block_on(relay::run(config)) {
            Ok(code) => code,
            Err(e) => {
                error!("{}", e);
                2
            }
        },
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            2
        }
    };

    std::process::exit(code);
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    listen: Option<u16>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut listen = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--listen" => {
                    if i + 1 < args.len() {
                        listen = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            listen,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Portway - a tunnel-terminating relay

USAGE:
    portway [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --listen <PORT>         Override the configured listen port
    --gen-config            Print a sample configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    portway -c relay.json
    portway -c relay.json --listen 9000
    portway --gen-config > relay.json

EXIT CODES:
    0    graceful shutdown
    1    forced shutdown after the grace period
    2    configuration or bind failure
"#
    );
}

fn print_version() {
    println!("Portway v{}", env!("CARGO_PKG_VERSION"));
}
