use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use linebot_runtime::config::{Config, LineInput};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Line-following robot runtime
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON file overriding the built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against simulated GPIO instead of the Pi header
    #[arg(long)]
    simulate: bool,

    /// Override the line sensor input with its stock wiring
    #[arg(long, value_enum)]
    line: Option<LineKind>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LineKind {
    Digital,
    Frequency,
    Serial,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error ({}): {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(kind) = args.line {
        config.line = match kind {
            LineKind::Digital => LineInput::default(),
            LineKind::Frequency => {
                // Color sensors sit on the marker and right-echo pins
                info!("Frequency line input: marker and rangefinders disabled");
                config.marker_pin = None;
                config.ultrasonic = None;
                LineInput::frequency()
            }
            LineKind::Serial => LineInput::serial(),
        };
    }

    if args.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = linebot_runtime::runtime::run(config, args.simulate).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
