//! VibeMQ Nano - embedded-style MQTT broker
//!
//! Usage:
//!   vibemq-nano [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   -p, --parallel <N>     Number of work contexts (default: 32)
//!   --max-connections <N>  Maximum connections (default: unbounded)
//!   --max-packet-size <N>  Maximum packet size (default: 1MB)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vibemq_nano::config::Config;
use vibemq_nano::Broker;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// VibeMQ Nano - embedded-style MQTT broker
#[derive(Parser, Debug)]
#[command(name = "vibemq-nano")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "Embedded-style MQTT v3.1.1/v5.0 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of work contexts
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Maximum connections (0 = unbounded)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    // CLI overrides RUST_LOG, which overrides the config file
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.to_tracing_level().as_str()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_ascii_lowercase())),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(parallel) = args.parallel {
        config.server.parallel = parallel;
    }
    if let Some(max_connections) = args.max_connections {
        config.limits.max_connections = max_connections;
    }
    if let Some(max_packet_size) = args.max_packet_size {
        config.limits.max_packet_size = max_packet_size;
    }
    config.validate()?;

    info!("Starting VibeMQ Nano MQTT Broker");
    info!("  Bind address: {}", config.server.bind);
    info!("  Work contexts: {}", config.server.parallel);
    info!("  Max connections: {}", config.limits.max_connections);
    info!("  Max packet size: {} bytes", config.limits.max_packet_size);
    info!("  Resend queue: {}", config.limits.resend_queue_capacity);
    info!("  On exhausted: {:?}", config.limits.on_exhausted);

    let broker = Arc::new(Broker::new(config));

    let ctrl_c = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            ctrl_c.shutdown();
        }
    });

    broker.run().await?;
    Ok(())
}
