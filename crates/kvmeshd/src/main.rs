//! kvmeshd: kvmesh relay and replica daemon
//!
//! Usage:
//!   kvmeshd [--config ./kvmesh.toml] [--mode relay|peer] [--watch KEY]...
//!
//! Modes:
//!   relay - Websocket fan-out for socket transports and peer signaling [default]
//!   peer  - Interactive replica driven by stdin commands

mod peer;
mod relay;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use kvmesh_core::KvmeshConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kvmeshd", version, about = "kvmesh relay and replica daemon")]
struct Cli {
    /// Path to kvmesh.toml configuration file
    #[arg(long, short = 'c', env = "KVMESH_CONFIG", default_value = "kvmesh.toml")]
    config: PathBuf,

    /// Daemon mode
    #[arg(long, default_value = "relay")]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error); overrides [daemon] log_level
    #[arg(long, env = "KVMESH_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides [daemon] log_format
    #[arg(long, env = "KVMESH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Keys whose changes are logged in peer mode
    #[arg(long = "watch", value_name = "KEY")]
    watch: Vec<String>,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum Mode {
    /// Websocket relay with /metrics and /healthz
    Relay,
    /// Replica reading commands from stdin
    Peer,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config)?;

    let level = cli
        .log
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(&level, &format);

    if !found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cli.mode,
        config = %cli.config.display(),
        "kvmeshd starting"
    );

    match cli.mode {
        Mode::Relay => relay::run(config.relay).await,
        Mode::Peer => peer::run(config.sync, cli.watch).await,
    }
}

/// Read and parse `path`. A missing file yields the defaults and `false`.
fn load_config(path: &Path) -> Result<(KvmeshConfig, bool)> {
    if !path.exists() {
        return Ok((KvmeshConfig::default(), false));
    }
    let config = KvmeshConfig::load(path).map_err(|e| anyhow::anyhow!("loading config: {e}"))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
