//! cdropd: cryptdrop daemon
//!
//! Usage:
//!   cdropd [--config /etc/cryptdrop/config.toml] [--log info] [--log-format text]
//!   cdropd --config ... --print-checksum
//!
//! `--log` and `--log-format` override `daemon.log_level` and
//! `daemon.log_format` from the config file.

mod daemon;
mod metrics;

use anyhow::{Context, Result};
use cdrop_core::config::{CdropConfig, DaemonConfig};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cdropd", version, about = "cryptdrop encrypted file-drop daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "CDROP_CONFIG",
        default_value = "/etc/cryptdrop/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CDROP_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "CDROP_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Print the checksum of the configured vault password and exit
    #[arg(long)]
    print_checksum: bool,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = read_config(&cli.config).await?;
    let found = file.is_some();
    let config = file.unwrap_or_default();

    let (level, format) = log_settings(&cli, &config.daemon)?;
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "cdropd starting"
    );
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    if cli.print_checksum {
        let checksum = daemon::vault_checksum(&config.crypto)?;
        println!("{checksum}");
        return Ok(());
    }

    daemon::run(config).await
}

/// Parse the config file, `None` if it does not exist.
async fn read_config(path: &Path) -> Result<Option<CdropConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(Some(config))
}

/// Command-line settings win over the config file.
fn log_settings(cli: &Cli, daemon: &DaemonConfig) -> Result<(String, LogFormat)> {
    let level = cli.log.clone().unwrap_or_else(|| daemon.log_level.clone());
    let format = match &cli.log_format {
        Some(format) => format.clone(),
        None => LogFormat::from_str(&daemon.log_format, true).map_err(|e| {
            anyhow::anyhow!("daemon.log_format {:?}: {e}", daemon.log_format)
        })?,
    };
    Ok((level, format))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
