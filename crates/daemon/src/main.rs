// repomirrord: webhook-driven repository mirroring daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use repomirror_daemon::config::{Config, DEFAULT_CONFIG_PATH};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repomirrord", about = "Mirror hosted repositories into object storage")]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level regardless of `log_filter`.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let filter = if cli.debug { "debug" } else { config.log_filter.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).context("invalid log filter")?)
        .init();

    info!(config = %cli.config.display(), "starting repomirror daemon");
    repomirror_daemon::runtime::run(config).await.context("repomirror daemon terminated unexpectedly")
}
