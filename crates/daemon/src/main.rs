// modelsyncd: standalone registry owner.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use modelsync_daemon::config::DaemonConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "modelsyncd", version, about = "Live record subscription daemon")]
struct Args {
    /// TOML config file; environment variables still take precedence.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref()).context("failed to load config")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    modelsync_daemon::runtime::run(config).await.context("daemon terminated unexpectedly")
}
