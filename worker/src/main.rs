mod channel;
mod config;
mod exec;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::ConfigOverrides;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "wardgate-worker",
    about = "Conclave worker executing commands dispatched by a wardgate gateway"
)]
struct WorkerCli {
    /// Path to wardgate-worker.toml (defaults to ./wardgate-worker.toml).
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long = "gateway-url")]
    gateway_url: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    key: Option<String>,
}

impl WorkerCli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.clone(),
            gateway_url: self.gateway_url.clone(),
            name: self.name.clone(),
            key: self.key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = WorkerCli::parse();
    let worker_config =
        config::load(cli.overrides()).context("failed to load worker configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(worker_config.log_level.clone())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        conclave = %worker_config.name,
        gateway = %worker_config.gateway_url,
        "starting wardgate worker"
    );
    channel::run(Arc::new(worker_config)).await
}
