use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use wardgate_gateway::telemetry::{init_tracing, LogFormat, TracingConfig};
use wardgate_gateway::{config, router, spawn_housekeeping, AppState, ConfigOverrides};

#[derive(Parser, Debug, Clone)]
#[command(name = "wardgate", about = "Policy-enforcing gateway between agents and the outside world")]
struct GatewayCli {
    /// Path to wardgate.toml (defaults to ./wardgate.toml).
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format")]
    log_format: Option<String>,
}

impl GatewayCli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.clone(),
            host: self.host.clone(),
            port: self.port,
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = GatewayCli::parse();
    let gateway_config =
        config::load(cli.overrides()).context("failed to load gateway configuration")?;

    let tracing_config = TracingConfig {
        service_name: "wardgate".into(),
        log_format: LogFormat::from_str(&gateway_config.observability.log_format)?,
        log_level: gateway_config.observability.log_level.clone(),
    };
    init_tracing(&tracing_config)?;

    let addr = gateway_config
        .server
        .bind_address()
        .context("invalid server bind address")?;

    let state = AppState::from_config(gateway_config).context("failed to bootstrap gateway")?;
    let housekeeping = spawn_housekeeping(&state);
    let app = router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway address {addr}"))?;
    info!(%addr, "starting wardgate gateway");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    housekeeping.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
