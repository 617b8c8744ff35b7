use anyhow::Result;
use clap::Parser;
use minermon_rs::api::ApiServer;
use minermon_rs::config::{Args, Config};
use minermon_rs::monitor::MonitorManager;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        return;
    }

    let mut config = match Config::load_or_default(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return;
        }
    };

    // 命令行覆盖配置文件
    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if args.no_api {
        config.api.enabled = false;
    }

    info!("Starting MinerMon-RS v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", args.config);

    let monitor = match MonitorManager::new(config.clone()).await {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Failed to create monitor manager: {}", e);
            return;
        }
    };

    if let Err(e) = monitor.start().await {
        error!("Failed to start monitor manager: {}", e);
        return;
    }

    let api_server = ApiServer::new(config.api.clone(), monitor.clone());
    if let Err(e) = api_server.start().await {
        error!("Failed to start API server: {}", e);
        let _ = monitor.stop().await;
        return;
    }

    if let Err(e) = wait_for_shutdown().await {
        error!("Error waiting for signal: {}", e);
    }
    info!("Received shutdown signal");

    if let Err(e) = api_server.stop().await {
        error!("Error stopping API server: {}", e);
    }
    if let Err(e) = monitor.stop().await {
        error!("Error during shutdown: {}", e);
    }
    info!("Monitor stopped gracefully");
}

fn init_logging(level: &str) -> Result<()> {
    let default_filter = format!("minermon_rs={}", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
