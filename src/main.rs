use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use jobqueue::app::Application;
use jobqueue::cli::{self, Cli};
use jobqueue_core::{init_logging, AppConfig, LogFormat, ObservabilityConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())
        .with_context(|| format!("加载配置失败: {:?}", cli.config))?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.observability.log_format = format.parse::<LogFormat>()?;
    }

    let _log_guard = init_logging(&config.observability)?;
    init_metrics(&config.observability)?;

    info!(
        "Starting jobqueue with {:?} backend, profiles {:?}",
        config.queue.backend, config.profiles
    );

    let app = Application::new(config).await?;
    let result = cli::execute(cli.command, &app).await;
    if let Err(ref e) = result {
        error!("{:#}", e);
    }
    result
}

/// 按配置启动Prometheus导出器
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
