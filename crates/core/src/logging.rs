use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{LogFormat, ObservabilityConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的日志级别。配置了 `log_directory` 时额外输出按天滚动的
/// 日志文件，返回的guard需要保持到进程退出。
pub fn init_logging(config: &ObservabilityConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("解析日志级别失败")?;

    let mut layers: Vec<BoxedLayer> = vec![format_layer(config.log_format, std::io::stderr, true)];

    let mut guard = None;
    if let Some(dir) = &config.log_directory {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("创建日志目录失败: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, "jobqueue.log");
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(config.log_format, writer, false));
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("初始化日志系统失败")?;

    Ok(guard)
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);

    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}
