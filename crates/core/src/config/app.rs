use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{ObservabilityConfig, QueueConfig, WorkerConfig};
use crate::models::DEFAULT_PROFILE;

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/jobqueue.toml",
    "jobqueue.toml",
    "/etc/jobqueue/config.toml",
];

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    /// 声明的 profile，`queue flush/reboot` 和 `worker run` 未指定时使用
    pub profiles: Vec<String>,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            profiles: vec![DEFAULT_PROFILE.to_string()],
            worker: WorkerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML），未指定时依次尝试默认路径
    /// 3. 环境变量覆盖（前缀 `JOBQUEUE`，层级分隔符 `__`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBQUEUE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("profiles")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate().context("队列配置验证失败")?;

        if self.profiles.is_empty() {
            return Err(anyhow::anyhow!("至少需要声明一个profile"));
        }
        if self.profiles.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow::anyhow!("profile名称不能为空"));
        }

        self.worker.validate().context("Worker配置验证失败")?;

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}
