use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker默认名称：`主机名-进程ID`
pub fn default_worker_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    /// 每个任务执行完后的冷却时间
    pub cooldown_seconds: u64,
    /// 没有可执行任务时的休眠时间
    pub idle_seconds: u64,
    /// 首次轮询前的随机抖动上限（毫秒）
    pub startup_jitter_ms: u64,
    pub limits: ResourceLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            cooldown_seconds: 3,
            idle_seconds: 15,
            startup_jitter_ms: 3,
            limits: ResourceLimits::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker名称不能为空"));
        }
        self.limits.validate()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_seconds)
    }
}

/// Worker资源限制
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    /// 单个Job的最长执行时间，`None` 表示不限制
    pub max_execution_seconds: Option<u64>,
}

impl ResourceLimits {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_execution_seconds == Some(0) {
            return Err(anyhow::anyhow!("最长执行时间必须大于0"));
        }
        Ok(())
    }

    pub fn max_execution(&self) -> Option<Duration> {
        self.max_execution_seconds.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.name.ends_with(&format!("-{}", std::process::id())));
        assert_eq!(config.cooldown(), Duration::from_secs(3));
        assert_eq!(config.idle(), Duration::from_secs(15));
        assert_eq!(config.limits.max_execution(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let limits = ResourceLimits {
            max_execution_seconds: Some(0),
        };
        assert!(limits.validate().is_err());
    }
}
