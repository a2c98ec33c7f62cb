//! 配置管理
//!
//! 配置由TOML文件和 `JOBQUEUE__` 前缀的环境变量组成，例如
//! `JOBQUEUE__QUEUE__BACKEND=memory`、`JOBQUEUE__PROFILES=p1,p2`。

pub mod app;
pub mod observability;
pub mod queue;
pub mod worker;

pub use app::AppConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use queue::{QueueBackend, QueueConfig, RedisConfig};
pub use worker::{default_worker_name, ResourceLimits, WorkerConfig};
