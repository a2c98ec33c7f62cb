//! # jobqueue-core
//!
//! 分层任务队列的核心模型与接口：任务树及其状态机、任务文档、
//! Job/Queue 抽象、Job注册表、配置与日志初始化。

pub mod config;
pub mod errors;
pub mod job_registry;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, LogFormat, ObservabilityConfig, QueueBackend, QueueConfig, RedisConfig,
    ResourceLimits, WorkerConfig,
};
pub use errors::*;
pub use job_registry::*;
pub use logging::init_logging;
pub use models::*;
pub use traits::*;
