//! # 数据模型
//!
//! 任务树、状态机以及任务的持久化文档格式。
//!
//! ## 任务状态流转
//!
//! ```text
//! pending → waiting → running → success → finished
//!                              ↘ failed
//! ```
//!
//! `failed` 是终止状态，恢复需要运维显式修改状态；不存在自动重试。

pub mod document;
pub mod notification;
pub mod options;
pub mod status;
pub mod task;

pub use document::*;
pub use notification::*;
pub use options::*;
pub use status::*;
pub use task::*;

/// 后端分配的任务ID
pub type TaskId = i64;
