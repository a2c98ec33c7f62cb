//! Job能力接口
//!
//! Job是任务的可执行载荷，由业务模块实现并注册到 [`crate::JobRegistry`]。
//! Worker在执行前调用 [`Job::setup`] 传入 [`JobContext`]，随后调用
//! [`Job::execute`]，返回 `true` 表示成功，`false` 表示失败。
//!
//! ```rust,ignore
//! struct Transcode {
//!     ctx: Option<JobContext>,
//! }
//!
//! #[async_trait]
//! impl Job for Transcode {
//!     fn kind(&self) -> &str {
//!         "transcode"
//!     }
//!
//!     async fn setup(&mut self, ctx: JobContext) -> JobQueueResult<()> {
//!         self.ctx = Some(ctx);
//!         Ok(())
//!     }
//!
//!     async fn execute(&mut self) -> JobQueueResult<bool> {
//!         let ctx = self.ctx.as_ref().ok_or_else(|| JobQueueError::job_execution("未初始化"))?;
//!         ctx.set_progress(0.5).await?;
//!         ctx.spawn_child(Task::from_kind("thumbnail", TaskOptions::default(), Parameters::new()))
//!             .await?;
//!         Ok(true)
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::Span;

use super::Queue;
use crate::{
    models::{Parameters, Task, TaskId, TaskOptions},
    JobQueueResult,
};

/// Worker与Job共享的任务句柄
pub type TaskHandle = Arc<RwLock<Task>>;

/// Job执行上下文：任务、队列和日志Span
#[derive(Clone)]
pub struct JobContext {
    task: TaskHandle,
    queue: Arc<dyn Queue>,
    span: Span,
}

impl JobContext {
    pub fn new(task: TaskHandle, queue: Arc<dyn Queue>, span: Span) -> Self {
        Self { task, queue, span }
    }

    pub fn task(&self) -> &TaskHandle {
        &self.task
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// 带有 worker/task_id/tag/job 字段的日志Span
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub async fn task_id(&self) -> Option<TaskId> {
        self.task.read().await.id()
    }

    pub async fn parameters(&self) -> Parameters {
        self.task.read().await.parameters.clone()
    }

    pub async fn option(&self, name: &str) -> Option<Value> {
        self.task.read().await.options.option(name)
    }

    /// 更新任务自身进度并立即持久化
    pub async fn set_progress(&self, progress: f64) -> JobQueueResult<()> {
        let mut task = self.task.write().await;
        task.set_progress(progress)?;
        self.queue.update(&task).await?;
        task.mark_persisted();
        Ok(())
    }

    /// 派生子任务，任务成功后由Worker入队
    pub async fn spawn_child(&self, child: Task) -> JobQueueResult<()> {
        self.task.write().await.add_child(child)
    }
}

/// Job能力接口
#[async_trait]
pub trait Job: Send {
    /// 稳定的Job类型标识，用于持久化和注册表查找
    fn kind(&self) -> &str;

    fn default_options(&self) -> TaskOptions {
        TaskOptions::default()
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    async fn setup(&mut self, ctx: JobContext) -> JobQueueResult<()>;

    async fn execute(&mut self) -> JobQueueResult<bool>;
}
