use thiserror::Error;

use crate::models::TaskId;

/// 任务队列错误类型定义
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// 无效的状态、越界的进度、缺失的必填选项/参数等
    #[error("数据验证失败: {0}")]
    Validation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: TaskId },

    #[error("子任务未找到: {tag}")]
    ChildNotFound { tag: String },

    /// 出队后预留失败，说明后端的出队/预留约束被破坏
    #[error("任务无法预留: {id}")]
    ReservationConflict { id: TaskId },

    #[error("未注册的Job类型: {0}")]
    UnknownJob(String),

    #[error("队列后端错误: {0}")]
    Backend(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("任务执行错误: {0}")]
    JobExecution(String),

    #[error("任务执行时发生panic: task={task}, {message}")]
    JobPanicked { task: String, message: String },

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type JobQueueResult<T> = std::result::Result<T, JobQueueError>;

impl JobQueueError {
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn task_not_found(id: TaskId) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }

    pub fn job_execution<S: Into<String>>(msg: S) -> Self {
        Self::JobExecution(msg.into())
    }

    /// Worker遇到这些错误时必须退出，交由外部进程管理器重启
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReservationConflict { .. }
                | Self::Backend(_)
                | Self::JobExecution(_)
                | Self::JobPanicked { .. }
                | Self::UnknownJob(_)
                | Self::Internal(_)
        )
    }
}

impl From<serde_json::Error> for JobQueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = JobQueueError::task_not_found(42);
        assert_eq!(err.to_string(), "任务未找到: 42");

        let err = JobQueueError::validation_error("进度必须在0到1之间");
        assert!(err.to_string().contains("进度必须在0到1之间"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(JobQueueError::ReservationConflict { id: 1 }.is_fatal());
        assert!(JobQueueError::backend("connection refused").is_fatal());
        assert!(!JobQueueError::validation_error("bad").is_fatal());
        assert!(!JobQueueError::task_not_found(1).is_fatal());
    }

    #[test]
    fn test_from_serde_json_error() {
        let err: JobQueueError = serde_json::from_str::<serde_json::Value>("{invalid")
            .unwrap_err()
            .into();
        assert!(matches!(err, JobQueueError::Serialization(_)));
    }
}
