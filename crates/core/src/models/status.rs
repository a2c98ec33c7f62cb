use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{JobQueueError, JobQueueResult};

/// 任务状态
///
/// # 状态流转
///
/// ```text
/// pending → waiting → running → success → finished
///                              ↘ failed
/// ```
///
/// - `Pending`: 尚未入队的任务实例
/// - `Waiting`: 已入队，等待Worker执行
/// - `Running`: 已被某个Worker预留并正在执行
/// - `Success`: Job执行成功，可能还有子任务在排队
/// - `Failed`: Job执行失败，终止状态，只能由运维显式修改
/// - `Finished`: 执行成功且没有派生子任务
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Waiting,
    Running,
    Success,
    Failed,
    Finished,
}

impl TaskStatus {
    pub fn all() -> [TaskStatus; 6] {
        [
            TaskStatus::Pending,
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Finished,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Finished => "finished",
        }
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Waiting)
                | (Waiting, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Success, Finished)
        )
    }

    /// 写入该状态时队列释放预留和出队标记
    pub fn releases_reservation(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Finished | TaskStatus::Pending
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = JobQueueError;

    fn from_str(s: &str) -> JobQueueResult<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "finished" => Ok(TaskStatus::Finished),
            _ => Err(JobQueueError::validation_error(format!(
                "状态 '{s}' 不存在，可选值: pending|waiting|running|success|failed|finished"
            ))),
        }
    }
}
