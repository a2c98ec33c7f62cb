use async_trait::async_trait;

use crate::{
    models::{Task, TaskId},
    JobQueueResult,
};

/// 任务队列后端抽象接口
///
/// 后端负责任务的持久化、按 profile/优先级 排序的出队以及原子预留。
///
/// 多个 profile 的合并策略：在所有请求的 profile 上按
/// 优先级降序、`created_at` 升序、ID 升序进行全局排序。
#[async_trait]
pub trait Queue: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &str;

    /// 入队：分配ID，状态置为 `waiting` 并建立索引，传入的任务随即带上持久化基线
    async fn add(&self, task: &mut Task) -> JobQueueResult<TaskId>;

    /// 按ID查找任务，不存在时返回 `TaskNotFound`
    ///
    /// 返回的副本带有持久化基线，见 [`Task::changed_fields`]。
    async fn get_task(&self, id: TaskId) -> JobQueueResult<Task>;

    /// 取出给定 profile 中最优先的可执行任务
    ///
    /// 只返回处于 `waiting`、未被预留且调度时间已到的任务。
    /// 返回的任务会从就绪索引中移出，其他轮询者不会再拿到它。
    async fn get_next_task(&self, profiles: &[String]) -> JobQueueResult<Option<Task>>;

    /// 原子预留任务，只有赢得竞争的调用者得到 `true`
    ///
    /// 竞争失败不是错误；只有后端故障才返回 `Err`。
    async fn flag(&self, task: &Task) -> JobQueueResult<bool>;

    /// 持久化本副本相对基线改过的字段
    ///
    /// 其他字段保留存储中的值，两个副本分别修改不同字段时互不覆盖。
    /// 没有基线的副本（例如手工构造并设置ID的任务）会整体覆盖存储。
    /// 写入的状态决定索引：`waiting` 重新入队，`running` 记为运行中，
    /// [`crate::models::TaskStatus::releases_reservation`] 为真的状态释放预留。
    async fn update(&self, task: &Task) -> JobQueueResult<()>;

    /// 删除任务，不级联删除子任务
    async fn remove(&self, task: &Task) -> JobQueueResult<()>;

    /// 清除给定 profile 中所有 `waiting`/`pending` 任务，返回删除数量
    async fn flush(&self, profiles: &[String]) -> JobQueueResult<u64>;

    /// 将给定 profile 中卡在 `running` 的任务重置为 `waiting`，返回恢复数量
    async fn reboot(&self, profiles: &[String]) -> JobQueueResult<u64>;
}
