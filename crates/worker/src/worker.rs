use std::any::Any;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::FutureExt;
use jobqueue_core::{
    Job, JobContext, JobQueueError, JobQueueResult, JobRegistry, Queue, Task, TaskHandle,
    TaskStatus, WorkerConfig,
};
use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, info_span, Instrument};

/// Worker状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Paused,
    Working,
}

/// 轮询队列并逐个执行任务的Worker
///
/// 单个Worker内部没有并发，同一时刻只执行一个任务。
/// 多个Worker可以同时连接同一个队列后端，任务的唯一执行权由 [`Queue::flag`] 保证。
pub struct Worker {
    name: String,
    profiles: Vec<String>,
    queue: Arc<dyn Queue>,
    registry: JobRegistry,
    config: WorkerConfig,
    state: RwLock<WorkerState>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        profiles: Vec<String>,
        queue: Arc<dyn Queue>,
        registry: JobRegistry,
        config: WorkerConfig,
    ) -> JobQueueResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(JobQueueError::validation_error("Worker名称不能为空"));
        }
        if profiles.is_empty() {
            return Err(JobQueueError::validation_error(format!(
                "Worker '{name}' 至少需要一个profile"
            )));
        }

        install_panic_hook();

        Ok(Self {
            name,
            profiles,
            queue,
            registry,
            config,
            state: RwLock::new(WorkerState::Paused),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// 运行轮询循环，直到收到停止信号或遇到错误
    ///
    /// 停止信号只在两次任务之间的休眠期间生效，正在执行的任务不会被中断。
    /// 任何执行错误都会结束循环并返回 `Err`，由外部进程管理器负责重启。
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> JobQueueResult<()> {
        let jitter = rand::rng().random_range(0..=self.config.startup_jitter_ms);
        if self
            .sleep(Duration::from_millis(jitter), &mut shutdown)
            .await
        {
            info!("Worker '{}' stopped", self.name);
            return Ok(());
        }

        info!(
            "Worker '{}' start taking tasks from {} queue with profile(s) {}",
            self.name,
            self.queue.name(),
            self.profiles.join(", ")
        );
        self.set_state(WorkerState::Working).await;

        let result = loop {
            let pause = match self.process_next().await {
                Ok(true) => self.config.cooldown(),
                Ok(false) => {
                    self.pause().await;
                    self.config.idle()
                }
                Err(e) => {
                    error!(worker = %self.name, "Worker '{}' failed: {}", self.name, e);
                    break Err(e);
                }
            };

            if self.sleep(pause, &mut shutdown).await {
                break Ok(());
            }
        };

        info!("Worker '{}' stopped", self.name);
        result
    }

    /// 取出并执行一个任务，队列中没有可执行任务时返回 `false`
    pub async fn process_next(&self) -> JobQueueResult<bool> {
        let Some(task) = self.queue.get_next_task(&self.profiles).await? else {
            return Ok(false);
        };
        self.set_state(WorkerState::Working).await;

        let id = task.id().ok_or_else(|| {
            JobQueueError::Internal(format!("队列返回了未持久化的任务 '{}'", task.tag()))
        })?;
        counter!("jobqueue_tasks_received_total", "profile" => task.profile().to_string())
            .increment(1);
        info!(
            tag = %task.tag(),
            job = %task.job(),
            priority = task.priority(),
            profile = %task.profile(),
            children = task.children().len(),
            "Worker '{}' received task '{}'",
            self.name,
            id
        );

        if !self.queue.flag(&task).await? {
            error!("Task '{}' can't be reserved by worker '{}'", id, self.name);
            return Err(JobQueueError::ReservationConflict { id });
        }

        let span = info_span!(
            "task",
            worker = %self.name,
            task_id = id,
            tag = %task.tag(),
            job = %task.job()
        );
        self.execute(task, span.clone()).instrument(span).await?;
        Ok(true)
    }

    async fn execute(&self, task: Task, span: tracing::Span) -> JobQueueResult<()> {
        let mut job = self.registry.create(task.job())?;
        let tag = task.tag().to_string();
        let handle: TaskHandle = Arc::new(RwLock::new(task));

        job.setup(JobContext::new(handle.clone(), self.queue.clone(), span))
            .await?;

        {
            let mut task = handle.write().await;
            task.transition_to(TaskStatus::Running)?;
            self.persist(&mut task).await?;
        }

        if self.run_job(job.as_mut(), &tag).await? {
            self.complete(&handle).await
        } else {
            let mut task = handle.write().await;
            task.transition_to(TaskStatus::Failed)?;
            self.persist(&mut task).await?;
            counter!("jobqueue_tasks_failed_total", "profile" => task.profile().to_string())
                .increment(1);
            info!("Task '{}' failed", tag);
            Ok(())
        }
    }

    async fn run_job(&self, job: &mut dyn Job, tag: &str) -> JobQueueResult<bool> {
        let execution = AssertUnwindSafe(job.execute()).catch_unwind();
        let outcome = match self.config.limits.max_execution() {
            Some(limit) => tokio::time::timeout(limit, execution).await.map_err(|_| {
                error!("Task '{}' exceeded the execution limit of {:?}", tag, limit);
                JobQueueError::job_execution(format!("任务 '{tag}' 执行超时 ({limit:?})"))
            })?,
            None => execution.await,
        };

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let (file, line) =
                    take_panic_location().unwrap_or_else(|| ("unknown".to_string(), 0));
                error!(context = %tag, file = %file, line, "Job panicked: {}", message);
                Err(JobQueueError::JobPanicked {
                    task: tag.to_string(),
                    message,
                })
            }
        }
    }

    /// 标记成功并入队子任务；没有子任务时直接标记完成
    async fn complete(&self, handle: &TaskHandle) -> JobQueueResult<()> {
        let mut task = handle.write().await;
        let children = task.take_children();
        task.transition_to(TaskStatus::Success)?;
        self.persist(&mut task).await?;
        counter!("jobqueue_tasks_succeeded_total", "profile" => task.profile().to_string())
            .increment(1);

        if children.is_empty() {
            task.transition_to(TaskStatus::Finished)?;
            self.persist(&mut task).await?;
            info!("Task '{}' finished", task);
            return Ok(());
        }

        let parent_id = task.id();
        for mut child in children {
            child.parent_id = parent_id;
            let child_id = self.queue.add(&mut child).await?;
            counter!("jobqueue_children_enqueued_total", "profile" => child.profile().to_string())
                .increment(1);
            debug!(
                "Child task '{}' ({}) of '{}' enqueued",
                child_id,
                child.tag(),
                task
            );
        }
        info!("Task '{}' succeeded", task);
        Ok(())
    }

    /// 写回本副本的改动并以写入后的内容作为新的基线
    async fn persist(&self, task: &mut Task) -> JobQueueResult<()> {
        self.queue.update(task).await?;
        task.mark_persisted();
        Ok(())
    }

    /// 每次进入暂停只记录一次日志
    async fn pause(&self) {
        let mut state = self.state.write().await;
        if *state == WorkerState::Working {
            info!("Worker '{}' paused", self.name);
        }
        *state = WorkerState::Paused;
        gauge!("jobqueue_worker_paused", "worker" => self.name.clone()).set(1.0);
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        if state == WorkerState::Working {
            gauge!("jobqueue_worker_paused", "worker" => self.name.clone()).set(0.0);
        }
    }

    /// 休眠期间收到停止信号时返回 `true`
    async fn sleep(&self, duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown.recv() => {
                info!("Worker '{}' received shutdown signal", self.name);
                true
            }
        }
    }
}

thread_local! {
    static PANIC_LOCATION: RefCell<Option<(String, u32)>> = const { RefCell::new(None) };
}

/// 在默认钩子之前记录panic位置
///
/// `catch_unwind` 在发生panic的线程上同一次poll内返回，随后的 [`take_panic_location`]
/// 读到的就是这次panic的位置。
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_LOCATION.with(|cell| {
                    *cell.borrow_mut() = Some((location.file().to_string(), location.line()));
                });
            }
            previous(info);
        }));
    });
}

fn take_panic_location() -> Option<(String, u32)> {
    PANIC_LOCATION.with(|cell| cell.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "未知panic");
    }

    #[test]
    fn test_panic_location_recorded() {
        install_panic_hook();
        take_panic_location();

        let result = std::panic::catch_unwind(|| panic!("located"));
        assert!(result.is_err());

        let (file, line) = take_panic_location().unwrap();
        assert!(file.ends_with("worker.rs"), "{file}");
        assert!(line > 0);
        assert!(take_panic_location().is_none());
    }
}
