use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use jobqueue_core::{AppConfig, JobQueueResult, JobRegistry, Queue, Task, TaskId, TaskStatus};
use jobqueue_infrastructure::QueueFactory;
use jobqueue_worker::{ShellJob, Worker};
use tokio::sync::broadcast;
use tracing::info;

/// 运维人员对已持久化任务的修改
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskEdit {
    pub parent_id: Option<TaskId>,
    pub priority: Option<i64>,
    pub profile: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskEdit {
    pub fn is_empty(&self) -> bool {
        self == &TaskEdit::default()
    }

    /// 应用到任务上，返回任务是否发生变化
    ///
    /// 状态直接覆盖，不经过状态机校验。
    pub fn apply(&self, task: &mut Task) -> JobQueueResult<bool> {
        let mut changed = false;

        if let Some(parent_id) = self.parent_id {
            if task.parent_id != Some(parent_id) {
                task.parent_id = Some(parent_id);
                changed = true;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority() != priority {
                task.options.priority = priority;
                changed = true;
            }
        }
        if let Some(ref profile) = self.profile {
            if task.profile() != profile {
                task.options.set_profile(profile)?;
                changed = true;
            }
        }
        if let Some(status) = self.status {
            if task.status() != status {
                task.set_status(status);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// 组装队列后端和Job注册表，供CLI各命令使用
pub struct Application {
    config: AppConfig,
    queue: Arc<dyn Queue>,
    registry: JobRegistry,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate().context("配置验证失败")?;
        let queue = QueueFactory::create(&config.queue)
            .await
            .context("创建队列后端失败")?;
        let registry = default_registry()?;

        Ok(Self::with_queue(config, queue, registry))
    }

    pub fn with_queue(config: AppConfig, queue: Arc<dyn Queue>, registry: JobRegistry) -> Self {
        Self {
            config,
            queue,
            registry,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// 未指定时使用配置中的名称和profile
    pub fn worker(&self, name: Option<String>, profiles: Vec<String>) -> Result<Worker> {
        let name = name.unwrap_or_else(|| self.config.worker.name.clone());
        let profiles = if profiles.is_empty() {
            self.config.profiles.clone()
        } else {
            profiles
        };

        Ok(Worker::new(
            name,
            profiles,
            self.queue.clone(),
            self.registry.clone(),
            self.config.worker.clone(),
        )?)
    }

    pub async fn run_worker(
        &self,
        worker: Worker,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        worker
            .run(shutdown_rx)
            .await
            .with_context(|| format!("Worker '{}' 异常退出", worker.name()))
    }

    pub async fn show_task(&self, id: TaskId) -> Result<Task> {
        Ok(self.queue.get_task(id).await?)
    }

    /// 返回修改后的任务以及是否真正写入
    pub async fn edit_task(&self, id: TaskId, edit: &TaskEdit) -> Result<(Task, bool)> {
        let mut task = self.queue.get_task(id).await?;
        let changed = edit.apply(&mut task)?;
        if changed {
            self.queue.update(&task).await?;
            info!("Task '{}' edited: {:?}", id, edit);
        }
        Ok((task, changed))
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        let task = self.queue.get_task(id).await?;
        self.queue.remove(&task).await?;
        info!("Task '{}' deleted", id);
        Ok(())
    }

    /// 读取JSON任务文档并入队
    pub async fn import_task(&self, path: &Path) -> Result<TaskId> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("读取任务文档失败: {}", path.display()))?;
        let mut task = Task::from_json(&json, &self.registry)?;
        let id = self.queue.add(&mut task).await?;
        info!(
            "Task '{}' imported from {} with {} descendant(s)",
            id,
            path.display(),
            task.count_children()
        );
        Ok(id)
    }

    pub async fn flush(&self, profiles: &[String]) -> Result<u64> {
        Ok(self.queue.flush(&self.resolve_profiles(profiles)).await?)
    }

    pub async fn reboot(&self, profiles: &[String]) -> Result<u64> {
        Ok(self.queue.reboot(&self.resolve_profiles(profiles)).await?)
    }

    pub fn resolve_profiles(&self, profiles: &[String]) -> Vec<String> {
        if profiles.is_empty() {
            self.config.profiles.clone()
        } else {
            profiles.to_vec()
        }
    }
}

/// 内置Job注册表
pub fn default_registry() -> JobQueueResult<JobRegistry> {
    JobRegistry::new().with_job(|| Box::new(ShellJob::new()))
}
