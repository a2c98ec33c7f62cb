use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_core::{JobQueueError, JobQueueResult, Queue, Task, TaskField, TaskId, TaskStatus};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 就绪索引的排序键：优先级降序、创建时间升序、ID升序
type ReadyKey = (Reverse<i64>, DateTime<Utc>, TaskId);

fn ready_key(task: &Task, id: TaskId) -> ReadyKey {
    (Reverse(task.priority()), task.created_at, id)
}

#[derive(Debug, Default)]
struct State {
    next_id: TaskId,
    tasks: HashMap<TaskId, Task>,
    /// profile -> 等待执行的任务
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    /// 已出队但尚未预留
    claimed: HashSet<TaskId>,
    /// 已预留
    reserved: HashSet<TaskId>,
}

impl State {
    fn index(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            let key = ready_key(task, id);
            self.ready
                .entry(task.profile().to_string())
                .or_default()
                .insert(key);
        }
    }

    fn unindex(&mut self, task: &Task, id: TaskId) {
        if let Some(set) = self.ready.get_mut(task.profile()) {
            set.remove(&ready_key(task, id));
        }
    }

    fn release(&mut self, id: TaskId) {
        self.claimed.remove(&id);
        self.reserved.remove(&id);
    }

    fn delete(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        self.unindex(&task, id);
        self.release(id);
        Some(task)
    }
}

/// 进程内队列实现
///
/// 所有状态由一把互斥锁保护，出队和预留都是锁内的单点决策。
/// 适用于嵌入式运行和测试。
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前保存的任务数量
    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn persisted_id(task: &Task) -> JobQueueResult<TaskId> {
    task.id()
        .ok_or_else(|| JobQueueError::validation_error(format!("任务 '{}' 尚未入队", task.tag())))
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add(&self, task: &mut Task) -> JobQueueResult<TaskId> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;

        task.set_id(id);
        task.set_status(TaskStatus::Waiting);
        state.tasks.insert(id, task.clone());
        state.index(id);
        task.mark_persisted();

        debug!(
            "Task {} added to profile '{}' with priority {}",
            id,
            task.profile(),
            task.priority()
        );
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> JobQueueResult<Task> {
        let state = self.state.lock().await;
        let mut task = state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| JobQueueError::task_not_found(id))?;
        task.mark_persisted();
        Ok(task)
    }

    async fn get_next_task(&self, profiles: &[String]) -> JobQueueResult<Option<Task>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut best: Option<(String, ReadyKey)> = None;
        for profile in profiles {
            let Some(set) = state.ready.get(profile) else {
                continue;
            };
            let candidate = set.iter().find(|(_, _, id)| {
                state
                    .tasks
                    .get(id)
                    .map(|task| task.is_due(now))
                    .unwrap_or(false)
            });
            if let Some(key) = candidate {
                if best.as_ref().map(|(_, b)| key < b).unwrap_or(true) {
                    best = Some((profile.clone(), *key));
                }
            }
        }

        let Some((profile, key)) = best else {
            return Ok(None);
        };
        if let Some(set) = state.ready.get_mut(&profile) {
            set.remove(&key);
        }
        let id = key.2;
        state.claimed.insert(id);
        Ok(state.tasks.get(&id).cloned().map(|mut task| {
            task.mark_persisted();
            task
        }))
    }

    async fn flag(&self, task: &Task) -> JobQueueResult<bool> {
        let Some(id) = task.id() else {
            return Ok(false);
        };
        let mut state = self.state.lock().await;

        let stored = match state.tasks.get(&id) {
            Some(stored) if stored.status() == TaskStatus::Waiting => stored.clone(),
            _ => return Ok(false),
        };
        if !state.reserved.insert(id) {
            return Ok(false);
        }
        state.claimed.remove(&id);
        state.unindex(&stored, id);
        Ok(true)
    }

    async fn update(&self, task: &Task) -> JobQueueResult<()> {
        let id = persisted_id(task)?;
        let changed = task.changed_fields();
        let mut state = self.state.lock().await;

        let previous = state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| JobQueueError::task_not_found(id))?;
        // 只合并本副本改过的字段
        let merged = if changed.len() == TaskField::ALL.len() {
            task.clone()
        } else {
            let mut doc = previous.export();
            doc.apply_fields(&task.export(), &changed);
            Task::try_from(doc)?
        };
        let status = merged.status();

        state.unindex(&previous, id);
        state.tasks.insert(id, merged);

        if status.releases_reservation() {
            state.release(id);
        } else if status == TaskStatus::Waiting
            && !state.reserved.contains(&id)
            && !state.claimed.contains(&id)
        {
            state.index(id);
        }
        Ok(())
    }

    async fn remove(&self, task: &Task) -> JobQueueResult<()> {
        let id = persisted_id(task)?;
        let mut state = self.state.lock().await;
        state
            .delete(id)
            .map(|_| ())
            .ok_or_else(|| JobQueueError::task_not_found(id))
    }

    async fn flush(&self, profiles: &[String]) -> JobQueueResult<u64> {
        let mut state = self.state.lock().await;
        let doomed: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(id, task)| {
                profiles.iter().any(|p| p == task.profile())
                    && matches!(task.status(), TaskStatus::Waiting | TaskStatus::Pending)
                    && !state.reserved.contains(id)
                    && !state.claimed.contains(id)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &doomed {
            state.delete(*id);
        }
        info!("Flushed {} task(s) from profiles {:?}", doomed.len(), profiles);
        Ok(doomed.len() as u64)
    }

    async fn reboot(&self, profiles: &[String]) -> JobQueueResult<u64> {
        let mut state = self.state.lock().await;
        let stuck: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(id, task)| {
                profiles.iter().any(|p| p == task.profile())
                    && (task.status() == TaskStatus::Running
                        || (task.status() == TaskStatus::Waiting
                            && (state.claimed.contains(id) || state.reserved.contains(id))))
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stuck {
            state.release(*id);
            if let Some(task) = state.tasks.get_mut(id) {
                task.set_status(TaskStatus::Waiting);
            }
            state.index(*id);
        }
        info!("Rebooted {} task(s) in profiles {:?}", stuck.len(), profiles);
        Ok(stuck.len() as u64)
    }
}
