//! 基于Redis的队列实现
//!
//! 任务以hash保存，每个 profile 维护就绪/延迟有序集合以及运行中、成员集合。
//! 出队和预留由Lua脚本完成，见 [`scripts`]。键布局和部署限制见 [`keys::KeyBuilder`]。

pub mod codec;
pub mod keys;
pub mod scripts;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobqueue_core::{JobQueueError, JobQueueResult, Queue, QueueConfig, Task, TaskId, TaskStatus};
use metrics::counter;
use redis::aio::ConnectionManager;
use tracing::{debug, error, info, warn};

use keys::{member, parse_member, KeyBuilder};
use scripts::Scripts;

fn backend_error(err: redis::RedisError) -> JobQueueError {
    counter!("jobqueue_backend_errors_total", "backend" => "redis").increment(1);
    error!("Redis queue operation failed: {}", err);
    JobQueueError::backend(err.to_string())
}

pub struct RedisQueue {
    conn: ConnectionManager,
    keys: KeyBuilder,
    scripts: Scripts,
    /// 写入预留标记的值，便于排查是哪个进程持有预留
    token: String,
}

impl RedisQueue {
    /// 连接Redis并校验连通性
    pub async fn new(config: &QueueConfig) -> JobQueueResult<Self> {
        let redis = &config.redis;
        info!(
            "Connecting Redis queue at {}:{}/{} (prefix '{}')",
            redis.host, redis.port, redis.database, config.key_prefix
        );

        Self::connect(
            &redis.build_url(),
            &config.key_prefix,
            Duration::from_secs(redis.connection_timeout_seconds),
        )
        .await
    }

    pub async fn connect(url: &str, key_prefix: &str, timeout: Duration) -> JobQueueResult<Self> {
        let client = redis::Client::open(url).map_err(backend_error)?;

        let mut conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| JobQueueError::backend(format!("连接Redis超时 ({}s)", timeout.as_secs())))?
            .map_err(backend_error)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        info!("Redis queue connected");

        Ok(Self {
            conn,
            keys: KeyBuilder::new(key_prefix),
            scripts: Scripts::load(),
            token: format!("pid-{}", std::process::id()),
        })
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    async fn load(&self, id: TaskId) -> JobQueueResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.task(id))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        if fields.is_empty() {
            return Ok(None);
        }
        let mut task = codec::decode(fields)?;
        task.mark_persisted();
        Ok(Some(task))
    }
}

fn persisted_id(task: &Task) -> JobQueueResult<TaskId> {
    task.id()
        .ok_or_else(|| JobQueueError::validation_error(format!("任务 '{}' 尚未入队", task.tag())))
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        "redis"
    }

    async fn add(&self, task: &mut Task) -> JobQueueResult<TaskId> {
        let mut conn = self.conn.clone();
        let id: TaskId = redis::cmd("INCR")
            .arg(self.keys.id_counter())
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        task.set_id(id);
        task.set_status(TaskStatus::Waiting);

        let mut invocation = self.scripts.add.prepare_invoke();
        invocation
            .arg(self.keys.prefix())
            .arg(id)
            .arg(member(id))
            .arg(Utc::now().timestamp());
        for (field, value) in codec::encode(task)? {
            invocation.arg(field).arg(value);
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
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
        self.load(id)
            .await?
            .ok_or_else(|| JobQueueError::task_not_found(id))
    }

    async fn get_next_task(&self, profiles: &[String]) -> JobQueueResult<Option<Task>> {
        if profiles.is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn.clone();
        loop {
            let mut invocation = self.scripts.get_next.prepare_invoke();
            invocation
                .arg(self.keys.prefix())
                .arg(Utc::now().timestamp());
            for profile in profiles {
                invocation.arg(profile);
            }
            let claimed: Option<String> = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(backend_error)?;

            let Some(raw) = claimed else {
                return Ok(None);
            };
            let Some(id) = parse_member(&raw) else {
                warn!("Ignoring malformed ready entry '{}'", raw);
                continue;
            };

            match self.load(id).await? {
                Some(task) => return Ok(Some(task)),
                None => {
                    // 出队与读取之间被删除
                    let _: i64 = redis::cmd("SREM")
                        .arg(self.keys.claimed())
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await
                        .map_err(backend_error)?;
                }
            }
        }
    }

    async fn flag(&self, task: &Task) -> JobQueueResult<bool> {
        let Some(id) = task.id() else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let won: i64 = self
            .scripts
            .flag
            .arg(self.keys.prefix())
            .arg(id)
            .arg(member(id))
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(won == 1)
    }

    async fn update(&self, task: &Task) -> JobQueueResult<()> {
        let id = persisted_id(task)?;
        let mut conn = self.conn.clone();

        let mut invocation = self.scripts.update.prepare_invoke();
        invocation
            .arg(self.keys.prefix())
            .arg(id)
            .arg(member(id))
            .arg(Utc::now().timestamp());
        for (field, value) in codec::encode_changes(task)? {
            invocation.arg(field).arg(value);
        }
        let result: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        if result < 0 {
            return Err(JobQueueError::task_not_found(id));
        }
        Ok(())
    }

    async fn remove(&self, task: &Task) -> JobQueueResult<()> {
        let id = persisted_id(task)?;
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .remove
            .arg(self.keys.prefix())
            .arg(id)
            .arg(member(id))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        if removed == 0 {
            return Err(JobQueueError::task_not_found(id));
        }
        Ok(())
    }

    async fn flush(&self, profiles: &[String]) -> JobQueueResult<u64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.flush.prepare_invoke();
        invocation.arg(self.keys.prefix());
        for profile in profiles {
            invocation.arg(profile);
        }
        let removed: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        info!("Flushed {} task(s) from profiles {:?}", removed, profiles);
        Ok(removed)
    }

    async fn reboot(&self, profiles: &[String]) -> JobQueueResult<u64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.reboot.prepare_invoke();
        invocation
            .arg(self.keys.prefix())
            .arg(Utc::now().timestamp());
        for profile in profiles {
            invocation.arg(profile);
        }
        let restored: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        info!("Rebooted {} task(s) in profiles {:?}", restored, profiles);
        Ok(restored)
    }
}
