//! Redis队列集成测试，需要Docker：`cargo test -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use futures::future::join_all;
use jobqueue_core::{
    JobQueueError, Parameters, Queue, QueueBackend, QueueConfig, RedisConfig, Task, TaskOptions,
    TaskStatus,
};
use jobqueue_infrastructure::{QueueFactory, RedisQueue};
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

struct RedisSetup {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    queue: Arc<RedisQueue>,
}

impl RedisSetup {
    async fn new() -> Self {
        let container = Redis::default().with_tag("7-alpine").start().await.unwrap();
        let port = container.get_host_port_ipv4(6379).await.unwrap();
        let url = format!("redis://localhost:{port}");

        let queue = RedisQueue::connect(&url, "jqtest", Duration::from_secs(10))
            .await
            .unwrap();
        Self {
            container,
            queue: Arc::new(queue),
        }
    }
}

fn task(priority: i64, profile: &str) -> Task {
    Task::from_kind(
        "shell",
        TaskOptions::new(priority, profile),
        Parameters::new().with("command", "true"),
    )
}

fn profiles(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_add_get_and_order() {
    let setup = RedisSetup::new().await;
    let queue = setup.queue.clone();
    let base = Utc::now().trunc_subsecs(0) - chrono::Duration::seconds(60);

    let mut low = task(1, "p1");
    low.created_at = base;
    let mut high = task(5, "p1");
    high.created_at = base + chrono::Duration::seconds(5);
    let mut high_earlier = task(5, "p1");
    high_earlier.created_at = base + chrono::Duration::seconds(1);
    let mut other = task(9, "p2");

    let low_id = queue.add(&mut low).await.unwrap();
    let high_id = queue.add(&mut high).await.unwrap();
    let early_id = queue.add(&mut high_earlier).await.unwrap();
    queue.add(&mut other).await.unwrap();

    let stored = queue.get_task(high_id).await.unwrap();
    assert_eq!(stored.status(), TaskStatus::Waiting);
    assert_eq!(stored.export(), high.export());

    let p = profiles(&["p1"]);
    let mut order = Vec::new();
    while let Some(next) = queue.get_next_task(&p).await.unwrap() {
        assert_eq!(next.profile(), "p1");
        order.push(next.id().unwrap());
    }
    assert_eq!(order, vec![early_id, high_id, low_id]);

    assert!(matches!(
        queue.get_task(424242).await,
        Err(JobQueueError::TaskNotFound { .. })
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_order_exact_for_large_priorities() {
    let setup = RedisSetup::new().await;
    let queue = setup.queue.clone();
    let base = Utc::now().trunc_subsecs(0) - chrono::Duration::seconds(60);

    let mut expected = Vec::new();
    for priority in [i64::MAX, 9_007_199_254_740_993, 9_007_199_254_740_992, 1_000_000] {
        for offset in 0..3 {
            let mut t = task(priority, "p1");
            t.created_at = base + chrono::Duration::seconds(offset);
            expected.push(t);
        }
    }
    // 倒序入队，顺序只能来自索引
    let mut ids = Vec::new();
    for t in expected.iter_mut().rev() {
        ids.push(queue.add(t).await.unwrap());
    }
    ids.reverse();

    let p = profiles(&["p1"]);
    let mut order = Vec::new();
    while let Some(next) = queue.get_next_task(&p).await.unwrap() {
        order.push(next.id().unwrap());
    }
    assert_eq!(order, ids);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_update_keeps_concurrent_edit_of_other_fields() {
    let setup = RedisSetup::new().await;
    let queue = setup.queue.clone();
    let p = profiles(&["p1"]);
    let mut t = task(1, "p1");
    let id = queue.add(&mut t).await.unwrap();

    let mut worker_copy = queue.get_next_task(&p).await.unwrap().unwrap();
    assert!(queue.flag(&worker_copy).await.unwrap());
    worker_copy.transition_to(TaskStatus::Running).unwrap();
    queue.update(&worker_copy).await.unwrap();

    let mut operator_copy = queue.get_task(id).await.unwrap();
    operator_copy.options.priority = 9;
    queue.update(&operator_copy).await.unwrap();

    worker_copy.transition_to(TaskStatus::Success).unwrap();
    queue.update(&worker_copy).await.unwrap();

    let stored = queue.get_task(id).await.unwrap();
    assert_eq!(stored.priority(), 9);
    assert_eq!(stored.status(), TaskStatus::Success);

    // 改回 waiting 后按新的优先级重新入索引
    let mut operator_copy = queue.get_task(id).await.unwrap();
    operator_copy.set_status(TaskStatus::Waiting);
    queue.update(&operator_copy).await.unwrap();
    let mut low = task(5, "p1");
    queue.add(&mut low).await.unwrap();
    let next = queue.get_next_task(&p).await.unwrap().unwrap();
    assert_eq!(next.id(), Some(id));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_concurrent_flag_single_winner() {
    let setup = RedisSetup::new().await;
    let mut t = task(1, "p1");
    setup.queue.add(&mut t).await.unwrap();

    let attempts = (0..10).map(|_| {
        let queue = setup.queue.clone();
        let t = t.clone();
        async move { queue.flag(&t).await.unwrap() }
    });
    let results = join_all(attempts).await;
    assert_eq!(results.iter().filter(|won| **won).count(), 1);

    assert!(setup
        .queue
        .get_next_task(&profiles(&["p1"]))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_delayed_task_becomes_ready() {
    let setup = RedisSetup::new().await;
    let mut later = task(1, "p1").scheduled_at(Utc::now() + chrono::Duration::seconds(2));
    setup.queue.add(&mut later).await.unwrap();

    let p = profiles(&["p1"]);
    assert!(setup.queue.get_next_task(&p).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let next = setup.queue.get_next_task(&p).await.unwrap().unwrap();
    assert_eq!(next.id(), later.id());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_lifecycle_flush_and_reboot() {
    let setup = RedisSetup::new().await;
    let queue = setup.queue.clone();
    let p = profiles(&["p1"]);

    let mut a = task(3, "p1");
    let mut b = task(2, "p1");
    let mut c = task(1, "p1");
    queue.add(&mut a).await.unwrap();
    queue.add(&mut b).await.unwrap();
    queue.add(&mut c).await.unwrap();

    // a 执行中后进程崩溃
    let mut running = queue.get_next_task(&p).await.unwrap().unwrap();
    assert!(queue.flag(&running).await.unwrap());
    running.transition_to(TaskStatus::Running).unwrap();
    running.set_progress(0.4).unwrap();
    queue.update(&running).await.unwrap();

    // b 已出队但未预留
    let claimed = queue.get_next_task(&p).await.unwrap().unwrap();
    assert_eq!(claimed.id(), b.id());

    // 只有 c 可以被清除
    assert_eq!(queue.flush(&p).await.unwrap(), 1);
    assert!(queue.get_task(c.id().unwrap()).await.is_err());

    assert_eq!(queue.reboot(&p).await.unwrap(), 2);
    let restored = queue.get_task(running.id().unwrap()).await.unwrap();
    assert_eq!(restored.status(), TaskStatus::Waiting);
    assert_eq!(restored.progress(false), 0.4);

    let first = queue.get_next_task(&p).await.unwrap().unwrap();
    assert_eq!(first.id(), a.id());
    assert!(queue.flag(&first).await.unwrap());

    queue.remove(&first).await.unwrap();
    assert!(matches!(
        queue.remove(&first).await,
        Err(JobQueueError::TaskNotFound { .. })
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_factory_creates_redis_queue() {
    let container = Redis::default().with_tag("7-alpine").start().await.unwrap();
    let port = container.get_host_port_ipv4(6379).await.unwrap();

    let config = QueueConfig {
        backend: QueueBackend::Redis,
        key_prefix: "jqfactory".to_string(),
        redis: RedisConfig {
            host: "localhost".to_string(),
            port,
            ..RedisConfig::default()
        },
    };
    let queue = QueueFactory::create(&config).await.unwrap();
    assert_eq!(queue.name(), "redis");
}
