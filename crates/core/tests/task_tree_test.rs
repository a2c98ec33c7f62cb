use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use jobqueue_core::{
    Job, JobContext, JobQueueError, JobQueueResult, JobRegistry, Notification, Parameters, Task,
    TaskOptions, TaskStatus,
};

struct Encode;

#[async_trait]
impl Job for Encode {
    fn kind(&self) -> &str {
        "encode"
    }

    fn default_options(&self) -> TaskOptions {
        let mut options = TaskOptions::new(2, "media");
        options.extra.insert("codec".into(), json!("h264"));
        options
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new().with("bitrate", 800)
    }

    async fn setup(&mut self, _ctx: JobContext) -> JobQueueResult<()> {
        Ok(())
    }

    async fn execute(&mut self) -> JobQueueResult<bool> {
        Ok(true)
    }
}

fn registry() -> JobRegistry {
    JobRegistry::new().with_job(|| Box::new(Encode)).unwrap()
}

fn tagged(tag: &str) -> Task {
    Task::new(&Encode).with_tag(tag).unwrap()
}

#[test]
fn test_new_task_inherits_job_defaults() {
    let task = Task::new(&Encode)
        .with_priority(9)
        .with_parameters(Parameters::new().with("bitrate", 1200));

    assert_eq!(task.job(), "encode");
    assert_eq!(task.priority(), 9);
    assert_eq!(task.profile(), "media");
    assert_eq!(task.options.option("codec"), Some(json!("h264")));
    assert_eq!(task.parameters.get("bitrate"), Some(&json!(1200)));
    assert_eq!(task.status(), TaskStatus::Pending);
    assert_eq!(task.id(), None);
}

#[test]
fn test_option_overrides_keep_unmentioned_job_defaults() {
    let task = Task::new(&Encode)
        .with_options(json!({"codec": "vp9"}).as_object().cloned().unwrap())
        .unwrap();
    assert_eq!(task.priority(), 2);
    assert_eq!(task.profile(), "media");
    assert_eq!(task.options.option("codec"), Some(json!("vp9")));

    let task = Task::new(&Encode)
        .with_options(json!({"priority": 7}).as_object().cloned().unwrap())
        .unwrap();
    assert_eq!(task.priority(), 7);
    assert_eq!(task.profile(), "media");
    assert_eq!(task.options.option("codec"), Some(json!("h264")));

    let rejected =
        Task::new(&Encode).with_options(json!({"priority": "high"}).as_object().cloned().unwrap());
    assert!(matches!(rejected, Err(JobQueueError::Validation(_))));
}

#[test]
fn test_childless_cumulative_progress_equals_own() {
    let mut task = tagged("solo");
    for p in [0.0, 0.333, 0.5, 1.0] {
        task.set_progress(p).unwrap();
        assert_eq!(task.progress(true), task.progress(false));
    }
}

#[test]
fn test_cumulative_progress_full_tree() {
    let mut root = tagged("root");
    root.set_progress(1.0).unwrap();
    for tag in ["a", "b"] {
        let mut child = tagged(tag);
        child.set_progress(1.0).unwrap();
        root.add_child(child).unwrap();
    }

    assert_eq!(root.count_children(), 2);
    assert_eq!(root.progress(true), 1.0);
    assert_eq!(root.progress_percent(true), 100);
}

#[test]
fn test_cumulative_progress_lags_and_rounds_up() {
    let mut root = tagged("root");
    root.set_progress(1.0).unwrap();

    let mut a = tagged("a");
    a.set_progress(0.5).unwrap();
    a.add_child(tagged("a1")).unwrap();
    root.add_child(a).unwrap();

    // (1.0 + 0.5 + 0.0) / 3 = 0.5
    assert_eq!(root.count_children(), 2);
    assert!((root.progress(true) - 0.5).abs() < 1e-12);
    assert_eq!(root.progress_percent(true), 50);
    assert_eq!(root.progress_percent(false), 100);

    root.node_mut("a1").unwrap().set_progress(0.01).unwrap();
    // 1.51 / 3 = 0.50333.. 向上取整为 51%
    assert_eq!(root.progress_percent(true), 51);
}

#[test]
fn test_add_child_is_idempotent() {
    let mut root = tagged("root");
    root.add_child(tagged("a")).unwrap();
    root.add_child(tagged("a")).unwrap();

    assert_eq!(root.children().len(), 1);
    assert_eq!(root.count_children(), 1);
    assert!(root.has_child("a"));
}

#[test]
fn test_remove_child_reverses_add() {
    let mut root = tagged("root");
    root.add_child(tagged("a")).unwrap();
    let before = root.count_children();

    let mut b = tagged("b");
    b.add_child(tagged("b1")).unwrap();
    root.add_child(b.clone()).unwrap();
    assert_eq!(root.count_children(), before + 2);
    assert!(root.has_child(&b));

    let removed = root.remove_child(&b).unwrap();
    assert_eq!(removed.count_children(), 1);
    assert_eq!(root.count_children(), before);
    assert!(!root.has_child("b"));
    assert!(root.node("b1").is_none());

    assert!(matches!(
        root.remove_child("b"),
        Err(JobQueueError::ChildNotFound { .. })
    ));
}

#[test]
fn test_child_returns_subtree_copy() {
    let mut a = tagged("a");
    a.add_child(tagged("a1")).unwrap();
    let mut root = tagged("root");
    root.add_child(a).unwrap();

    let copy = root.child("a").unwrap();
    assert_eq!(copy.tag(), "a");
    assert!(copy.has_child("a1"));
    assert!(root.child("a1").is_none(), "只查找直接子任务");
}

#[test]
fn test_export_import_roundtrip() {
    let registry = registry();

    let mut root = tagged("root")
        .with_notification(
            Notification::new(vec!["email".into()])
                .on_success("done")
                .on_failure("failed"),
        )
        .scheduled_at(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap());
    root.set_progress(0.25).unwrap();

    let mut a = tagged("a");
    a.add_child(tagged("a1")).unwrap();
    root.add_child(a).unwrap();
    root.add_child(tagged("b")).unwrap();
    root.set_id(10);
    root.node_mut("a").unwrap().set_status(TaskStatus::Success);

    let json = root.to_json().unwrap();
    let imported = Task::from_json(&json, &registry).unwrap();

    assert_eq!(imported.id(), Some(10));
    assert_eq!(imported.tag(), "root");
    assert_eq!(imported.count_children(), 3);
    assert_eq!(imported.child_node("a").unwrap().parent_id, Some(10));
    assert_eq!(imported.node("a").unwrap().status(), TaskStatus::Success);
    assert_eq!(imported.notification, root.notification);
    assert_eq!(imported.scheduled_at, root.scheduled_at);
    assert_eq!(imported.created_at, root.created_at);
    assert_eq!(imported.progress(false), 0.25);
    assert_eq!(imported.export(), root.export());
}

#[test]
fn test_import_applies_defaults_under_persisted_values() {
    let registry = registry();
    let imported = Task::from_json(
        r#"{"id": 4, "tag": "t", "job": "encode", "created_at": 0,
            "options": {"priority": 7}, "parameters": {"input": "a.mov"}}"#,
        &registry,
    )
    .unwrap();

    assert_eq!(imported.priority(), 7);
    assert_eq!(imported.profile(), "media");
    assert_eq!(imported.options.option("codec"), Some(json!("h264")));
    assert_eq!(imported.parameters.get("bitrate"), Some(&json!(800)));
    assert_eq!(imported.parameters.get("input"), Some(&json!("a.mov")));
}

#[test]
fn test_import_unknown_job_kind() {
    let err = Task::from_json(
        r#"{"id": null, "tag": "t", "job": "nope", "created_at": 0}"#,
        &registry(),
    )
    .unwrap_err();
    assert!(matches!(err, JobQueueError::UnknownJob(kind) if kind == "nope"));
}

#[test]
fn test_import_rejects_duplicate_tags() {
    let err = Task::from_json(
        r#"{"id": null, "tag": "t", "job": "encode", "created_at": 0, "children": [
            {"id": null, "tag": "x", "job": "encode", "created_at": 0, "children": [
                {"id": null, "tag": "y", "job": "encode", "created_at": 0}
            ]},
            {"id": null, "tag": "y", "job": "encode", "created_at": 0}
        ]}"#,
        &registry(),
    )
    .unwrap_err();
    assert!(matches!(err, JobQueueError::Validation(_)));
}
