use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Notification, Parameters, Task, TaskId, TaskNode, TaskOptions, TaskStatus};
use crate::errors::{JobQueueError, JobQueueResult};
use crate::job_registry::JobRegistry;

/// 任务的持久化文档，每个节点一份，子任务递归嵌套
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDocument {
    pub id: Option<TaskId>,
    pub tag: String,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    /// Job类型标识
    pub job: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub notification: Option<Notification>,
    #[serde(default)]
    pub children: Vec<TaskDocument>,
}

impl TaskDocument {
    fn from_node(node: &TaskNode) -> Self {
        let options = match serde_json::to_value(&node.options) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Self {
            id: node.id,
            tag: node.tag.clone(),
            parent_id: node.parent_id,
            job: node.job.clone(),
            status: node.status,
            progress: node.progress,
            created_at: node.created_at,
            scheduled_at: node.scheduled_at,
            options,
            parameters: node.parameters.clone(),
            notification: node.notification.clone(),
            children: Vec::new(),
        }
    }

    /// 在默认选项/参数之上恢复单个节点（不含子任务）
    fn into_node(
        self,
        options: TaskOptions,
        mut parameters: Parameters,
    ) -> JobQueueResult<(TaskNode, Vec<TaskDocument>)> {
        if self.tag.trim().is_empty() {
            return Err(JobQueueError::validation_error("任务标签不能为空"));
        }
        let options = options.merged_with(&self.options)?;
        parameters.merge(&self.parameters);

        let mut node = TaskNode::new(self.job, options, parameters);
        node.id = self.id;
        node.tag = self.tag;
        node.parent_id = self.parent_id;
        node.status = self.status;
        node.set_progress(self.progress)?;
        node.created_at = self.created_at;
        node.scheduled_at = self.scheduled_at;
        node.notification = self.notification;

        Ok((node, self.children))
    }

    /// 文档树中的节点总数（含自身）
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TaskDocument::node_count).sum::<usize>()
    }
}

/// 可单独写入的任务字段
///
/// `id`、`job`、`created_at` 在任务入队后不再变化，不在其列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskField {
    Tag,
    ParentId,
    Status,
    Progress,
    ScheduledAt,
    Options,
    Parameters,
    Notification,
    Children,
}

impl TaskField {
    pub const ALL: [TaskField; 9] = [
        TaskField::Tag,
        TaskField::ParentId,
        TaskField::Status,
        TaskField::Progress,
        TaskField::ScheduledAt,
        TaskField::Options,
        TaskField::Parameters,
        TaskField::Notification,
        TaskField::Children,
    ];

    /// 文档中的字段名
    pub fn name(&self) -> &'static str {
        match self {
            TaskField::Tag => "tag",
            TaskField::ParentId => "parent_id",
            TaskField::Status => "status",
            TaskField::Progress => "progress",
            TaskField::ScheduledAt => "scheduled_at",
            TaskField::Options => "options",
            TaskField::Parameters => "parameters",
            TaskField::Notification => "notification",
            TaskField::Children => "children",
        }
    }

    fn differs(&self, a: &TaskDocument, b: &TaskDocument) -> bool {
        match self {
            TaskField::Tag => a.tag != b.tag,
            TaskField::ParentId => a.parent_id != b.parent_id,
            TaskField::Status => a.status != b.status,
            TaskField::Progress => a.progress != b.progress,
            TaskField::ScheduledAt => a.scheduled_at != b.scheduled_at,
            TaskField::Options => a.options != b.options,
            TaskField::Parameters => a.parameters != b.parameters,
            TaskField::Notification => a.notification != b.notification,
            TaskField::Children => a.children != b.children,
        }
    }
}

impl TaskDocument {
    /// 只把 `fields` 列出的字段从 `source` 复制过来，其余字段保持不变
    pub fn apply_fields(&mut self, source: &TaskDocument, fields: &[TaskField]) {
        for field in fields {
            match field {
                TaskField::Tag => self.tag = source.tag.clone(),
                TaskField::ParentId => self.parent_id = source.parent_id,
                TaskField::Status => self.status = source.status,
                TaskField::Progress => self.progress = source.progress,
                TaskField::ScheduledAt => self.scheduled_at = source.scheduled_at,
                TaskField::Options => self.options = source.options.clone(),
                TaskField::Parameters => self.parameters = source.parameters.clone(),
                TaskField::Notification => self.notification = source.notification.clone(),
                TaskField::Children => self.children = source.children.clone(),
            }
        }
    }
}

impl Task {
    /// 记录当前内容为已持久化的基线
    ///
    /// 队列后端在 `add`、`get_task`、`get_next_task` 返回任务时调用，
    /// 写入方在自己的 `update` 成功后也应调用。
    pub fn mark_persisted(&mut self) {
        self.persisted = Some(Box::new(self.export()));
    }

    /// 相对基线被本副本修改过的字段；没有基线时返回全部字段
    ///
    /// 后端的 `update` 只写这些字段，另一方对其他字段的并发写入不会被旧副本覆盖。
    pub fn changed_fields(&self) -> Vec<TaskField> {
        match &self.persisted {
            None => TaskField::ALL.to_vec(),
            Some(baseline) => {
                let current = self.export();
                TaskField::ALL
                    .into_iter()
                    .filter(|field| field.differs(baseline, &current))
                    .collect()
            }
        }
    }

    /// 导出为递归文档
    pub fn export(&self) -> TaskDocument {
        self.export_node(self.tag())
    }

    fn export_node(&self, tag: &str) -> TaskDocument {
        let mut doc = match self.node(tag) {
            Some(node) => TaskDocument::from_node(node),
            None => TaskDocument::from_node(self.root()),
        };
        doc.children = self
            .children_of(tag)
            .iter()
            .map(|child| self.export_node(child.tag()))
            .collect();
        doc
    }

    pub fn to_json(&self) -> JobQueueResult<String> {
        Ok(serde_json::to_string(&self.export())?)
    }

    /// 从文档导入任务树
    ///
    /// 通过注册表查找Job类型，在其默认选项和参数之上应用文档中的值，
    /// 子任务先递归导入再挂到父任务下。
    pub fn import(doc: TaskDocument, registry: &JobRegistry) -> JobQueueResult<Task> {
        build(doc, &|kind| {
            Ok((registry.default_options(kind)?, registry.default_parameters(kind)?))
        })
    }

    pub fn from_json(json: &str, registry: &JobRegistry) -> JobQueueResult<Task> {
        let doc: TaskDocument = serde_json::from_str(json)?;
        Self::import(doc, registry)
    }
}

/// 不经过注册表的还原，供队列后端读取已持久化的任务
impl TryFrom<TaskDocument> for Task {
    type Error = JobQueueError;

    fn try_from(doc: TaskDocument) -> JobQueueResult<Self> {
        build(doc, &|_| Ok((TaskOptions::default(), Parameters::new())))
    }
}

type Defaults<'a> = dyn Fn(&str) -> JobQueueResult<(TaskOptions, Parameters)> + 'a;

fn build(doc: TaskDocument, defaults: &Defaults<'_>) -> JobQueueResult<Task> {
    let (options, parameters) = defaults(&doc.job)?;
    let (node, children) = doc.into_node(options, parameters)?;

    let mut task = Task::from_node(node);
    for child in children {
        let child = build(child, defaults)?;
        task.add_child(child)?;
    }
    Ok(task)
}
