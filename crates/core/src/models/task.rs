use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use serde_json::{Map, Value};

use super::{Notification, Parameters, TaskDocument, TaskId, TaskOptions, TaskStatus};
use crate::errors::{JobQueueError, JobQueueResult};
use crate::traits::Job;

/// 任务树中的单个节点
///
/// 节点只保存自身数据；父子关系由所属的 [`Task`] 通过索引维护。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub(super) id: Option<TaskId>,
    pub(super) tag: String,
    pub parent_id: Option<TaskId>,
    pub(super) job: String,
    pub(super) status: TaskStatus,
    pub(super) progress: f64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub options: TaskOptions,
    pub parameters: Parameters,
    pub notification: Option<Notification>,
}

impl TaskNode {
    pub(crate) fn new(job: impl Into<String>, options: TaskOptions, parameters: Parameters) -> Self {
        Self {
            id: None,
            tag: generate_tag(),
            parent_id: None,
            job: job.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: Utc::now().trunc_subsecs(0),
            scheduled_at: None,
            options,
            parameters,
            notification: None,
        }
    }

    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Job类型标识，构造后不可变
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn priority(&self) -> i64 {
        self.options.priority
    }

    pub fn profile(&self) -> &str {
        self.options.profile()
    }

    /// 显式设置状态（运维编辑、导入、队列恢复）
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    /// 从字符串设置状态，未知状态直接失败
    pub fn set_status_str(&mut self, status: &str) -> JobQueueResult<()> {
        self.status = status.parse()?;
        Ok(())
    }

    /// 按状态机推进状态
    pub fn transition_to(&mut self, status: TaskStatus) -> JobQueueResult<()> {
        if !self.status.can_transition_to(status) {
            return Err(JobQueueError::validation_error(format!(
                "任务 '{}' 的状态不能从 {} 变为 {}",
                self.tag, self.status, status
            )));
        }
        self.status = status;
        Ok(())
    }

    /// 自身进度，范围 `[0, 1]`
    pub fn own_progress(&self) -> f64 {
        self.progress.clamp(0.0, 1.0)
    }

    pub fn set_progress(&mut self, progress: f64) -> JobQueueResult<()> {
        if !progress.is_finite() {
            return Err(JobQueueError::validation_error("进度必须是数字"));
        }
        if progress < 0.0 {
            return Err(JobQueueError::validation_error("进度必须大于等于0 (0%)"));
        }
        if progress > 1.0 {
            return Err(JobQueueError::validation_error("进度必须小于等于1 (100%)"));
        }
        self.progress = progress;
        Ok(())
    }

    /// 未设置调度时间或调度时间已到
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    pub(crate) fn set_id(&mut self, id: Option<TaskId>) {
        self.id = id;
    }
}

fn generate_tag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 子任务引用，可以是标签也可以是任务本身
#[derive(Debug, Clone, Copy)]
pub enum TagRef<'a> {
    Tag(&'a str),
    Task(&'a Task),
}

impl<'a> TagRef<'a> {
    pub fn as_tag(&self) -> &'a str {
        match self {
            TagRef::Tag(tag) => tag,
            TagRef::Task(task) => task.tag(),
        }
    }
}

impl<'a> From<&'a str> for TagRef<'a> {
    fn from(tag: &'a str) -> Self {
        TagRef::Tag(tag)
    }
}

impl<'a> From<&'a String> for TagRef<'a> {
    fn from(tag: &'a String) -> Self {
        TagRef::Tag(tag.as_str())
    }
}

impl<'a> From<&'a Task> for TagRef<'a> {
    fn from(task: &'a Task) -> Self {
        TagRef::Task(task)
    }
}

/// 任务树
///
/// 以扁平索引表示整棵子树：根节点即任务本身，后代节点按标签存放，
/// 父子关系通过 `children` / `parents` 两个索引维护，不存在节点之间的相互引用。
/// 进度汇总和后代计数都是在索引上的显式遍历。
///
/// `Task` 解引用为根节点 [`TaskNode`]，可直接读写根节点字段。
/// 从队列读出的副本带有持久化基线，见 [`Task::changed_fields`]。
#[derive(Debug, Clone)]
pub struct Task {
    root: TaskNode,
    descendants: HashMap<String, TaskNode>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, String>,
    pub(super) persisted: Option<Box<TaskDocument>>,
}

impl Task {
    /// 以Job的默认选项和参数创建任务
    pub fn new(job: &dyn Job) -> Self {
        Self::from_kind(job.kind(), job.default_options(), job.default_parameters())
    }

    pub fn from_kind(kind: impl Into<String>, options: TaskOptions, parameters: Parameters) -> Self {
        Self::from_node(TaskNode::new(kind, options, parameters))
    }

    pub(crate) fn from_node(root: TaskNode) -> Self {
        Self {
            root,
            descendants: HashMap::new(),
            children: HashMap::new(),
            parents: HashMap::new(),
            persisted: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> JobQueueResult<Self> {
        self.set_tag(tag)?;
        Ok(self)
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.root.options.priority = priority;
        self
    }

    pub fn with_profile(mut self, profile: &str) -> JobQueueResult<Self> {
        self.root.options.set_profile(profile)?;
        Ok(self)
    }

    /// 在Job默认选项之上覆盖选项，只覆盖 `overrides` 中出现的键
    pub fn with_options(mut self, overrides: Map<String, Value>) -> JobQueueResult<Self> {
        self.root.options = self.root.options.merged_with(&overrides)?;
        Ok(self)
    }

    /// 在Job默认参数之上覆盖参数
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.root.parameters.merge(&parameters);
        self
    }

    pub fn with_notification(mut self, notification: Notification) -> Self {
        self.root.notification = Some(notification);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.root.scheduled_at = Some(at.trunc_subsecs(0));
        self
    }

    /// 修改根节点标签，标签在树内必须唯一
    pub fn set_tag(&mut self, tag: impl Into<String>) -> JobQueueResult<()> {
        let tag = tag.into();
        if tag.trim().is_empty() {
            return Err(JobQueueError::validation_error("任务标签不能为空"));
        }
        if tag == self.root.tag {
            return Ok(());
        }
        if self.descendants.contains_key(&tag) {
            return Err(JobQueueError::validation_error(format!(
                "标签 '{tag}' 已被树中的其他任务使用"
            )));
        }

        let old = std::mem::replace(&mut self.root.tag, tag.clone());
        if let Some(direct) = self.children.remove(&old) {
            for child in &direct {
                self.parents.insert(child.clone(), tag.clone());
            }
            self.children.insert(tag, direct);
        }
        Ok(())
    }

    /// 设置持久化ID，并同步直接子任务的 `parent_id`
    pub fn set_id(&mut self, id: TaskId) {
        self.root.set_id(Some(id));
        for tag in self.children.get(&self.root.tag).cloned().unwrap_or_default() {
            if let Some(child) = self.descendants.get_mut(&tag) {
                child.parent_id = Some(id);
            }
        }
    }

    pub fn root(&self) -> &TaskNode {
        &self.root
    }

    pub fn node(&self, tag: &str) -> Option<&TaskNode> {
        if tag == self.root.tag {
            Some(&self.root)
        } else {
            self.descendants.get(tag)
        }
    }

    pub fn node_mut(&mut self, tag: &str) -> Option<&mut TaskNode> {
        if tag == self.root.tag {
            Some(&mut self.root)
        } else {
            self.descendants.get_mut(tag)
        }
    }

    /// 添加子任务
    ///
    /// 若已存在同标签的直接子任务则原位替换（与 [`Task::update_child`] 等价），
    /// 否则追加到末尾。子任务的 `parent_id` 会被设置为当前任务的ID。
    pub fn add_child(&mut self, child: Task) -> JobQueueResult<()> {
        let tag = child.root.tag.clone();
        if tag == self.root.tag {
            return Err(JobQueueError::validation_error(format!(
                "任务 '{tag}' 不能成为自己的子任务"
            )));
        }

        let position = self.direct_children().iter().position(|t| *t == tag);
        if position.is_none() && self.descendants.contains_key(&tag) {
            return Err(JobQueueError::validation_error(format!(
                "标签 '{tag}' 已被树中的其他任务使用"
            )));
        }

        let mut replaced = None;
        if position.is_some() {
            replaced = self.detach(&tag);
        }

        if let Some(conflict) = child
            .descendants
            .keys()
            .find(|t| **t == self.root.tag || self.descendants.contains_key(*t))
        {
            let conflict = conflict.clone();
            if let Some(previous) = replaced {
                self.attach(previous, position);
            }
            return Err(JobQueueError::validation_error(format!(
                "标签 '{conflict}' 已被树中的其他任务使用"
            )));
        }

        let mut child = child;
        child.root.parent_id = self.root.id;
        self.attach(child, position);
        Ok(())
    }

    /// 替换已存在的子任务
    pub fn update_child(&mut self, child: Task) -> JobQueueResult<()> {
        if !self.has_child(&child) {
            return Err(JobQueueError::ChildNotFound {
                tag: child.root.tag.clone(),
            });
        }
        self.add_child(child)
    }

    /// 移除直接子任务，返回被分离的子树
    pub fn remove_child<'a>(&mut self, child: impl Into<TagRef<'a>>) -> JobQueueResult<Task> {
        let tag = child.into().as_tag().to_string();
        if !self.has_child(tag.as_str()) {
            return Err(JobQueueError::ChildNotFound { tag });
        }
        self.detach(&tag)
            .ok_or(JobQueueError::ChildNotFound { tag })
    }

    pub fn has_child<'a>(&self, child: impl Into<TagRef<'a>>) -> bool {
        let tag = child.into().as_tag();
        self.direct_children().iter().any(|t| t == tag)
    }

    /// 直接子任务的子树副本
    pub fn child(&self, tag: &str) -> Option<Task> {
        if self.has_child(tag) {
            self.subtree(tag)
        } else {
            None
        }
    }

    pub fn child_node(&self, tag: &str) -> Option<&TaskNode> {
        if self.has_child(tag) {
            self.descendants.get(tag)
        } else {
            None
        }
    }

    /// 按插入顺序返回直接子任务
    pub fn children(&self) -> Vec<&TaskNode> {
        self.direct_children()
            .iter()
            .filter_map(|tag| self.descendants.get(tag))
            .collect()
    }

    /// 分离所有直接子任务（保留各自的子树）
    pub fn take_children(&mut self) -> Vec<Task> {
        let tags = self.direct_children().to_vec();
        tags.iter().filter_map(|tag| self.detach(tag)).collect()
    }

    /// 后代总数（不含自身）
    pub fn count_children(&self) -> usize {
        self.count_below(&self.root.tag)
    }

    fn count_below(&self, tag: &str) -> usize {
        self.children
            .get(tag)
            .map(|direct| direct.iter().map(|c| 1 + self.count_below(c)).sum())
            .unwrap_or(0)
    }

    /// 任务进度
    ///
    /// `cumulate` 为真时，将自身和全部后代的自身进度平铺求和，
    /// 再除以节点总数（`1 + count_children()`）。
    pub fn progress(&self, cumulate: bool) -> f64 {
        if !cumulate {
            return self.root.own_progress();
        }

        let total = self.sum_progress(&self.root.tag);
        let count = (self.count_children() + 1) as f64;
        (total / count).clamp(0.0, 1.0)
    }

    fn sum_progress(&self, tag: &str) -> f64 {
        let own = self.node(tag).map(TaskNode::own_progress).unwrap_or(0.0);
        own + self
            .children
            .get(tag)
            .map(|direct| direct.iter().map(|c| self.sum_progress(c)).sum::<f64>())
            .unwrap_or(0.0)
    }

    /// 向上取整的百分比进度
    pub fn progress_percent(&self, cumulate: bool) -> u8 {
        let percent = (self.progress(cumulate) * 100.0 - 1e-9).ceil();
        percent.clamp(0.0, 100.0) as u8
    }

    /// 父节点标签（根节点没有父节点）
    pub fn parent_of(&self, tag: &str) -> Option<&TaskNode> {
        self.parents.get(tag).and_then(|parent| self.node(parent))
    }

    pub fn children_of(&self, tag: &str) -> Vec<&TaskNode> {
        self.children
            .get(tag)
            .map(|direct| direct.iter().filter_map(|t| self.node(t)).collect())
            .unwrap_or_default()
    }

    /// 按先序遍历返回所有节点（含根节点）
    pub fn nodes(&self) -> Vec<&TaskNode> {
        let mut out = Vec::with_capacity(self.descendants.len() + 1);
        let mut stack = vec![self.root.tag.as_str()];
        while let Some(tag) = stack.pop() {
            if let Some(node) = self.node(tag) {
                out.push(node);
            }
            if let Some(direct) = self.children.get(tag) {
                stack.extend(direct.iter().rev().map(String::as_str));
            }
        }
        out
    }

    fn direct_children(&self) -> &[String] {
        self.children
            .get(&self.root.tag)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 复制以 `tag` 为根的子树
    fn subtree(&self, tag: &str) -> Option<Task> {
        let mut task = Task::from_node(self.node(tag)?.clone());

        let mut stack = vec![tag.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(direct) = self.children.get(&current) {
                task.children.insert(current.clone(), direct.clone());
                for child in direct {
                    task.parents.insert(child.clone(), current.clone());
                    if let Some(node) = self.descendants.get(child) {
                        task.descendants.insert(child.clone(), node.clone());
                    }
                    stack.push(child.clone());
                }
            }
        }
        Some(task)
    }

    /// 从树中分离以 `tag` 为根的子树
    fn detach(&mut self, tag: &str) -> Option<Task> {
        let subtree = self.subtree(tag)?;

        if let Some(parent) = self.parents.remove(tag) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|t| t != tag);
            }
        }
        for node in subtree.nodes() {
            self.descendants.remove(node.tag());
            self.children.remove(node.tag());
            if node.tag() != tag {
                self.parents.remove(node.tag());
            }
        }
        Some(subtree)
    }

    /// 将子树挂到根节点下，`position` 为 `None` 时追加
    fn attach(&mut self, child: Task, position: Option<usize>) {
        let Task {
            root,
            descendants,
            children,
            parents,
            ..
        } = child;
        let tag = root.tag.clone();

        let direct = self.children.entry(self.root.tag.clone()).or_default();
        match position {
            Some(index) if index <= direct.len() => direct.insert(index, tag.clone()),
            _ => direct.push(tag.clone()),
        }
        self.parents.insert(tag.clone(), self.root.tag.clone());
        self.descendants.insert(tag, root);
        self.descendants.extend(descendants);
        self.children.extend(children);
        self.parents.extend(parents);
    }
}

impl Deref for Task {
    type Target = TaskNode;

    fn deref(&self) -> &Self::Target {
        &self.root
    }
}

impl DerefMut for Task {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.root
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.descendants == other.descendants
            && self.children == other.children
            && self.parents == other.parents
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root.id {
            Some(id) => write!(f, "{id}"),
            None => f.write_str(&self.root.tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(tag: &str) -> Task {
        Task::from_kind("test", TaskOptions::default(), Parameters::new())
            .with_tag(tag)
            .unwrap()
    }

    #[test]
    fn test_auto_generated_tag() {
        let a = Task::from_kind("test", TaskOptions::default(), Parameters::new());
        let b = Task::from_kind("test", TaskOptions::default(), Parameters::new());
        assert!(!a.tag().is_empty());
        assert_ne!(a.tag(), b.tag());
        assert_eq!(a.status(), TaskStatus::Pending);
        assert_eq!(a.to_string(), a.tag());
    }

    #[test]
    fn test_progress_bounds() {
        let mut t = task("root");
        for p in [0.0, 0.25, 0.5, 1.0] {
            t.set_progress(p).unwrap();
            assert_eq!(t.progress(false), p);
        }
        assert!(matches!(t.set_progress(-0.01), Err(JobQueueError::Validation(_))));
        assert!(matches!(t.set_progress(1.01), Err(JobQueueError::Validation(_))));
        assert!(t.set_progress(f64::NAN).is_err());
        assert_eq!(t.progress(false), 1.0);
    }

    #[test]
    fn test_transition_enforced() {
        let mut t = task("root");
        assert!(t.transition_to(TaskStatus::Running).is_err());
        t.transition_to(TaskStatus::Waiting).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Failed).unwrap();
        assert!(t.transition_to(TaskStatus::Running).is_err());

        // 运维编辑不受状态机限制
        t.set_status(TaskStatus::Waiting);
        assert_eq!(t.status(), TaskStatus::Waiting);
        assert!(t.set_status_str("bogus").is_err());
        assert_eq!(t.status(), TaskStatus::Waiting);
    }

    #[test]
    fn test_set_id_stamps_children() {
        let mut parent = task("parent");
        parent.add_child(task("a")).unwrap();
        assert_eq!(parent.child_node("a").unwrap().parent_id, None);

        parent.set_id(7);
        assert_eq!(parent.child_node("a").unwrap().parent_id, Some(7));
        assert_eq!(parent.to_string(), "7");

        parent.add_child(task("b")).unwrap();
        assert_eq!(parent.child_node("b").unwrap().parent_id, Some(7));
    }

    #[test]
    fn test_tag_collision_elsewhere_in_tree() {
        let mut child = task("a");
        child.add_child(task("x")).unwrap();

        let mut parent = task("parent");
        parent.add_child(child).unwrap();

        let err = parent.add_child(task("x")).unwrap_err();
        assert!(matches!(err, JobQueueError::Validation(_)));
        assert!(parent.add_child(task("parent")).is_err());
        assert_eq!(parent.count_children(), 2);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut parent = task("parent");
        parent.add_child(task("a")).unwrap();
        parent.add_child(task("b")).unwrap();

        let mut replacement = task("a");
        replacement.set_progress(0.5).unwrap();
        parent.update_child(replacement).unwrap();

        let tags: Vec<_> = parent.children().iter().map(|c| c.tag().to_string()).collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(parent.child_node("a").unwrap().own_progress(), 0.5);
        assert!(matches!(
            parent.update_child(task("zzz")),
            Err(JobQueueError::ChildNotFound { .. })
        ));
    }

    #[test]
    fn test_rename_root_keeps_links() {
        let mut parent = task("parent");
        parent.add_child(task("a")).unwrap();
        parent.set_tag("renamed").unwrap();

        assert!(parent.has_child("a"));
        assert_eq!(parent.parent_of("a").unwrap().tag(), "renamed");
        assert!(parent.set_tag("a").is_err());
    }

    #[test]
    fn test_take_children() {
        let mut grand = task("a");
        grand.add_child(task("a1")).unwrap();
        let mut parent = task("parent");
        parent.add_child(grand).unwrap();
        parent.add_child(task("b")).unwrap();

        let taken = parent.take_children();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].tag(), "a");
        assert_eq!(taken[0].count_children(), 1);
        assert_eq!(parent.count_children(), 0);
        assert!(parent.nodes().len() == 1);
    }

    #[test]
    fn test_nodes_preorder() {
        let mut a = task("a");
        a.add_child(task("a1")).unwrap();
        let mut root = task("root");
        root.add_child(a).unwrap();
        root.add_child(task("b")).unwrap();

        let order: Vec<_> = root.nodes().iter().map(|n| n.tag().to_string()).collect();
        assert_eq!(order, vec!["root", "a", "a1", "b"]);
    }
}
