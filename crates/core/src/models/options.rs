use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{JobQueueError, JobQueueResult};

pub const DEFAULT_PRIORITY: i64 = 1;
pub const DEFAULT_PROFILE: &str = "default";

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

/// 任务选项
///
/// `priority` 和 `profile` 是队列排序和分区所需的命名字段；
/// 其余Job特有的开关放在 `extra` 中，序列化时与命名字段平铺在同一个对象里。
/// `profile` 不能为空，只能通过 [`TaskOptions::set_profile`] 修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOptions {
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_profile")]
    profile: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            profile: default_profile(),
            extra: Map::new(),
        }
    }
}

impl TaskOptions {
    pub fn new(priority: i64, profile: impl Into<String>) -> Self {
        Self {
            priority,
            profile: profile.into(),
            extra: Map::new(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// 查找选项，不存在时返回 `None`
    pub fn option(&self, name: &str) -> Option<Value> {
        match name {
            "priority" => Some(Value::from(self.priority)),
            "profile" => Some(Value::from(self.profile.clone())),
            _ => self.extra.get(name).cloned(),
        }
    }

    pub fn require_option(&self, name: &str) -> JobQueueResult<Value> {
        self.option(name)
            .ok_or_else(|| JobQueueError::validation_error(format!("选项 '{name}' 未声明")))
    }

    /// 设置选项，`priority`/`profile` 会做类型检查
    pub fn set_option(&mut self, name: &str, value: Value) -> JobQueueResult<()> {
        match name {
            "priority" => {
                self.priority = value.as_i64().ok_or_else(|| {
                    JobQueueError::validation_error(format!("优先级必须是整数: {value}"))
                })?;
            }
            "profile" => {
                let profile = value.as_str().ok_or_else(|| {
                    JobQueueError::validation_error(format!("profile必须是字符串: {value}"))
                })?;
                self.set_profile(profile)?;
            }
            _ => {
                self.extra.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn set_profile(&mut self, profile: &str) -> JobQueueResult<()> {
        let profile = profile.trim();
        if profile.is_empty() {
            return Err(JobQueueError::validation_error("profile不能为空"));
        }
        self.profile = profile.to_string();
        Ok(())
    }

    /// 以 `overrides` 中出现的键覆盖当前选项，未出现的键保持原值
    pub fn merged_with(&self, overrides: &Map<String, Value>) -> JobQueueResult<TaskOptions> {
        let mut merged = self.clone();
        for (name, value) in overrides {
            merged.set_option(name, value.clone())?;
        }
        Ok(merged)
    }
}

/// Job输入参数
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn require(&self, name: &str) -> JobQueueResult<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| JobQueueError::validation_error(format!("参数 '{name}' 未声明")))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// 合并参数，`other` 中的值优先
    pub fn merge(&mut self, other: &Parameters) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
