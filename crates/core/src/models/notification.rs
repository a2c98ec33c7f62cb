use serde::{Deserialize, Serialize};

/// 任务通知策略
///
/// 只描述通知的渠道和模板，投递由外部服务负责。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_template: Option<String>,
}

impl Notification {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            ..Default::default()
        }
    }

    pub fn on_success(mut self, template: impl Into<String>) -> Self {
        self.success_template = Some(template.into());
        self
    }

    pub fn on_failure(mut self, template: impl Into<String>) -> Self {
        self.failure_template = Some(template.into());
        self
    }
}
