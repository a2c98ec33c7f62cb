use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    models::{Parameters, TaskOptions},
    traits::Job,
    JobQueueError, JobQueueResult,
};

pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// Job类型注册表
///
/// 将Job类型标识映射到创建默认实例的工厂，导入任务和Worker执行任务时
/// 都通过注册表实例化Job。
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册Job工厂，以工厂产出实例的 `kind()` 作为键
    pub fn register<F>(&mut self, factory: F) -> JobQueueResult<()>
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        let kind = factory().kind().to_string();
        if kind.trim().is_empty() {
            return Err(JobQueueError::validation_error("Job类型标识不能为空"));
        }
        if self.factories.contains_key(&kind) {
            return Err(JobQueueError::validation_error(format!(
                "Job类型 '{kind}' 已注册"
            )));
        }
        self.factories.insert(kind, Arc::new(factory));
        Ok(())
    }

    pub fn with_job<F>(mut self, factory: F) -> JobQueueResult<Self>
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        self.register(factory)?;
        Ok(self)
    }

    pub fn create(&self, kind: &str) -> JobQueueResult<Box<dyn Job>> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| JobQueueError::UnknownJob(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn default_options(&self, kind: &str) -> JobQueueResult<TaskOptions> {
        Ok(self.create(kind)?.default_options())
    }

    pub fn default_parameters(&self, kind: &str) -> JobQueueResult<Parameters> {
        Ok(self.create(kind)?.default_parameters())
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
