use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use jobqueue_core::{Job, JobContext, JobQueueError, JobQueueResult, Parameters};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn, Instrument};

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl ShellTaskParams {
    pub fn from_parameters(parameters: &Parameters) -> JobQueueResult<Self> {
        serde_json::from_value(serde_json::Value::Object(parameters.as_map().clone()))
            .map_err(|e| JobQueueError::validation_error(format!("解析Shell任务参数失败: {e}")))
    }
}

/// 内置Job：以子进程运行 `command` 和 `args`，退出码为0即成功
#[derive(Default)]
pub struct ShellJob {
    ctx: Option<JobContext>,
}

impl ShellJob {
    pub const KIND: &'static str = "shell";

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Job for ShellJob {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn setup(&mut self, ctx: JobContext) -> JobQueueResult<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn execute(&mut self) -> JobQueueResult<bool> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| JobQueueError::job_execution("Shell任务未初始化"))?;
        let params = ShellTaskParams::from_parameters(&ctx.parameters().await)?;
        let span = ctx.span().clone();

        async move {
            info!("Running command: {} {:?}", params.command, params.args);

            let mut cmd = Command::new(&params.command);
            cmd.args(&params.args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(ref dir) = params.working_dir {
                cmd.current_dir(dir);
            }
            cmd.envs(&params.env_vars);

            let mut child = cmd
                .spawn()
                .map_err(|e| JobQueueError::job_execution(format!("启动Shell命令失败: {e}")))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| JobQueueError::job_execution("无法获取stdout"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| JobQueueError::job_execution("无法获取stderr"))?;

            let stdout_task = async {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(stream = "stdout", "{}", line);
                }
            };
            let stderr_task = async {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(stream = "stderr", "{}", line);
                }
            };
            tokio::join!(stdout_task, stderr_task);

            let status = child
                .wait()
                .await
                .map_err(|e| JobQueueError::job_execution(format!("等待进程结束失败: {e}")))?;

            if status.success() {
                info!("Command exited successfully");
            } else {
                warn!("Command exited with {:?}", status.code());
            }
            Ok(status.success())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shell_params_from_parameters() {
        let parameters = Parameters::new()
            .with("command", "echo")
            .with("args", json!(["hello", "world"]));
        let params = ShellTaskParams::from_parameters(&parameters).unwrap();
        assert_eq!(params.command, "echo");
        assert_eq!(params.args, vec!["hello", "world"]);
        assert!(params.working_dir.is_none());
        assert!(params.env_vars.is_empty());
    }

    #[test]
    fn test_shell_params_require_command() {
        let parameters = Parameters::new().with("args", json!(["x"]));
        assert!(matches!(
            ShellTaskParams::from_parameters(&parameters),
            Err(JobQueueError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_without_setup_fails() {
        let mut job = ShellJob::new();
        assert_eq!(job.kind(), "shell");
        assert!(job.execute().await.is_err());
    }
}
