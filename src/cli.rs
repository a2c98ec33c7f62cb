use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use jobqueue_core::{Task, TaskId, TaskStatus};

use crate::app::{Application, TaskEdit};
use crate::shutdown::{wait_for_signal, ShutdownManager};

/// 分层后台任务队列
#[derive(Parser, Debug)]
#[command(name = "jobqueue")]
#[command(version)]
#[command(about = "分层后台任务队列 - Worker与运维工具")]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// 日志格式 (pretty, json, compact)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Worker管理
    Worker(WorkerCommands),
    /// 任务管理
    Task(TaskCommands),
    /// 队列维护
    Queue(QueueCommands),
}

#[derive(Args, Debug)]
pub struct WorkerCommands {
    #[command(subcommand)]
    pub action: WorkerActions,
}

#[derive(Subcommand, Debug)]
pub enum WorkerActions {
    /// 启动Worker，直到收到 Ctrl+C 或 SIGTERM
    Run {
        /// Worker名称，默认 `主机名-进程ID`
        #[arg(short, long)]
        name: Option<String>,
        /// 服务的profile，可重复指定
        #[arg(short, long = "profile")]
        profiles: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct TaskCommands {
    #[command(subcommand)]
    pub action: TaskActions,
}

#[derive(Subcommand, Debug)]
pub enum TaskActions {
    /// 查看任务
    Show { id: TaskId },
    /// 修改任务的父任务、优先级、profile或状态
    Edit {
        id: TaskId,
        #[arg(long)]
        parent_id: Option<TaskId>,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// 删除任务
    Delete { id: TaskId },
    /// 从JSON任务文档导入并入队
    Import { file: PathBuf },
}

#[derive(Args, Debug)]
pub struct QueueCommands {
    #[command(subcommand)]
    pub action: QueueActions,
}

#[derive(Subcommand, Debug)]
pub enum QueueActions {
    /// 清除等待中的任务
    Flush {
        #[arg(short, long = "profile")]
        profiles: Vec<String>,
        /// 跳过确认
        #[arg(short, long)]
        yes: bool,
    },
    /// 把卡在运行中的任务重置为等待
    Reboot {
        #[arg(short, long = "profile")]
        profiles: Vec<String>,
        /// 跳过确认
        #[arg(short, long)]
        yes: bool,
    },
}

pub async fn execute(command: Commands, app: &Application) -> Result<()> {
    match command {
        Commands::Worker(cmd) => match cmd.action {
            WorkerActions::Run { name, profiles } => run_worker(app, name, profiles).await,
        },
        Commands::Task(cmd) => handle_task(cmd.action, app).await,
        Commands::Queue(cmd) => handle_queue(cmd.action, app).await,
    }
}

async fn run_worker(app: &Application, name: Option<String>, profiles: Vec<String>) -> Result<()> {
    let worker = app.worker(name, profiles)?;
    let shutdown = ShutdownManager::new();
    let shutdown_rx = shutdown.subscribe().await;

    let run = app.run_worker(worker, shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        _ = wait_for_signal() => {}
    }

    shutdown.shutdown().await;
    run.await
}

async fn handle_task(action: TaskActions, app: &Application) -> Result<()> {
    match action {
        TaskActions::Show { id } => {
            let task = app.show_task(id).await?;
            print!("{}", render_task(&task));
        }
        TaskActions::Edit {
            id,
            parent_id,
            priority,
            profile,
            status,
        } => {
            let edit = TaskEdit {
                parent_id,
                priority,
                profile,
                status,
            };
            let (task, changed) = app.edit_task(id, &edit).await?;
            if changed {
                println!("Task '{id}' has been updated.");
            } else {
                println!("Nothing to update on Task '{id}'.");
            }
            print!("{}", render_task(&task));
        }
        TaskActions::Delete { id } => {
            app.delete_task(id).await?;
            println!("Task '{id}' has been deleted.");
        }
        TaskActions::Import { file } => {
            let id = app.import_task(&file).await?;
            println!("Task '{id}' has been added to the queue.");
        }
    }
    Ok(())
}

async fn handle_queue(action: QueueActions, app: &Application) -> Result<()> {
    match action {
        QueueActions::Flush { profiles, yes } => {
            let profiles = app.resolve_profiles(&profiles);
            let prompt = format!(
                "Flush all waiting tasks from profile(s) {}?",
                profiles.join(", ")
            );
            if !yes && !confirm(&prompt)? {
                println!("Flush cancelled.");
                return Ok(());
            }
            let removed = app.flush(&profiles).await?;
            println!("{removed} task(s) flushed.");
        }
        QueueActions::Reboot { profiles, yes } => {
            let profiles = app.resolve_profiles(&profiles);
            let prompt = format!(
                "Reset running tasks of profile(s) {} to waiting? Make sure no worker is running.",
                profiles.join(", ")
            );
            if !yes && !confirm(&prompt)? {
                println!("Reboot cancelled.");
                return Ok(());
            }
            let restored = app.reboot(&profiles).await?;
            println!("{restored} task(s) rebooted.");
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} (y/N) ");
    io::stdout().flush()?;
    read_confirmation(io::stdin().lock())
}

fn read_confirmation(mut input: impl BufRead) -> Result<bool> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// 以键值表格展示任务
pub fn render_task(task: &Task) -> String {
    let optional = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
    let rows = vec![
        ("ID", optional(task.id().map(|id| id.to_string()))),
        ("Tag", task.tag().to_string()),
        ("Parent ID", optional(task.parent_id.map(|id| id.to_string()))),
        ("Job", task.job().to_string()),
        ("Status", task.status().to_string()),
        ("Priority", task.priority().to_string()),
        ("Profile", task.profile().to_string()),
        ("Progress", format!("{}%", task.progress_percent(true))),
        ("Children", task.count_children().to_string()),
        ("Created at", task.created_at.to_rfc3339()),
        (
            "Scheduled at",
            optional(task.scheduled_at.map(|at| at.to_rfc3339())),
        ),
        ("Parameters", serde_json::Value::Object(task.parameters.as_map().clone()).to_string()),
    ];

    let key_width = rows
        .iter()
        .map(|(key, _)| key.len())
        .max()
        .unwrap_or(0)
        .max("Key".len());
    let value_width = rows
        .iter()
        .map(|(_, value)| value.chars().count())
        .max()
        .unwrap_or(0)
        .max("Value".len());

    let border = format!("+-{}-+-{}-+\n", "-".repeat(key_width), "-".repeat(value_width));
    let mut out = border.clone();
    out.push_str(&format!(
        "| {:<key_width$} | {:<value_width$} |\n",
        "Key", "Value"
    ));
    out.push_str(&border);
    for (key, value) in rows {
        out.push_str(&format!("| {key:<key_width$} | {value:<value_width$} |\n"));
    }
    out.push_str(&border);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_core::{Parameters, TaskOptions};

    #[test]
    fn test_parse_task_edit() {
        let cli = Cli::try_parse_from([
            "jobqueue", "task", "edit", "42", "--priority", "3", "--status", "waiting",
        ])
        .unwrap();
        match cli.command {
            Commands::Task(TaskCommands {
                action:
                    TaskActions::Edit {
                        id,
                        priority,
                        status,
                        profile,
                        parent_id,
                    },
            }) => {
                assert_eq!(id, 42);
                assert_eq!(priority, Some(3));
                assert_eq!(status, Some(TaskStatus::Waiting));
                assert!(profile.is_none());
                assert!(parent_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["jobqueue", "task", "edit", "1", "--status", "done"]).is_err());
    }

    #[test]
    fn test_parse_worker_profiles_and_globals() {
        let cli = Cli::try_parse_from([
            "jobqueue", "worker", "run", "-p", "media", "-p", "mail", "--log-level", "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Worker(WorkerCommands {
                action: WorkerActions::Run { name, profiles },
            }) => {
                assert!(name.is_none());
                assert_eq!(profiles, vec!["media", "mail"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_read_confirmation() {
        assert!(read_confirmation("y\n".as_bytes()).unwrap());
        assert!(read_confirmation("YES\n".as_bytes()).unwrap());
        assert!(!read_confirmation("\n".as_bytes()).unwrap());
        assert!(!read_confirmation("nope\n".as_bytes()).unwrap());
    }

    #[test]
    fn test_render_task() {
        let task = Task::from_kind(
            "shell",
            TaskOptions::new(3, "media"),
            Parameters::new().with("command", "true"),
        )
        .with_tag("render-me")
        .unwrap();

        let table = render_task(&task);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[1].starts_with("| Key"));
        assert!(table.contains("| Tag "));
        assert!(table.contains("render-me"));
        assert!(table.contains("media"));
        assert!(table.contains("| ID "));
        let width = lines[0].len();
        assert!(lines.iter().all(|line| line.chars().count() == width));
    }
}
