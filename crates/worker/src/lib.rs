pub mod executors;
pub mod worker;

pub use executors::{ShellJob, ShellTaskParams};
pub use worker::{Worker, WorkerState};
