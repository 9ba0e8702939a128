pub mod context;
pub mod models;
pub mod runner;

pub use context::TaskContext;
pub use models::{Progress, Task, TaskError, TaskOptions, TaskStatus, now_ms};
pub use runner::{TaskRunner, TaskRunnerConfig};
