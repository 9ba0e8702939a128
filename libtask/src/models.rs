use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Epoch milliseconds, the timestamp unit used across task records.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("invalid task group: {0}")]
    InvalidGroup(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task runner is shut down")]
    ShutDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub loaded: i64,
    pub total: i64,
}

/// Snapshot of a task as reported to callers. Runner-internal state
/// (context, locks) never leaves the runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub progress: Progress,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
    pub group: String,
}

#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    pub name: String,
    /// Slash-separated group path, e.g. `drive/copy`. Segments are
    /// alphanumeric plus `-` and `_`. Empty means ungrouped.
    pub group: String,
}

impl TaskOptions {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.group.is_empty() {
            return Ok(());
        }
        let re = Regex::new(r"^[A-Za-z0-9_-]+(/[A-Za-z0-9_-]+)*$").unwrap();
        if re.is_match(&self.group) {
            Ok(())
        } else {
            Err(TaskError::InvalidGroup(self.group.clone()))
        }
    }
}
