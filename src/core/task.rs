//! Task model - persisted task rows and the status field codec
//!
//! The store keeps a single signed integer per task that means queue
//! position, elapsed running time or terminal outcome depending on its
//! value. Only [`TaskState::decode`] and [`TaskState::encode`] know about
//! that encoding; everything else works on [`TaskState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable task identifier assigned by the store
pub type TaskId = u64;

/// Raw status field values with a fixed meaning
pub const FIELD_FAILED: i64 = 0;
pub const FIELD_FINISHED: i64 = 1;
pub const FIELD_QUEUE_HEAD: i64 = -1;
/// Smallest value that reads back as RUNNING
pub const FIELD_RUNNING_MIN: i64 = 2;

/// A task row as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: u32,
    /// Overloaded status field, see [`TaskState`]
    pub status: i64,
    #[serde(default)]
    pub process_id: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub output: String,
}

impl Task {
    /// Decoded lifecycle state
    pub fn state(&self) -> TaskState {
        TaskState::decode(self.status)
    }

    /// Whether the status field marks this task as the next one to dispatch
    pub fn is_queue_head(&self) -> bool {
        self.status == FIELD_QUEUE_HEAD
    }
}

/// Fields a caller wants to change on a task row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<i64>,
    pub process_id: Option<u32>,
    pub message: Option<String>,
    pub eta_seconds: Option<u64>,
    pub output: Option<String>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.status = Some(state.encode());
        self
    }

    pub fn process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn eta_seconds(mut self, eta: u64) -> Self {
        self.eta_seconds = Some(eta);
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Apply to a row, touching `updated_at`
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(pid) = self.process_id {
            task.process_id = Some(pid);
        }
        if let Some(message) = &self.message {
            task.message = message.clone();
        }
        if let Some(eta) = self.eta_seconds {
            task.eta_seconds = Some(eta);
        }
        if let Some(output) = &self.output {
            task.output = output.clone();
        }
        task.updated_at = Utc::now();
    }
}

/// Lifecycle state carried by the status field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued; position 1 is the head of the queue
    Waiting { position: u32 },
    /// Running for the given number of whole seconds
    Running { elapsed_secs: u64 },
    Finished,
    /// Error or killed; the message tells them apart
    Failed,
}

impl TaskState {
    /// Read the legacy status field
    pub fn decode(field: i64) -> Self {
        match field {
            f if f < 0 => Self::Waiting {
                position: u32::try_from(f.unsigned_abs()).unwrap_or(u32::MAX),
            },
            FIELD_FAILED => Self::Failed,
            FIELD_FINISHED => Self::Finished,
            f => Self::Running {
                elapsed_secs: f.unsigned_abs(),
            },
        }
    }

    /// Write the legacy status field.
    ///
    /// Running never encodes below 2 and waiting never encodes above -1, so
    /// `decode(encode(s))` keeps the variant.
    pub fn encode(self) -> i64 {
        match self {
            Self::Waiting { position } => -i64::from(position.max(1)),
            Self::Failed => FIELD_FAILED,
            Self::Finished => FIELD_FINISHED,
            Self::Running { elapsed_secs } => {
                i64::try_from(elapsed_secs).unwrap_or(i64::MAX).max(FIELD_RUNNING_MIN)
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Status shown to observers, derived from [`TaskState`] plus local knowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Running,
    Finished,
    Killed,
    NonResponding,
    Error,
    Unknown,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl From<TaskState> for TaskStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Waiting { .. } => Self::Waiting,
            TaskState::Running { .. } => Self::Running,
            TaskState::Finished => Self::Finished,
            TaskState::Failed => Self::Error,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "WAITING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Finished => write!(f, "FINISHED"),
            Self::Killed => write!(f, "KILLED"),
            Self::NonResponding => write!(f, "NON-RESPONDING"),
            Self::Error => write!(f, "ERROR"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Aggregate counters over a roster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting: usize,
    pub running: usize,
    pub finished: usize,
    /// Killed and errored tasks together
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                TaskStatus::Waiting => counts.waiting += 1,
                TaskStatus::Running | TaskStatus::NonResponding => counts.running += 1,
                TaskStatus::Finished => counts.finished += 1,
                TaskStatus::Killed | TaskStatus::Error => counts.failed += 1,
                TaskStatus::Unknown => {}
            }
        }
        counts
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting: {}  running: {}  finished: {}  killed/error: {}",
            self.waiting, self.running, self.finished, self.failed
        )
    }
}
