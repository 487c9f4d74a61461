//! Taskherd - resource-aware task dispatcher and process supervisor
//!
//! Dispatches queued tasks from a shared store as OS processes, one per
//! admission tick and only while the host has headroom, then supervises
//! each process tree until it ends, hangs or is killed.

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod load;
pub mod store;

// Re-exports
pub use app::App;
pub use config::Config;
pub use core::{Admission, Task, TaskEvent, TaskOrchestrator, TaskState, TaskStatus};
pub use error::{ConfigError, StoreError, SupervisorError};
pub use events::{EventStream, MonitorEvent};
pub use store::{JsonFileStore, MemoryStore, NewTask, TaskStore};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
