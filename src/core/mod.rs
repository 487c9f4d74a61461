//! Core engine - task model, process supervision, admission scheduling

mod orchestrator;
pub mod process;
mod record;
mod supervisor;
mod task;

pub use orchestrator::{Admission, TaskOrchestrator, STALE_RUN_MESSAGE};
pub use process::{system_probe_factory, ProbeFactory, ProcessProbe, ProcessState, SystemProbe};
pub use record::{StallPolicy, TaskRecord};
pub use supervisor::{
    ProcessSupervisor, SupervisorConfig, SupervisorEvent, SupervisorFactory, TaskEvent,
    UsageWindow,
};
pub use task::{StatusCounts, Task, TaskId, TaskState, TaskStatus, TaskUpdate};
