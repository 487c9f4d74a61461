//! Event streaming for external observers
//!
//! JSON-serializable events a dashboard or script can follow with
//! `taskherd run --events`.

use crate::core::{StatusCounts, SupervisorEvent, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while tasks are supervised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Process spawned for a task
    TaskStarted { task_id: TaskId, pid: u32 },
    /// Process ended on its own
    TaskEnded { task_id: TaskId, exit_code: i32 },
    /// Process tree killed by the supervisor
    TaskKilled { task_id: TaskId },
    /// Process looks hung
    TaskNonResponding { task_id: TaskId },
    ResourceUpdated {
        task_id: TaskId,
        cpu_percent: f32,
        ram_mb: f64,
    },
    RunningTimeUpdated { task_id: TaskId, seconds: f64 },
    /// Derived status of a task changed
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Aggregate counters after a reconciliation or admission tick
    Counters {
        waiting: usize,
        running: usize,
        finished: usize,
        failed: usize,
    },
}

impl MonitorEvent {
    /// Observer view of a supervisor event
    pub fn from_supervisor(task_id: TaskId, event: &SupervisorEvent) -> Self {
        match *event {
            SupervisorEvent::Started { pid } => Self::TaskStarted { task_id, pid },
            SupervisorEvent::Ended { exit_code } => Self::TaskEnded { task_id, exit_code },
            SupervisorEvent::Killed => Self::TaskKilled { task_id },
            SupervisorEvent::NonResponding => Self::TaskNonResponding { task_id },
            SupervisorEvent::ResourceUpdated {
                cpu_percent,
                ram_mb,
            } => Self::ResourceUpdated {
                task_id,
                cpu_percent,
                ram_mb,
            },
            SupervisorEvent::RunningTimeUpdated { seconds } => {
                Self::RunningTimeUpdated { task_id, seconds }
            }
        }
    }

    pub fn counters(counts: &StatusCounts) -> Self {
        Self::Counters {
            waiting: counts.waiting,
            running: counts.running,
            finished: counts.finished,
            failed: counts.failed,
        }
    }

    /// Serialize to JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast-based event stream for multiple consumers
#[derive(Clone)]
pub struct EventStream {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = MonitorEvent::TaskStarted {
            task_id: 12,
            pid: 4321,
        };
        let json = event.to_json_line();
        assert!(json.contains("\"type\":\"task_started\""));
        assert!(json.contains("4321"));
    }

    #[test]
    fn test_status_change_uses_status_names() {
        let event = MonitorEvent::StatusChanged {
            task_id: 3,
            from: TaskStatus::Running,
            to: TaskStatus::NonResponding,
        };
        let json = event.to_json_line();
        assert!(json.contains("status_changed"));
        assert!(json.contains("NON_RESPONDING"));
    }

    #[test]
    fn test_from_supervisor() {
        assert_eq!(
            MonitorEvent::from_supervisor(5, &SupervisorEvent::Ended { exit_code: 3 }),
            MonitorEvent::TaskEnded {
                task_id: 5,
                exit_code: 3
            }
        );
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let stream = EventStream::default();
        let mut rx = stream.subscribe();

        stream.emit(MonitorEvent::TaskKilled { task_id: 9 });

        assert_eq!(rx.recv().await.unwrap(), MonitorEvent::TaskKilled { task_id: 9 });
    }
}
