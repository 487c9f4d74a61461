//! Task orchestrator - roster reconciliation and admission control
//!
//! The roster mirrors up to `task_limit` store rows, newest first. The
//! admission tick dispatches at most one task, the one at the head of the
//! queue, and only while the host is below its load limits.

use super::record::{StallPolicy, TaskRecord};
use super::supervisor::{SupervisorEvent, SupervisorFactory, TaskEvent};
use super::task::{StatusCounts, TaskId, TaskState, TaskStatus, TaskUpdate};
use crate::config::{CommandTemplate, Config, ExitMessages};
use crate::error::{ConfigError, StoreError, SupervisorError};
use crate::events::{EventStream, MonitorEvent};
use crate::load::LoadProbe;
use crate::store::TaskStore;
use std::collections::HashSet;
use std::sync::Arc;

/// Message for tasks left RUNNING by a previous supervisor process
pub const STALE_RUN_MESSAGE: &str = "Supervisor restarted while task was running";

/// Outcome of one admission tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// No task at the head; the queue moved up
    Idle,
    /// Host over its limits; the queue is frozen
    Deferred { cpu_percent: f32, ram_percent: f32 },
    Started { task_id: TaskId, pid: u32 },
    /// Head task has no launch command and was marked as failed
    Rejected(TaskId),
}

/// Owns the roster and makes admission decisions
pub struct TaskOrchestrator {
    records: Vec<TaskRecord>,
    config: Config,
    template: CommandTemplate,
    exit_messages: ExitMessages,
    stall: StallPolicy,
    store: Arc<dyn TaskStore>,
    load: Box<dyn LoadProbe>,
    factory: SupervisorFactory,
    observers: EventStream,
    counts: StatusCounts,
}

impl TaskOrchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        load: Box<dyn LoadProbe>,
        factory: SupervisorFactory,
        observers: EventStream,
    ) -> Result<Self, ConfigError> {
        let template = CommandTemplate::from_config(&config)?;
        Ok(Self {
            records: Vec::new(),
            exit_messages: config.exit_messages(),
            stall: config.stall_policy(),
            template,
            config,
            store,
            load,
            factory,
            observers,
            counts: StatusCounts::default(),
        })
    }

    /// Roster, newest first
    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn record(&self, task_id: TaskId) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.id() == task_id)
    }

    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    /// Records owning a live process
    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active()).count()
    }

    /// Fail tasks a previous supervisor left RUNNING; nothing watches them now
    pub fn recover_stale_runs(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for task in self.store.list_tasks(self.config.task_limit)? {
            if !matches!(task.state(), TaskState::Running { .. }) {
                continue;
            }
            if self.records.iter().any(|r| r.id() == task.id && r.is_active()) {
                continue;
            }
            log::warn!(
                "Task {} (PID {:?}) was left running by a previous supervisor",
                task.id,
                task.process_id
            );
            let update = TaskUpdate::new()
                .state(TaskState::Failed)
                .message(STALE_RUN_MESSAGE);
            if self.store.update_task(task.id, &update) {
                recovered += 1;
            } else {
                log::warn!("Task {}: cannot mark stale run as failed", task.id);
            }
        }
        Ok(recovered)
    }

    /// Sync the roster with the store
    pub fn reconcile(&mut self) -> Result<(), StoreError> {
        let tasks = self.store.list_tasks(self.config.task_limit)?;
        let listed: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();

        // Rows past the newest `task_limit` are still ours while they run
        let store = self.store.clone();
        let mut beyond_limit = Vec::new();
        self.records.retain_mut(|record| {
            if listed.contains(&record.id()) {
                return true;
            }
            match store.get_task(record.id()) {
                Ok(task) if record.is_active() || is_running_like(record.status()) => {
                    log::debug!("Task {} is past the roster limit, still supervising it", task.id);
                    beyond_limit.push(task);
                    true
                }
                Ok(_) => {
                    log::debug!("Task {} is past the roster limit, dropping it", record.id());
                    false
                }
                Err(StoreError::NotFound(_)) => {
                    log::info!("Task {} no longer in store, removing it", record.id());
                    if record.is_active() {
                        record.kill();
                    }
                    false
                }
                Err(e) => {
                    log::warn!("Task {}: cannot confirm its row, keeping it: {}", record.id(), e);
                    true
                }
            }
        });

        let mut fresh = Vec::new();
        for task in tasks.into_iter().chain(beyond_limit) {
            match self.records.iter_mut().find(|r| r.id() == task.id) {
                Some(record) => record.observe(task, &self.stall),
                None => fresh.push(task),
            }
        }

        // Store lists newest first; keep that order at the front
        for task in fresh.into_iter().rev() {
            log::debug!("Task {} added (type {})", task.id, task.task_type);
            let mut record = TaskRecord::new(task, self.store.clone(), self.observers.clone());
            match self.template.render(record.task()) {
                Ok(command) => record.bind_command(&self.factory, command),
                Err(e) => log::warn!("Task {}: {}", record.id(), e),
            }
            self.records.insert(0, record);
        }

        self.recount();
        Ok(())
    }

    /// Start the head of the queue if the host allows it.
    ///
    /// A launch command that cannot be spawned at all is returned as an
    /// error after the task has been marked as failed.
    pub fn admission_tick(&mut self) -> Result<Admission, SupervisorError> {
        let head = self
            .records
            .iter()
            .position(|r| r.status() == TaskStatus::Waiting && r.task().is_queue_head());

        let Some(index) = head else {
            let moved = self.advance_queue();
            if moved > 0 {
                log::debug!("No task at queue head, advanced {} tasks", moved);
            }
            self.recount();
            return Ok(Admission::Idle);
        };

        let cpu_percent = self.load.host_cpu_percent();
        let ram_percent = self.load.host_ram_percent();
        let limits = &self.config.admission;
        if cpu_percent > limits.cpu_limit_percent || ram_percent > limits.ram_limit_percent {
            log::info!(
                "Host busy (CPU {:.1}%, RAM {:.1}%), task {} keeps its place",
                cpu_percent,
                ram_percent,
                self.records[index].id()
            );
            return Ok(Admission::Deferred {
                cpu_percent,
                ram_percent,
            });
        }

        let record = &mut self.records[index];
        let task_id = record.id();
        let outcome = if record.is_bound() {
            let log_path = self.config.log_path(task_id);
            log::info!("Dispatching task {} (creator {:?})", task_id, record.task().creator);
            match record.start(&log_path) {
                Ok(pid) => Admission::Started { task_id, pid },
                Err(e) => {
                    self.recount();
                    return Err(e);
                }
            }
        } else {
            let reason = format!(
                "No launch command configured for task type {}",
                record.task().task_type
            );
            record.reject(&reason);
            Admission::Rejected(task_id)
        };

        self.advance_queue();
        self.recount();
        Ok(outcome)
    }

    /// Move every waiting task one slot closer to the head
    fn advance_queue(&mut self) -> usize {
        self.records
            .iter_mut()
            .filter(|r| r.status() == TaskStatus::Waiting)
            .map(|r| r.advance_queue_position())
            .filter(|moved| *moved)
            .count()
    }

    /// Route a supervisor event to its record
    pub fn handle_event(&mut self, event: TaskEvent) {
        let Some(record) = self.records.iter_mut().find(|r| r.id() == event.task_id) else {
            log::debug!(
                "Ignoring {:?} for task {} (not in roster)",
                event.event,
                event.task_id
            );
            return;
        };

        match event.event {
            SupervisorEvent::Started { pid } => record.on_started(pid),
            SupervisorEvent::Ended { exit_code } => record.on_ended(exit_code, &self.exit_messages),
            SupervisorEvent::Killed => record.on_killed(&self.exit_messages),
            SupervisorEvent::NonResponding => record.on_non_responding(),
            SupervisorEvent::ResourceUpdated {
                cpu_percent,
                ram_mb,
            } => {
                record.on_resource_updated(cpu_percent, ram_mb);
                return;
            }
            SupervisorEvent::RunningTimeUpdated { seconds } => {
                record.on_running_time_updated(seconds);
                return;
            }
        }
        self.recount();
    }

    /// Ask every live process to stop; returns the tasks asked
    pub fn kill_all(&mut self) -> Vec<TaskId> {
        let mut asked = Vec::new();
        for record in self.records.iter_mut().filter(|r| r.is_active()) {
            record.kill();
            asked.push(record.id());
        }
        asked
    }

    fn recount(&mut self) {
        let counts = StatusCounts::tally(self.records.iter().map(|r| r.status()));
        if counts != self.counts {
            log::debug!("{}", counts);
            self.counts = counts;
            self.observers.emit(MonitorEvent::counters(&counts));
        }
    }
}

fn is_running_like(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Running | TaskStatus::NonResponding)
}
