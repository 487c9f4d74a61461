//! Task record - in-memory projection of one task row
//!
//! A record reacts to its supervisor's events, writes outcomes back to the
//! store and keeps a derived [`TaskStatus`]. Store write failures are logged
//! and never hold back the local transition.

use super::supervisor::{ProcessSupervisor, SupervisorEvent, SupervisorFactory};
use super::task::{Task, TaskId, TaskState, TaskStatus, TaskUpdate};
use crate::config::{ExitMessages, EXIT_KILLED_BY_SUPERVISOR};
use crate::error::SupervisorError;
use crate::events::{EventStream, MonitorEvent};
use crate::store::TaskStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// When a running task without store-visible progress counts as stalled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallPolicy {
    pub reconcile_interval: Duration,
    pub timeout: Duration,
}

impl StallPolicy {
    fn exceeded(&self, cycles: u32) -> bool {
        self.reconcile_interval * cycles > self.timeout
    }
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(20),
        }
    }
}

/// One task as seen by the orchestrator
pub struct TaskRecord {
    task: Task,
    status: TaskStatus,
    supervisor: Option<ProcessSupervisor>,
    cpu_percent: f32,
    ram_mb: f64,
    /// Consecutive reconciliations with an unchanged running field
    stall_cycles: u32,
    last_elapsed_written: u64,
    kill_requested: bool,
    store: Arc<dyn TaskStore>,
    observers: EventStream,
}

impl TaskRecord {
    pub fn new(task: Task, store: Arc<dyn TaskStore>, observers: EventStream) -> Self {
        Self {
            status: TaskStatus::from(task.state()),
            task,
            supervisor: None,
            cpu_percent: 0.0,
            ram_mb: 0.0,
            stall_cycles: 0,
            last_elapsed_written: 0,
            kill_requested: false,
            store,
            observers,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn cpu_percent(&self) -> f32 {
        self.cpu_percent
    }

    pub fn ram_mb(&self) -> f64 {
        self.ram_mb
    }

    pub fn stall_cycles(&self) -> u32 {
        self.stall_cycles
    }

    pub fn is_bound(&self) -> bool {
        self.supervisor.is_some()
    }

    /// Whether this record owns a live process
    pub fn is_active(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|s| s.is_active())
    }

    pub fn command(&self) -> Option<&str> {
        self.supervisor.as_ref().map(|s| s.command())
    }

    /// Attach a fresh supervisor for `command`
    pub fn bind_command(&mut self, factory: &SupervisorFactory, command: String) {
        if self.is_active() {
            log::warn!(
                "Task {}: rebinding command while a process runs; the old process will be killed",
                self.task.id
            );
        }
        log::debug!("Task {} bound to `{}`", self.task.id, command);
        self.supervisor = Some(factory.build(self.task.id, command));
    }

    /// Take the task out of the queue and spawn its process
    pub fn start(&mut self, log_path: &Path) -> Result<u32, SupervisorError> {
        let id = self.task.id;
        let Some(supervisor) = self.supervisor.as_mut() else {
            return Err(SupervisorError::NotBound(id));
        };

        let leaving_queue = TaskState::Running { elapsed_secs: 0 };
        self.task.status = leaving_queue.encode();
        self.kill_requested = false;
        self.stall_cycles = 0;
        self.last_elapsed_written = 0;
        if !self.store.update_task(id, &TaskUpdate::new().state(leaving_queue)) {
            log::warn!("Task {}: cannot mark as leaving the queue in the store", id);
        }

        match supervisor.start(log_path) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                log::error!("Task {}: failed to start process: {}", id, e);
                let update = TaskUpdate::new()
                    .state(TaskState::Failed)
                    .message(e.to_string());
                self.write_outcome(update, "spawn failed");
                Err(e)
            }
        }
    }

    /// Kill the process tree; a second request while one is pending is ignored
    pub fn kill(&mut self) {
        if self.kill_requested {
            log::debug!("Task {}: kill already requested", self.task.id);
            return;
        }
        match self.supervisor.as_mut() {
            Some(supervisor) => {
                self.kill_requested = true;
                supervisor.kill();
            }
            None => log::warn!("Task {}: nothing to kill, no command bound", self.task.id),
        }
    }

    /// Mark a queue head that can never be launched
    pub fn reject(&mut self, reason: &str) {
        log::error!("Task {}: {}", self.task.id, reason);
        let update = TaskUpdate::new().state(TaskState::Failed).message(reason);
        self.write_outcome(update, "task rejected");
    }

    pub fn on_started(&mut self, pid: u32) {
        self.publish(SupervisorEvent::Started { pid });
        self.task.process_id = Some(pid);
        if !self.store.update_task(self.task.id, &TaskUpdate::new().process_id(pid)) {
            log::warn!(
                "Task {}: process started (PID {}) but the store was not updated",
                self.task.id,
                pid
            );
        }
        self.set_status(TaskStatus::Running);
    }

    pub fn on_resource_updated(&mut self, cpu_percent: f32, ram_mb: f64) {
        self.cpu_percent = cpu_percent;
        self.ram_mb = ram_mb;
        self.publish(SupervisorEvent::ResourceUpdated {
            cpu_percent,
            ram_mb,
        });
    }

    /// Publish elapsed running time through the status field.
    ///
    /// Only whole seconds from 2 upward are written, and only while the
    /// store still says RUNNING, so a module's own terminal write wins.
    pub fn on_running_time_updated(&mut self, seconds: f64) {
        self.publish(SupervisorEvent::RunningTimeUpdated { seconds });
        if self.status != TaskStatus::Running || seconds <= 1.0 {
            return;
        }
        let elapsed_secs = seconds.floor() as u64;
        if elapsed_secs < 2 || elapsed_secs == self.last_elapsed_written {
            return;
        }
        match self.store.get_task(self.task.id) {
            Ok(current) if matches!(current.state(), TaskState::Running { .. }) => {}
            Ok(_) => return,
            Err(e) => {
                log::warn!("Task {}: cannot read before time update: {}", self.task.id, e);
                return;
            }
        }
        let update = TaskUpdate::new().state(TaskState::Running { elapsed_secs });
        if self.store.update_task(self.task.id, &update) {
            self.last_elapsed_written = elapsed_secs;
        } else {
            log::warn!("Task {}: cannot write running time", self.task.id);
        }
    }

    /// Settle the outcome unless the module already wrote one
    pub fn on_ended(&mut self, exit_code: i32, messages: &ExitMessages) {
        log::info!(
            "Task {} (PID {:?}) ended with exit code {}",
            self.task.id,
            self.task.process_id,
            exit_code
        );
        self.publish(SupervisorEvent::Ended { exit_code });

        match self.store.get_task(self.task.id) {
            Ok(current) if !current.state().is_terminal() => {
                let outcome = if exit_code == 0 {
                    TaskState::Finished
                } else {
                    TaskState::Failed
                };
                let update = TaskUpdate::new()
                    .state(outcome)
                    .message(messages.message(exit_code));
                self.write_outcome(update, "process ended");
            }
            Ok(current) => {
                log::debug!("Task {}: module already reported its outcome", self.task.id);
                self.apply_snapshot(current);
            }
            Err(e) => log::warn!("Task {}: cannot read after process end: {}", self.task.id, e),
        }
        self.stall_cycles = 0;
    }

    pub fn on_killed(&mut self, messages: &ExitMessages) {
        log::warn!(
            "Task {} (PID {:?}) killed by supervisor",
            self.task.id,
            self.task.process_id
        );
        self.publish(SupervisorEvent::Killed);

        self.kill_requested = false;
        self.stall_cycles = 0;
        self.set_status(TaskStatus::Killed);
        let update = TaskUpdate::new()
            .state(TaskState::Failed)
            .message(messages.message(EXIT_KILLED_BY_SUPERVISOR));
        self.write_outcome(update, "process killed");
    }

    pub fn on_non_responding(&mut self) {
        log::warn!(
            "Task {} (PID {:?}) is not responding, killing it",
            self.task.id,
            self.task.process_id
        );
        self.publish(SupervisorEvent::NonResponding);
        self.set_status(TaskStatus::NonResponding);
        self.kill();
    }

    /// Re-read the row and rederive the status
    pub fn refresh_from_store(&mut self) {
        match self.store.get_task(self.task.id) {
            Ok(task) => self.apply_snapshot(task),
            Err(e) => log::warn!("Task {}: refresh failed: {}", self.task.id, e),
        }
    }

    /// Take a snapshot from a reconciliation pass and check for a stall
    pub fn observe(&mut self, task: Task, policy: &StallPolicy) {
        let previous = self.task.status;
        let unchanged = task.status == previous;
        let was_running = matches!(TaskState::decode(previous), TaskState::Running { .. });

        if unchanged && was_running {
            self.stall_cycles += 1;
        } else {
            self.stall_cycles = 0;
        }
        self.apply_snapshot(task);

        if self.stall_cycles > 0 && policy.exceeded(self.stall_cycles) && !self.kill_requested {
            log::warn!(
                "Task {} (PID {:?}): status field stuck at {} for {} cycles, killing it",
                self.task.id,
                self.task.process_id,
                previous,
                self.stall_cycles
            );
            self.set_status(TaskStatus::NonResponding);
            self.kill();
        }
    }

    /// Move one slot closer to the head of the queue
    pub fn advance_queue_position(&mut self) -> bool {
        self.refresh_from_store();
        let TaskState::Waiting { position } = self.task.state() else {
            return false;
        };
        if position < 2 {
            return false;
        }
        let next = TaskState::Waiting {
            position: position - 1,
        };
        if !self.store.update_task(self.task.id, &TaskUpdate::new().state(next)) {
            log::warn!("Task {}: cannot advance queue position in the store", self.task.id);
        }
        self.task.status = next.encode();
        true
    }

    /// Store a terminal outcome; without the store, apply it locally
    fn write_outcome(&mut self, update: TaskUpdate, context: &str) {
        if self.store.update_task(self.task.id, &update) {
            self.refresh_from_store();
            return;
        }
        log::warn!(
            "Task {}: {} but the store was not updated",
            self.task.id,
            context
        );
        let mut local = self.task.clone();
        update.apply(&mut local);
        self.apply_snapshot(local);
    }

    fn apply_snapshot(&mut self, task: Task) {
        let derived = TaskStatus::from(task.state());
        self.task = task;
        let sticky = matches!(
            (self.status, derived),
            (TaskStatus::Killed, TaskStatus::Error)
                | (TaskStatus::NonResponding, TaskStatus::Running)
        );
        if !sticky {
            self.set_status(derived);
        }
    }

    /// Pass a handled supervisor event on to observers
    fn publish(&self, event: SupervisorEvent) {
        self.observers
            .emit(MonitorEvent::from_supervisor(self.task.id, &event));
    }

    fn set_status(&mut self, status: TaskStatus) {
        if self.status == status {
            return;
        }
        log::info!("Task {}: {} -> {}", self.task.id, self.status, status);
        self.observers.emit(MonitorEvent::StatusChanged {
            task_id: self.task.id,
            from: self.status,
            to: status,
        });
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::system_probe_factory;
    use crate::core::supervisor::{SupervisorConfig, TaskEvent};
    use crate::store::{MemoryStore, NewTask};
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn store_with(status: i64) -> (Arc<MemoryStore>, Task) {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let task = Task {
            id: 1,
            task_type: 1,
            status,
            process_id: None,
            created_at: now,
            updated_at: now,
            eta_seconds: None,
            message: String::new(),
            creator: "tester".to_string(),
            params: serde_json::Value::Null,
            worker: None,
            output: String::new(),
        };
        store.put(task.clone());
        (store, task)
    }

    fn record(store: &Arc<MemoryStore>, task: Task) -> TaskRecord {
        TaskRecord::new(task, store.clone(), EventStream::default())
    }

    fn factory() -> (SupervisorFactory, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SupervisorFactory::new(SupervisorConfig::default(), tx, system_probe_factory()),
            rx,
        )
    }

    #[test]
    fn test_status_derived_from_field() {
        for (field, status) in [
            (-3, TaskStatus::Waiting),
            (0, TaskStatus::Error),
            (1, TaskStatus::Finished),
            (2, TaskStatus::Running),
            (95, TaskStatus::Running),
        ] {
            let (store, task) = store_with(field);
            assert_eq!(record(&store, task).status(), status, "field {}", field);
        }
    }

    #[test]
    fn test_ended_success_writes_finished() {
        let (store, task) = store_with(14);
        let mut rec = record(&store, task);

        rec.on_ended(0, &ExitMessages::default());

        let stored = store.get_task(1).unwrap();
        assert_eq!(stored.status, 1);
        assert_eq!(rec.status(), TaskStatus::Finished);
    }

    #[test]
    fn test_ended_unmapped_code_writes_error_with_code() {
        let (store, task) = store_with(14);
        let mut rec = record(&store, task);

        rec.on_ended(7, &ExitMessages::default());

        let stored = store.get_task(1).unwrap();
        assert_eq!(stored.status, 0);
        assert!(stored.message.contains('7'));
        assert_eq!(rec.status(), TaskStatus::Error);
    }

    #[test]
    fn test_ended_keeps_module_outcome() {
        let (store, task) = store_with(14);
        let mut rec = record(&store, task);
        store.update_task(
            1,
            &TaskUpdate::new().state(TaskState::Finished).message("done by module"),
        );

        rec.on_ended(3, &ExitMessages::default());

        let stored = store.get_task(1).unwrap();
        assert_eq!(stored.status, 1);
        assert_eq!(stored.message, "done by module");
        assert_eq!(rec.status(), TaskStatus::Finished);
    }

    #[test]
    fn test_killed_stays_killed_after_refresh() {
        let (store, task) = store_with(30);
        let mut rec = record(&store, task);

        rec.on_killed(&ExitMessages::default());
        rec.refresh_from_store();

        assert_eq!(rec.status(), TaskStatus::Killed);
        let stored = store.get_task(1).unwrap();
        assert_eq!(stored.status, 0);
        assert_eq!(stored.message, "Process killed by supervisor");
    }

    #[test]
    fn test_local_transition_survives_failed_write() {
        let (store, task) = store_with(30);
        let mut rec = record(&store, task);
        store.set_fail_writes(true);

        rec.on_killed(&ExitMessages::default());

        assert_eq!(rec.status(), TaskStatus::Killed);
        assert_eq!(rec.task().status, 0);
    }

    #[test]
    fn test_running_time_written_from_two_seconds() {
        let (store, task) = store_with(2);
        let mut rec = record(&store, task);
        rec.on_started(999);

        rec.on_running_time_updated(0.5);
        rec.on_running_time_updated(1.5);
        assert_eq!(store.get_task(1).unwrap().status, 2);

        rec.on_running_time_updated(9.7);
        assert_eq!(store.get_task(1).unwrap().status, 9);
        assert_eq!(store.get_task(1).unwrap().process_id, Some(999));
    }

    #[test]
    fn test_running_time_does_not_overwrite_terminal_field() {
        let (store, task) = store_with(5);
        let mut rec = record(&store, task);
        rec.on_started(999);
        store.update_task(1, &TaskUpdate::new().state(TaskState::Finished));

        rec.on_running_time_updated(12.0);

        assert_eq!(store.get_task(1).unwrap().status, 1);
    }

    #[test]
    fn test_advance_moves_only_deep_waiters() {
        let (store, task) = store_with(-3);
        let mut rec = record(&store, task);

        assert!(rec.advance_queue_position());
        assert!(rec.advance_queue_position());
        assert!(!rec.advance_queue_position());

        assert_eq!(rec.task().status, -1);
        assert_eq!(store.get_task(1).unwrap().status, -1);
        assert!(rec.task().is_queue_head());
    }

    #[test]
    fn test_advance_rereads_store_first() {
        let (store, task) = store_with(-4);
        let mut rec = record(&store, task);
        store.update_task(1, &TaskUpdate::new().state(TaskState::Waiting { position: 2 }));

        rec.advance_queue_position();

        assert_eq!(store.get_task(1).unwrap().status, -1);
    }

    #[test]
    fn test_stall_detected_after_timeout() {
        let (store, task) = store_with(6);
        let mut rec = record(&store, task.clone());
        let policy = StallPolicy {
            reconcile_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(20),
        };

        for _ in 0..4 {
            rec.observe(task.clone(), &policy);
            assert_eq!(rec.status(), TaskStatus::Running);
        }
        rec.observe(task.clone(), &policy);

        assert_eq!(rec.stall_cycles(), 5);
        assert_eq!(rec.status(), TaskStatus::NonResponding);
    }

    #[test]
    fn test_progress_resets_stall_counter() {
        let (store, mut task) = store_with(6);
        let mut rec = record(&store, task.clone());
        let policy = StallPolicy::default();

        rec.observe(task.clone(), &policy);
        rec.observe(task.clone(), &policy);
        assert_eq!(rec.stall_cycles(), 2);

        task.status = 9;
        rec.observe(task, &policy);
        assert_eq!(rec.stall_cycles(), 0);
    }

    #[test]
    fn test_waiting_rows_never_stall() {
        let (store, task) = store_with(-2);
        let mut rec = record(&store, task.clone());
        for _ in 0..50 {
            rec.observe(task.clone(), &StallPolicy::default());
        }
        assert_eq!(rec.stall_cycles(), 0);
    }

    #[test]
    fn test_start_without_command_fails() {
        let (store, task) = store_with(-1);
        let mut rec = record(&store, task);
        let dir = tempfile::tempdir().unwrap();

        let err = rec.start(&dir.path().join("1.log")).unwrap_err();
        assert!(matches!(err, SupervisorError::NotBound(1)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_written_back() {
        let (store, task) = store_with(-1);
        let mut rec = record(&store, task);
        let (factory, _rx) = factory();
        rec.bind_command(&factory, "/no/such/module --task-id 1".to_string());
        let dir = tempfile::tempdir().unwrap();

        let err = rec.start(&dir.path().join("1.log")).unwrap_err();

        assert!(err.is_configuration());
        let stored = store.get_task(1).unwrap();
        assert_eq!(stored.status, 0);
        assert!(stored.message.contains("/no/such/module"));
        assert_eq!(rec.status(), TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_start_leaves_queue_and_reports_pid() {
        let store = Arc::new(MemoryStore::new());
        let task = store
            .insert_task(NewTask {
                task_type: 1,
                ..NewTask::default()
            })
            .unwrap();
        let mut rec = record(&store, task);
        let (factory, mut rx) = factory();
        rec.bind_command(&factory, "sleep 0.2".to_string());
        let dir = tempfile::tempdir().unwrap();

        let pid = rec.start(&dir.path().join("1.log")).unwrap();

        assert_eq!(store.get_task(1).unwrap().status, 2);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.task_id, 1);
        rec.on_started(pid);
        assert_eq!(rec.status(), TaskStatus::Running);
        assert_eq!(store.get_task(1).unwrap().process_id, Some(pid));
    }

    #[tokio::test]
    async fn test_observers_see_status_changes() {
        let (store, task) = store_with(3);
        let observers = EventStream::default();
        let mut events = observers.subscribe();
        let mut rec = TaskRecord::new(task, store.clone(), observers);

        rec.on_ended(0, &ExitMessages::default());

        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::TaskEnded {
                task_id: 1,
                exit_code: 0
            }
        );
        let mut saw_change = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (MonitorEvent::StatusChanged {
                    task_id: 1,
                    from: TaskStatus::Running,
                    to: TaskStatus::Finished,
                })
            {
                saw_change = true;
            }
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn test_observers_see_kill_before_status_change() {
        let (store, task) = store_with(40);
        let observers = EventStream::default();
        let mut events = observers.subscribe();
        let mut rec = TaskRecord::new(task, store.clone(), observers);

        rec.on_killed(&ExitMessages::default());

        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::TaskKilled { task_id: 1 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::StatusChanged {
                task_id: 1,
                from: TaskStatus::Running,
                to: TaskStatus::Killed,
            }
        );
    }
}
