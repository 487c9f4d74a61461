//! Process supervisor - runs one task process and watches its whole tree
//!
//! Each started process gets its own tokio task that owns the child handle
//! and a [`Monitor`]. It samples usage, keeps the running clock and checks
//! for hangs on independent periods, and reports through [`TaskEvent`]s.
//! Tree kills run on that task too, so their grace period never stalls the
//! orchestrator loop.

use super::process::{exit_code_of, spawn_logged, ProbeFactory, ProcessProbe, ProcessState};
use super::TaskId;
use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Lifecycle and metric events of a supervised process
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Started { pid: u32 },
    Ended { exit_code: i32 },
    Killed,
    NonResponding,
    ResourceUpdated { cpu_percent: f32, ram_mb: f64 },
    RunningTimeUpdated { seconds: f64 },
}

/// A supervisor event tagged with the task it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub event: SupervisorEvent,
}

/// Timing and policy knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub sample_interval_ms: u64,
    pub clock_interval_ms: u64,
    pub watchdog_interval_ms: u64,
    /// Samples kept for the hang heuristic
    pub window_size: usize,
    /// Consecutive "no such process" samples tolerated before giving up
    pub not_found_retries: u32,
    pub kill_grace_ms: u64,
    /// Treat a full window of zero CPU and flat RAM as hung
    pub detect_hung: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 500,
            clock_interval_ms: 500,
            watchdog_interval_ms: 2000,
            window_size: 60,
            not_found_retries: 5,
            kill_grace_ms: 5000,
            detect_hung: true,
        }
    }
}

impl SupervisorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Bounded history of (cpu %, rss bytes) samples
#[derive(Debug, Clone)]
pub struct UsageWindow {
    capacity: usize,
    samples: VecDeque<(f32, u64)>,
}

impl UsageWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, cpu_percent: f32, rss_bytes: u64) {
        self.samples.push_back((cpu_percent, rss_bytes));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// No CPU at all and not a single byte of RAM movement over the window
    pub fn looks_hung(&self) -> bool {
        let Some(&(_, first_rss)) = self.samples.front() else {
            return false;
        };
        self.samples
            .iter()
            .all(|&(cpu, rss)| cpu == 0.0 && rss == first_rss)
    }
}

/// Result of one sampling tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Usage { cpu_percent: f32, ram_mb: f64 },
    /// Process not found; still inside the retry budget
    Lost { attempt: u32 },
    /// Process is gone for good (zombie or budget exhausted)
    Gone,
}

/// Sampling state for one running process
pub struct Monitor {
    pid: u32,
    probe: Box<dyn ProcessProbe>,
    window: UsageWindow,
    not_found: u32,
    not_found_retries: u32,
    detect_hung: bool,
    hung_reported: bool,
}

impl Monitor {
    pub fn new(pid: u32, probe: Box<dyn ProcessProbe>, config: &SupervisorConfig) -> Self {
        Self {
            pid,
            probe,
            window: UsageWindow::new(config.window_size),
            not_found: 0,
            not_found_retries: config.not_found_retries,
            detect_hung: config.detect_hung,
            hung_reported: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn window(&self) -> &UsageWindow {
        &self.window
    }

    pub fn probe_mut(&mut self) -> &mut dyn ProcessProbe {
        self.probe.as_mut()
    }

    /// Sum usage over the process and all of its descendants
    pub fn sample(&mut self) -> Sample {
        self.probe.refresh();
        match self.probe.state(self.pid) {
            ProcessState::Missing => {
                self.not_found += 1;
                if self.not_found > self.not_found_retries {
                    Sample::Gone
                } else {
                    Sample::Lost {
                        attempt: self.not_found,
                    }
                }
            }
            ProcessState::Zombie => Sample::Gone,
            ProcessState::Alive => {
                let mut pids = vec![self.pid];
                pids.extend(self.probe.descendants(self.pid));
                let usage = self.probe.usage(&pids);
                let cores = self.probe.logical_cores().max(1) as f32;
                let cpu_percent = usage.cpu_percent / cores;

                self.not_found = 0;
                self.window.push(cpu_percent, usage.rss_bytes);
                Sample::Usage {
                    cpu_percent,
                    ram_mb: usage.rss_bytes as f64 / BYTES_PER_MB,
                }
            }
        }
    }

    /// True exactly once, the first time a full window looks hung
    pub fn check_responsive(&mut self) -> bool {
        if !self.detect_hung || self.hung_reported || !self.window.is_full() {
            return false;
        }
        if self.window.looks_hung() {
            self.hung_reported = true;
            return true;
        }
        false
    }
}

/// Builds supervisors that all report into the same event channel
#[derive(Clone)]
pub struct SupervisorFactory {
    config: SupervisorConfig,
    events: mpsc::UnboundedSender<TaskEvent>,
    probes: ProbeFactory,
}

impl SupervisorFactory {
    pub fn new(
        config: SupervisorConfig,
        events: mpsc::UnboundedSender<TaskEvent>,
        probes: ProbeFactory,
    ) -> Self {
        Self {
            config,
            events,
            probes,
        }
    }

    pub fn build(&self, task_id: TaskId, command: String) -> ProcessSupervisor {
        ProcessSupervisor {
            task_id,
            command,
            config: self.config.clone(),
            events: self.events.clone(),
            probes: self.probes.clone(),
            control: None,
        }
    }
}

/// Owner of one task's launch command and, once started, its process
pub struct ProcessSupervisor {
    task_id: TaskId,
    command: String,
    config: SupervisorConfig,
    events: mpsc::UnboundedSender<TaskEvent>,
    probes: ProbeFactory,
    /// Kill switch of the running monitor; dropping it also kills the tree
    control: Option<oneshot::Sender<()>>,
}

impl ProcessSupervisor {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether a monitored process is still running
    pub fn is_active(&self) -> bool {
        self.control.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Spawn the command with output in `log_path` and start monitoring it
    pub fn start(&mut self, log_path: &Path) -> Result<u32, SupervisorError> {
        let child = spawn_logged(&self.command, log_path)?;
        let Some(pid) = child.id() else {
            // Exited and reaped before we could look at it
            return Err(SupervisorError::Spawn {
                command: self.command.clone(),
                source: std::io::Error::other("process exited before its PID was read"),
            });
        };

        log::info!(
            "Task {} started with PID {}: {}",
            self.task_id,
            pid,
            self.command
        );
        self.emit(SupervisorEvent::Started { pid });

        let (control_tx, control_rx) = oneshot::channel();
        self.control = Some(control_tx);

        let monitor = Monitor::new(pid, (self.probes)(), &self.config);
        tokio::spawn(supervise(
            self.task_id,
            child,
            monitor,
            self.config.clone(),
            self.events.clone(),
            control_rx,
        ));

        Ok(pid)
    }

    /// Terminate the process tree; without a live process report it as ended
    pub fn kill(&mut self) {
        if let Some(control) = self.control.take() {
            if control.send(()).is_ok() {
                return;
            }
        }
        log::debug!("Task {} has no running process to kill", self.task_id);
        self.emit(SupervisorEvent::Ended { exit_code: 0 });
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(TaskEvent {
            task_id: self.task_id,
            event,
        });
    }
}

fn ticker(period_ms: u64) -> Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn supervise(
    task_id: TaskId,
    mut child: Child,
    mut monitor: Monitor,
    config: SupervisorConfig,
    events: mpsc::UnboundedSender<TaskEvent>,
    mut control: oneshot::Receiver<()>,
) {
    let emit = |event| {
        let _ = events.send(TaskEvent { task_id, event });
    };
    let started = Instant::now();
    let mut sampler = ticker(config.sample_interval_ms);
    let mut clock = ticker(config.clock_interval_ms);
    let mut watchdog = ticker(config.watchdog_interval_ms);

    loop {
        tokio::select! {
            request = &mut control => {
                if request.is_err() {
                    log::warn!(
                        "Supervisor of task {} dropped while PID {} runs; killing it",
                        task_id,
                        monitor.pid()
                    );
                }
                kill_tree(task_id, &mut child, &mut monitor, config.kill_grace()).await;
                emit(SupervisorEvent::Killed);
                break;
            }
            _ = sampler.tick() => {
                if let Ok(Some(status)) = child.try_wait() {
                    let exit_code = exit_code_of(status);
                    log::info!("Task {} (PID {}) exited with code {}", task_id, monitor.pid(), exit_code);
                    emit(SupervisorEvent::Ended { exit_code });
                    break;
                }
                match monitor.sample() {
                    Sample::Usage { cpu_percent, ram_mb } => {
                        emit(SupervisorEvent::ResourceUpdated { cpu_percent, ram_mb });
                    }
                    Sample::Lost { attempt } => {
                        log::debug!(
                            "Task {}: PID {} not found, attempt {}",
                            task_id,
                            monitor.pid(),
                            attempt
                        );
                    }
                    Sample::Gone => {
                        let exit_code = match child.try_wait() {
                            Ok(Some(status)) => exit_code_of(status),
                            _ => 0,
                        };
                        log::info!("Task {} (PID {}) ended, exit code {}", task_id, monitor.pid(), exit_code);
                        emit(SupervisorEvent::Ended { exit_code });
                        break;
                    }
                }
            }
            _ = clock.tick() => {
                emit(SupervisorEvent::RunningTimeUpdated {
                    seconds: started.elapsed().as_secs_f64(),
                });
            }
            _ = watchdog.tick() => {
                if monitor.check_responsive() {
                    log::warn!(
                        "Task {} (PID {}) shows no CPU and flat memory for {} samples",
                        task_id,
                        monitor.pid(),
                        monitor.window().len()
                    );
                    emit(SupervisorEvent::NonResponding);
                }
            }
        }
    }

    emit(SupervisorEvent::ResourceUpdated {
        cpu_percent: 0.0,
        ram_mb: 0.0,
    });
}

/// SIGTERM the descendants and then the parent, wait out the grace period,
/// SIGKILL whatever is left.
async fn kill_tree(task_id: TaskId, child: &mut Child, monitor: &mut Monitor, grace: Duration) {
    let pid = monitor.pid();
    let probe = monitor.probe_mut();
    probe.refresh();
    let descendants = probe.descendants(pid);
    log::info!(
        "Killing task {}: PID {} and {} descendants",
        task_id,
        pid,
        descendants.len()
    );

    for d in &descendants {
        probe.terminate(*d);
    }
    probe.terminate(pid);

    let deadline = Instant::now() + grace;
    loop {
        let parent_done = matches!(child.try_wait(), Ok(Some(_)));
        probe.refresh();
        let survivors: Vec<u32> = descendants
            .iter()
            .copied()
            .filter(|d| probe.state(*d) == ProcessState::Alive)
            .collect();

        if parent_done && survivors.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            log::warn!(
                "Task {}: {} processes ignored SIGTERM, sending SIGKILL",
                task_id,
                survivors.len() + usize::from(!parent_done)
            );
            for s in survivors {
                probe.force_kill(s);
            }
            if !parent_done {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
