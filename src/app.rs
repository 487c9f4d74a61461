//! Application state and main event loop

use crate::config::Config;
use crate::core::{
    system_probe_factory, Admission, ProbeFactory, SupervisorEvent, SupervisorFactory, TaskEvent,
    TaskId, TaskOrchestrator,
};
use crate::events::{EventStream, MonitorEvent};
use crate::load::{LoadProbe, SystemLoad};
use crate::store::{JsonFileStore, TaskStore};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Application state
pub struct App {
    orchestrator: TaskOrchestrator,
    event_rx: mpsc::UnboundedReceiver<TaskEvent>,
    observers: EventStream,
    reconcile_interval: Duration,
    admission_interval: Duration,
    shutdown_grace: Duration,
}

impl App {
    /// Create the app on the host's process table and the configured store
    pub fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(config.store.clone()));
        Self::new(
            config,
            store,
            Box::new(SystemLoad::new()),
            system_probe_factory(),
        )
    }

    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        load: Box<dyn LoadProbe>,
        probes: ProbeFactory,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let observers = EventStream::default();
        let factory = SupervisorFactory::new(config.supervisor.clone(), event_tx, probes);

        let reconcile_interval = config.reconcile_interval();
        let admission_interval = config.admission_interval();
        let shutdown_grace = config.supervisor.kill_grace() + Duration::from_secs(1);

        let orchestrator =
            TaskOrchestrator::new(config, store, load, factory, observers.clone())?;

        Ok(Self {
            orchestrator,
            event_rx,
            observers,
            reconcile_interval,
            admission_interval,
            shutdown_grace,
        })
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    /// Subscribe to observer events
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.observers.subscribe()
    }

    /// Run until Ctrl-C
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the reconcile/admission loop until `shutdown` resolves
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let recovered = self
            .orchestrator
            .recover_stale_runs()
            .context("Failed to read the task store")?;
        if recovered > 0 {
            log::warn!("Marked {} stale running tasks as failed", recovered);
        }

        let mut reconcile = interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut admission = interval_at(
            Instant::now() + self.admission_interval,
            self.admission_interval,
        );
        admission.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        log::info!(
            "Supervising tasks (reconcile every {:?}, admission every {:?})",
            self.reconcile_interval,
            self.admission_interval
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.orchestrator.reconcile() {
                        log::warn!("Reconciliation skipped: {}", e);
                    }
                }
                _ = admission.tick() => {
                    match self.orchestrator.admission_tick() {
                        Ok(Admission::Started { task_id, pid }) => {
                            log::info!("Task {} dispatched as PID {}", task_id, pid);
                        }
                        Ok(_) => {}
                        Err(e) if e.is_configuration() => {
                            self.shutdown().await;
                            return Err(e).context("Launch command cannot be spawned");
                        }
                        Err(e) => log::error!("Admission failed: {}", e),
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.orchestrator.handle_event(event);
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Kill every running task and wait for their outcomes to be stored
    pub async fn shutdown(&mut self) {
        let mut pending: HashSet<TaskId> = self.orchestrator.kill_all().into_iter().collect();
        if pending.is_empty() {
            return;
        }
        log::info!("Stopping {} running tasks", pending.len());

        let deadline = Instant::now() + self.shutdown_grace;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.event_rx.recv()).await {
                Ok(Some(event)) => {
                    if matches!(
                        event.event,
                        SupervisorEvent::Killed | SupervisorEvent::Ended { .. }
                    ) {
                        pending.remove(&event.task_id);
                    }
                    self.orchestrator.handle_event(event);
                }
                Ok(None) | Err(_) => break,
            }
        }

        if !pending.is_empty() {
            log::warn!(
                "{} tasks did not confirm termination: {:?}",
                pending.len(),
                pending
            );
        }
    }
}
