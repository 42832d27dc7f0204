//! Background scheduler task.
//!
//! Runs one dispatch cycle per tick on the blocking pool. A tick that
//! arrives while the previous cycle is still running is skipped, so cycles
//! never stack up. Every `repair_every_cycles` ticks the task also requeues
//! orphaned `running` records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dispatcher::Dispatcher;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::repair::{reclaim_orphans, run_to_convergence, RepairOptions};

/// Configuration for the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between dispatch cycles
    pub interval: Duration,
    /// Reclaim orphans every N cycles; 0 disables it
    pub repair_every_cycles: u64,
    /// How long a record may stay `running` before it is reclaimed
    pub orphan_grace: chrono::Duration,
    pub repair_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            repair_every_cycles: 0,
            orphan_grace: chrono::Duration::minutes(5),
            repair_batch_size: 200,
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            repair_every_cycles: config.scheduler.repair_every_cycles,
            orphan_grace: config.orphan_grace(),
            repair_batch_size: config.repair.batch_size,
        }
    }
}

/// Periodic dispatch loop.
pub struct SchedulerTask {
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SchedulerTask {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            shutdown_rx,
        }
    }

    /// Runs until the shutdown flag is set or its sender is dropped.
    pub async fn run(mut self) {
        info!(
            "Scheduler started: every {}ms, batch {}, repair every {} cycles",
            self.config.interval.as_millis(),
            self.dispatcher.batch_size(),
            self.config.repair_every_cycles
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles: u64 = 0;

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Scheduler shutting down after {} cycles", cycles);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    self.dispatch().await;
                    let every = self.config.repair_every_cycles;
                    if every > 0 && cycles % every == 0 {
                        self.reclaim().await;
                    }
                }
            }
        }
    }

    async fn dispatch(&self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        match tokio::task::spawn_blocking(move || dispatcher.run_cycle(Utc::now())).await {
            Ok(Ok(report)) => debug!("Cycle finished: {:?}", report),
            Ok(Err(EngineError::CycleInProgress)) => warn!("Previous cycle still running; tick skipped"),
            Ok(Err(e)) => error!("Dispatch cycle failed: {}", e),
            Err(e) => error!("Dispatch cycle panicked: {}", e),
        }
    }

    async fn reclaim(&self) {
        let store = Arc::clone(self.dispatcher.engine().store());
        let grace = self.config.orphan_grace;
        let options = RepairOptions::apply().with_batch_size(self.config.repair_batch_size);

        let result = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            run_to_convergence(&options, |o| reclaim_orphans(store.as_ref(), now, grace, o))
        })
        .await;
        match result {
            Ok(Ok(report)) if report.fixed > 0 => info!("{}", report),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Orphan reclamation failed: {}", e),
            Err(e) => error!("Orphan reclamation panicked: {}", e),
        }
    }
}

/// Spawns a scheduler task; send `true` on the returned sender to stop it.
pub fn spawn_scheduler(
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = SchedulerTask::new(dispatcher, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
