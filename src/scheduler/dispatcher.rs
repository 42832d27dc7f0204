//! Dispatch cycles.
//!
//! One cycle reads a bounded batch of due records, earliest first, and
//! dispatches each through the engine. Failures are isolated per record.
//! Cycles never overlap: a second caller gets
//! [`EngineError::CycleInProgress`] instead of a concurrent scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use crate::error::EngineError;
use crate::execution::{Dispatch, Engine};
use crate::store::{ExecutionRecord, ExecutionStatus};

/// Default number of due records taken per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Counts for one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Due records read
    pub due: usize,
    /// Claims won
    pub claimed: usize,
    /// Claims lost to another writer
    pub lost_claim: usize,
    /// Moved to another node and still pending
    pub advanced: usize,
    /// Still pending at the same node
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    /// Results that lost their commit and were left running
    pub commit_conflicts: usize,
    /// Records whose dispatch raised a store error
    pub errors: usize,
}

impl CycleReport {
    fn record(&mut self, before: &ExecutionRecord, dispatch: Dispatch) {
        match dispatch {
            Dispatch::NotDispatchable(_) => {}
            Dispatch::LostClaim => self.lost_claim += 1,
            Dispatch::CommitConflict => {
                self.claimed += 1;
                self.commit_conflicts += 1;
            }
            Dispatch::Committed(after) => {
                self.claimed += 1;
                match after.status {
                    ExecutionStatus::Completed => self.completed += 1,
                    ExecutionStatus::Failed => self.failed += 1,
                    ExecutionStatus::Pending if after.current_node_id == before.current_node_id => {
                        self.waiting += 1
                    }
                    _ => self.advanced += 1,
                }
            }
        }
    }
}

/// Resets the active flag when a cycle ends, including by panic.
struct ActiveCycle<'a>(&'a AtomicBool);

impl Drop for ActiveCycle<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs dispatch cycles against an engine.
pub struct Dispatcher {
    engine: Arc<Engine>,
    batch_size: usize,
    active: AtomicBool,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            batch_size: DEFAULT_BATCH_SIZE,
            active: AtomicBool::new(false),
        }
    }

    /// Sets the per-cycle batch size (at least 1).
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs one cycle at `now`.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, EngineError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::CycleInProgress);
        }
        let _active = ActiveCycle(&self.active);

        let due = self.engine.store().due(now, self.batch_size)?;
        let mut report = CycleReport {
            due: due.len(),
            ..CycleReport::default()
        };
        if due.is_empty() {
            debug!("No executions due at {}", now.to_rfc3339());
            return Ok(report);
        }

        for record in &due {
            match self.engine.dispatch_record(record, now) {
                Ok(dispatch) => report.record(record, dispatch),
                Err(e) => {
                    error!("Dispatch of execution {} failed: {}", record.id, e);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Cycle: {} due, {} claimed, {} advanced, {} waiting, {} completed, {} failed, {} lost, {} conflicts",
            report.due,
            report.claimed,
            report.advanced,
            report.waiting,
            report.completed,
            report.failed,
            report.lost_claim,
            report.commit_conflicts
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{EnrollOptions, MemoryDirectory, MemoryOutbox};
    use crate::store::{ExecutionStore, MemoryStore};
    use crate::testing::{registry, t0};
    use chrono::Duration;
    use std::sync::Barrier;
    use std::thread;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryOutbox>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let engine = Engine::new(
            store.clone(),
            Arc::new(registry()),
            outbox.clone(),
            Arc::new(MemoryDirectory::new()),
        );
        (store, outbox, Dispatcher::new(Arc::new(engine)))
    }

    fn enroll(dispatcher: &Dispatcher, workflow: &str, contact: &str) -> ExecutionRecord {
        dispatcher
            .engine()
            .enroll(
                workflow,
                contact,
                &format!("{}@example.com", contact),
                EnrollOptions::default(),
                t0(),
            )
            .unwrap()
    }

    #[test]
    fn test_delay_scenario() {
        let (store, _, dispatcher) = setup();
        let record = enroll(&dispatcher, "delay-demo", "c1");
        assert_eq!(record.current_node_id, "wait");
        assert_eq!(record.scheduled_for, Some(t0() + Duration::hours(1)));

        let early = dispatcher.run_cycle(t0() + Duration::minutes(30)).unwrap();
        assert_eq!(early, CycleReport::default());
        assert_eq!(store.get(record.id).unwrap().unwrap(), record);

        let report = dispatcher.run_cycle(t0() + Duration::minutes(61)).unwrap();
        assert_eq!(report.completed, 1);
        let done = store.get(record.id).unwrap().unwrap();
        assert_eq!(done.current_node_id, "B");
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_delay_accuracy_with_one_minute_period() {
        let (store, _, dispatcher) = setup();
        let record = enroll(&dispatcher, "delay-demo", "c1");

        let mut advanced_at = None;
        for minute in 1..=90 {
            let now = t0() + Duration::minutes(minute);
            dispatcher.run_cycle(now).unwrap();
            let current = store.get(record.id).unwrap().unwrap();
            if current.current_node_id != "wait" {
                advanced_at = Some(now);
                break;
            }
        }

        let advanced_at = advanced_at.unwrap();
        assert!(advanced_at >= t0() + Duration::hours(1));
        assert!(advanced_at <= t0() + Duration::hours(1) + Duration::minutes(1));
    }

    #[test]
    fn test_multi_step_journey_sends_each_message_once() {
        let (store, outbox, dispatcher) = setup();
        let record = enroll(&dispatcher, "nurture", "c1");
        assert_eq!(record.current_node_id, "mail");

        dispatcher.run_cycle(t0()).unwrap();
        let waiting = store.get(record.id).unwrap().unwrap();
        assert_eq!(waiting.current_node_id, "wait");
        assert_eq!(waiting.scheduled_for, Some(t0() + Duration::days(2)));

        let later = t0() + Duration::days(2);
        assert_eq!(dispatcher.run_cycle(later).unwrap().advanced, 1);
        assert_eq!(dispatcher.run_cycle(later).unwrap().completed, 1);

        let templates: Vec<_> = outbox.delivered().iter().map(|d| d.node_id.clone()).collect();
        assert_eq!(templates, vec!["mail".to_string(), "followup".to_string()]);
    }

    #[test]
    fn test_concurrent_dispatch_single_claim() {
        let (store, _, dispatcher) = setup();
        let record = enroll(&dispatcher, "nurture", "c1");
        let observed = store.get(record.id).unwrap().unwrap();
        let engine = Arc::clone(dispatcher.engine());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                let observed = observed.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.dispatch_record(&observed, t0()).unwrap()
                })
            })
            .collect();
        let results: Vec<Dispatch> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let committed = results
            .iter()
            .filter(|d| matches!(d, Dispatch::Committed(_)))
            .count();
        let lost = results.iter().filter(|d| **d == Dispatch::LostClaim).count();
        assert_eq!((committed, lost), (1, 1));

        let current = store.get(record.id).unwrap().unwrap();
        assert_eq!(current.current_node_id, "wait");
        assert_eq!(current.revision, observed.revision + 2);
    }

    #[test]
    fn test_cycle_skips_cancelled_records() {
        let (store, outbox, dispatcher) = setup();
        let record = enroll(&dispatcher, "nurture", "c1");
        dispatcher.engine().cancel(record.id, t0()).unwrap();

        let report = dispatcher.run_cycle(t0()).unwrap();
        assert_eq!(report.due, 0);
        assert!(outbox.delivered().is_empty());
        assert_eq!(
            store.get(record.id).unwrap().unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[test]
    fn test_batch_size_bounds_cycle() {
        let (_, _, mut dispatcher) = setup();
        dispatcher.set_batch_size(2);
        for contact in ["a", "b", "c"] {
            enroll(&dispatcher, "fan", contact);
        }

        assert_eq!(dispatcher.run_cycle(t0()).unwrap().completed, 2);
        assert_eq!(dispatcher.run_cycle(t0()).unwrap().completed, 1);
        assert_eq!(dispatcher.run_cycle(t0()).unwrap().due, 0);
    }

    #[test]
    fn test_overlapping_cycle_rejected() {
        let (_, _, dispatcher) = setup();
        dispatcher.active.store(true, Ordering::SeqCst);
        assert!(matches!(
            dispatcher.run_cycle(t0()),
            Err(EngineError::CycleInProgress)
        ));

        dispatcher.active.store(false, Ordering::SeqCst);
        assert!(dispatcher.run_cycle(t0()).is_ok());
        assert!(!dispatcher.is_active());
    }

    #[test]
    fn test_failure_is_isolated() {
        let (store, outbox, dispatcher) = setup();
        let bad = enroll(&dispatcher, "nurture", "bad");
        let good = enroll(&dispatcher, "nurture", "good");
        outbox.reject_recipient("bad@example.com");

        let report = dispatcher.run_cycle(t0()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.advanced, 1);

        let bad = store.get(bad.id).unwrap().unwrap();
        assert_eq!(bad.status, ExecutionStatus::Failed);
        assert!(bad.error_message.unwrap().contains("refused"));
        assert_eq!(store.get(good.id).unwrap().unwrap().current_node_id, "wait");
    }
}
