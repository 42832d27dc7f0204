//! Jittered retry and re-staggering.
//!
//! Bulk resets spread their new schedules uniformly over `[now, now + window)`
//! so the records do not all come due in the same cycle and contend again.
//! Re-staggering only touches records due strictly before `now`, so a second
//! pass at the same instant finds nothing to do.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use rand::Rng;

use super::{read_page, RepairDetail, RepairOptions, RepairReport};
use crate::error::StoreResult;
use crate::store::{CasOutcome, ExecutionStatus, ExecutionStore, RecordQuery};
use crate::workflow::{WorkflowGraph, WorkflowRegistry};

/// Returns a uniform offset in `[0, window)`.
pub fn jitter<R: Rng>(rng: &mut R, window: Duration) -> Duration {
    let millis = window.num_milliseconds();
    if millis <= 0 {
        return Duration::zero();
    }
    Duration::milliseconds(rng.gen_range(0..millis))
}

/// Parameters for resetting failed records.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub window: Duration,
    pub workflow_id: Option<String>,
    /// Restart at this node instead of the node that failed
    pub reset_to_node: Option<String>,
}

impl RetryRequest {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            workflow_id: None,
            reset_to_node: None,
        }
    }
}

/// Resets one batch of failed records to pending with jittered schedules.
pub fn retry_failed<R: Rng>(
    store: &dyn ExecutionStore,
    registry: &WorkflowRegistry,
    request: &RetryRequest,
    now: DateTime<Utc>,
    options: &RepairOptions,
    rng: &mut R,
) -> StoreResult<RepairReport> {
    let mut report = RepairReport::new("retry-failed", options);

    let mut query = RecordQuery::new().with_status(ExecutionStatus::Failed);
    if let Some(id) = &request.workflow_id {
        query = query.with_workflow(id.clone());
    }
    let batch = read_page(store, query, options)?;

    for record in &batch {
        let target = match &request.reset_to_node {
            None => record.current_node_id.clone(),
            Some(node_id) => {
                let exists = registry
                    .get(&record.workflow_id, record.workflow_version)
                    .map(|def| WorkflowGraph::new(&def).find_node(node_id).is_some())
                    .unwrap_or(false);
                if !exists {
                    report.note_skipped(RepairDetail::new(
                        record,
                        format!("'{}' not in v{}", node_id, record.workflow_version),
                    ));
                    continue;
                }
                node_id.clone()
            }
        };

        let scheduled_for = now + jitter(rng, request.window);
        let note = format!("retry at '{}' from {}", target, scheduled_for.to_rfc3339());
        if options.dry_run {
            report.note_fixed(RepairDetail::new(record, format!("would {}", note)));
            continue;
        }

        let next = record.pending_at(&target, scheduled_for, now);
        match store.compare_and_swap(record, next)? {
            CasOutcome::Applied(_) => report.note_fixed(RepairDetail::new(record, note)),
            CasOutcome::Conflict => {
                debug!("Retry of {} lost to a concurrent write", record.id);
                report.conflicts += 1;
            }
        }
    }

    report.finish_batch(&batch, options.batch_size);
    info!("{}", report);
    Ok(report)
}

/// Re-staggers one batch of past-due pending records across `window`.
pub fn spread_pending<R: Rng>(
    store: &dyn ExecutionStore,
    workflow_id: Option<&str>,
    window: Duration,
    now: DateTime<Utc>,
    options: &RepairOptions,
    rng: &mut R,
) -> StoreResult<RepairReport> {
    let mut report = RepairReport::new("spread-pending", options);

    let mut query = RecordQuery::new().with_status(ExecutionStatus::Pending);
    if let Some(id) = workflow_id {
        query = query.with_workflow(id);
    }
    let batch = read_page(store, query, options)?;

    for record in &batch {
        let past_due = record.scheduled_for.map_or(false, |at| at < now);
        if !past_due {
            report.already_correct += 1;
            continue;
        }

        let scheduled_for = now + jitter(rng, window);
        let note = format!("due {}", scheduled_for.to_rfc3339());
        if options.dry_run {
            report.note_fixed(RepairDetail::new(record, format!("would be {}", note)));
            continue;
        }

        let next = record.pending_at(&record.current_node_id, scheduled_for, now);
        match store.compare_and_swap(record, next)? {
            CasOutcome::Applied(_) => report.note_fixed(RepairDetail::new(record, note)),
            CasOutcome::Conflict => report.conflicts += 1,
        }
    }

    report.finish_batch(&batch, options.batch_size);
    info!("{}", report);
    Ok(report)
}
