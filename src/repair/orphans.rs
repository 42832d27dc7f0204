//! Orphan reclamation.
//!
//! A record left `running` past the grace period lost its dispatch attempt.
//! It goes back to `pending` at the same node, due now. A delay wait in
//! progress keeps its wake marker.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use super::{read_page, RepairDetail, RepairOptions, RepairReport};
use crate::error::StoreResult;
use crate::store::{CasOutcome, ExecutionStatus, ExecutionStore, RecordQuery};

/// Requeues one batch of running records older than `grace`.
pub fn reclaim_orphans(
    store: &dyn ExecutionStore,
    now: DateTime<Utc>,
    grace: Duration,
    options: &RepairOptions,
) -> StoreResult<RepairReport> {
    let mut report = RepairReport::new("reclaim-orphans", options);
    let batch = read_page(
        store,
        RecordQuery::new().with_status(ExecutionStatus::Running),
        options,
    )?;

    for record in &batch {
        let claimed_at = record.claimed_at.unwrap_or(record.node_entered_at);
        let running_for = now - claimed_at;
        if running_for <= grace {
            report.already_correct += 1;
            continue;
        }

        let note = format!("running for {}s", running_for.num_seconds());
        if options.dry_run {
            report.note_fixed(RepairDetail::new(record, format!("would requeue, {}", note)));
            continue;
        }

        let next = record.pending_at(&record.current_node_id, now, now);
        match store.compare_and_swap(record, next)? {
            CasOutcome::Applied(_) => report.note_fixed(RepairDetail::new(record, note)),
            CasOutcome::Conflict => {
                debug!("Orphan {} changed before requeue", record.id);
                report.conflicts += 1;
            }
        }
    }

    report.finish_batch(&batch, options.batch_size);
    info!("{}", report);
    Ok(report)
}
