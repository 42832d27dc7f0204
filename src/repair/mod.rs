//! Consistency & Repair
//!
//! Re-runnable routines that find and correct records the dispatcher will
//! not fix by itself. Every routine:
//! - writes only through conditional updates, so it can run beside the scheduler
//! - scans one bounded batch in execution-id order from a cursor and hands
//!   back the next cursor while more may remain
//! - supports a dry run that counts intended changes without writing
//! - changes nothing on a second run over the same state
//!
//! # Routines
//!
//! - [`drift`]: Put records waiting out a delay back on the delay node
//! - [`orphans`]: Requeue records stuck in `running`
//! - [`retry`]: Re-stagger failed or past-due records across a window
//! - [`reroute`]: Move every execution at one node to another
//! - [`diagnostics`]: Read-only stats and samples

pub mod diagnostics;
pub mod drift;
pub mod orphans;
pub mod reroute;
pub mod retry;

use std::fmt;

use log::{debug, info};

use crate::error::StoreError;
use crate::store::{ExecutionId, ExecutionRecord, ExecutionStore, RecordQuery};

pub use diagnostics::{collect_stats, failed_samples, inspect, waiting_at, Inspection, StatsReport};
pub use drift::{fix_drift, position_of, Position};
pub use orphans::reclaim_orphans;
pub use reroute::{reroute, RerouteRequest};
pub use retry::{retry_failed, spread_pending, RetryRequest};

/// Batch controls shared by every routine.
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Count intended changes without writing
    pub dry_run: bool,
    /// Records examined per batch
    pub batch_size: usize,
    /// Resume after this execution id
    pub cursor: Option<ExecutionId>,
    /// Detail rows kept per report
    pub detail_limit: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            batch_size: 200,
            cursor: None,
            detail_limit: 20,
        }
    }
}

impl RepairOptions {
    pub fn apply() -> Self {
        Self {
            dry_run: false,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cursor(mut self, cursor: Option<ExecutionId>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_detail_limit(mut self, detail_limit: usize) -> Self {
        self.detail_limit = detail_limit;
        self
    }

    pub(crate) fn page(&self, query: RecordQuery) -> RecordQuery {
        query.after(self.cursor).limit(self.batch_size.max(1))
    }
}

/// One record a routine changed, would change, or skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairDetail {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub node_id: String,
    pub note: String,
}

impl RepairDetail {
    pub fn new(record: &ExecutionRecord, note: impl Into<String>) -> Self {
        Self {
            execution_id: record.id,
            workflow_id: record.workflow_id.clone(),
            node_id: record.current_node_id.clone(),
            note: note.into(),
        }
    }
}

impl fmt::Display for RepairDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} @ {}] {}",
            self.execution_id, self.workflow_id, self.node_id, self.note
        )
    }
}

/// Aggregated result of one batch (or of a converged run).
#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub routine: &'static str,
    pub dry_run: bool,
    /// Records read
    pub scanned: usize,
    /// Records changed, or that would change in a dry run
    pub fixed: usize,
    /// Records checked and found valid
    pub already_correct: usize,
    /// Ambiguous records left untouched for manual review
    pub skipped: usize,
    /// Writes lost to a concurrent writer
    pub conflicts: usize,
    pub fixed_details: Vec<RepairDetail>,
    pub skipped_details: Vec<RepairDetail>,
    /// Cursor for the next batch; present exactly when more work may remain
    pub next_cursor: Option<ExecutionId>,
    detail_limit: usize,
}

impl RepairReport {
    pub fn new(routine: &'static str, options: &RepairOptions) -> Self {
        Self {
            routine,
            dry_run: options.dry_run,
            scanned: 0,
            fixed: 0,
            already_correct: 0,
            skipped: 0,
            conflicts: 0,
            fixed_details: Vec::new(),
            skipped_details: Vec::new(),
            next_cursor: None,
            detail_limit: options.detail_limit,
        }
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    pub(crate) fn note_fixed(&mut self, detail: RepairDetail) {
        self.fixed += 1;
        if self.fixed_details.len() < self.detail_limit {
            self.fixed_details.push(detail);
        }
    }

    pub(crate) fn note_skipped(&mut self, detail: RepairDetail) {
        self.skipped += 1;
        if self.skipped_details.len() < self.detail_limit {
            self.skipped_details.push(detail);
        }
    }

    /// Sets the cursor from a batch: the last id if the batch was full.
    pub(crate) fn finish_batch(&mut self, batch: &[ExecutionRecord], batch_size: usize) {
        self.scanned += batch.len();
        self.next_cursor = if batch.len() >= batch_size {
            batch.last().map(|r| r.id)
        } else {
            None
        };
    }

    fn merge(&mut self, other: RepairReport) {
        self.scanned += other.scanned;
        self.fixed += other.fixed;
        self.already_correct += other.already_correct;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        for detail in other.fixed_details {
            if self.fixed_details.len() < self.detail_limit {
                self.fixed_details.push(detail);
            }
        }
        for detail in other.skipped_details {
            if self.skipped_details.len() < self.detail_limit {
                self.skipped_details.push(detail);
            }
        }
        self.next_cursor = other.next_cursor;
    }
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}: scanned {}, fixed {}, already correct {}, skipped {}, conflicts {}",
            self.routine,
            if self.dry_run { " (dry run)" } else { "" },
            self.scanned,
            self.fixed,
            self.already_correct,
            self.skipped,
            self.conflicts
        )
    }
}

/// Runs batches from `options.cursor` until no cursor remains and merges the reports.
pub fn run_to_convergence<F, E>(options: &RepairOptions, mut batch: F) -> Result<RepairReport, E>
where
    F: FnMut(&RepairOptions) -> Result<RepairReport, E>,
{
    let mut current = options.clone();
    let mut total = batch(&current)?;
    let mut batches = 1;

    while let Some(cursor) = total.next_cursor {
        current.cursor = Some(cursor);
        let next = batch(&current)?;
        total.merge(next);
        batches += 1;
        debug!("{}: batch {} done, cursor {:?}", total.routine, batches, total.next_cursor);
    }

    info!("{} converged after {} batches", total, batches);
    Ok(total)
}

/// Reads one page of records for a routine.
pub(crate) fn read_page(
    store: &dyn ExecutionStore,
    query: RecordQuery,
    options: &RepairOptions,
) -> Result<Vec<ExecutionRecord>, StoreError> {
    store.scan(&options.page(query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionStatus, MemoryStore};
    use crate::testing::t0;

    fn fill(store: &MemoryStore, n: usize) {
        for i in 0..n {
            store
                .insert(ExecutionRecord::enroll(
                    "w",
                    1,
                    format!("c{}", i),
                    "x@example.com",
                    "start",
                    t0(),
                ))
                .unwrap();
        }
    }

    fn count_batch(
        store: &MemoryStore,
        options: &RepairOptions,
    ) -> Result<RepairReport, StoreError> {
        let mut report = RepairReport::new("count", options);
        let batch = read_page(
            store,
            RecordQuery::new().with_status(ExecutionStatus::Pending),
            options,
        )?;
        for record in &batch {
            report.note_fixed(RepairDetail::new(record, "seen"));
        }
        report.finish_batch(&batch, options.batch_size);
        Ok(report)
    }

    #[test]
    fn test_cursor_walks_all_records() {
        let store = MemoryStore::new();
        fill(&store, 7);
        let options = RepairOptions::default().with_batch_size(3).with_detail_limit(5);

        let first = count_batch(&store, &options).unwrap();
        assert_eq!(first.fixed, 3);
        assert!(first.has_more());

        let total = run_to_convergence(&options, |o| count_batch(&store, o)).unwrap();
        assert_eq!(total.scanned, 7);
        assert_eq!(total.fixed, 7);
        assert_eq!(total.fixed_details.len(), 5);
        assert!(!total.has_more());
    }

    #[test]
    fn test_exact_multiple_needs_one_empty_batch() {
        let store = MemoryStore::new();
        fill(&store, 4);
        let options = RepairOptions::default().with_batch_size(2);

        let total = run_to_convergence(&options, |o| count_batch(&store, o)).unwrap();
        assert_eq!(total.scanned, 4);
        assert!(!total.has_more());
    }

    #[test]
    fn test_report_display() {
        let report = RepairReport::new("drift", &RepairOptions::default());
        assert_eq!(
            report.to_string(),
            "drift (dry run): scanned 0, fixed 0, already correct 0, skipped 0, conflicts 0"
        );
    }
}
