//! Execution Record Store
//!
//! The single source of truth for progression. Every write after insertion
//! is a conditional update against the revision (and status) the writer last
//! read. A lost race comes back as [`CasOutcome::Conflict`], never as an error.
//!
//! # Structure
//!
//! - [`record`]: ExecutionRecord, ExecutionId, ExecutionStatus
//! - [`memory`]: In-process store
//! - [`file`]: JSON snapshot store used by the CLI

pub mod file;
pub mod memory;
pub mod record;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use record::{ExecutionId, ExecutionRecord, ExecutionStatus};

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write applied; holds the stored record with its new revision
    Applied(ExecutionRecord),
    /// The record changed since it was read; nothing was written
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn into_record(self) -> Option<ExecutionRecord> {
        match self {
            Self::Applied(record) => Some(record),
            Self::Conflict => None,
        }
    }
}

/// Filter for cursor-ordered scans.
///
/// Results come back in execution-id order, strictly after `after`, capped at `limit`.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub statuses: Vec<ExecutionStatus>,
    pub workflow_id: Option<String>,
    pub contact_id: Option<String>,
    pub node_id: Option<String>,
    pub after: Option<ExecutionId>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn after(mut self, cursor: Option<ExecutionId>) -> Self {
        self.after = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if a record passes every filter except the cursor and limit.
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self
                .workflow_id
                .as_deref()
                .map_or(true, |id| record.workflow_id == id)
            && self
                .contact_id
                .as_deref()
                .map_or(true, |id| record.contact_id == id)
            && self
                .node_id
                .as_deref()
                .map_or(true, |id| record.current_node_id == id)
    }
}

/// Durable keyed storage for execution records.
pub trait ExecutionStore: Send + Sync {
    /// Inserts a new record. Fails with [`StoreError::Duplicate`] if the id exists.
    fn insert(&self, record: ExecutionRecord) -> StoreResult<ExecutionRecord>;

    fn get(&self, id: ExecutionId) -> StoreResult<Option<ExecutionRecord>>;

    /// Pending records with `scheduled_for <= now`, earliest first, at most `limit`.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<ExecutionRecord>>;

    /// Records matching `query`, in id order.
    fn scan(&self, query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>>;

    /// Writes `next` only if the stored record still has the revision and
    /// status of `observed`. The store assigns the new revision.
    fn compare_and_swap(
        &self,
        observed: &ExecutionRecord,
        next: ExecutionRecord,
    ) -> StoreResult<CasOutcome>;

    /// Number of stored records.
    fn len(&self) -> StoreResult<usize>;
}

/// Keyed record table shared by the store implementations.
pub(crate) type RecordTable = BTreeMap<ExecutionId, ExecutionRecord>;

pub(crate) fn table_insert(
    table: &mut RecordTable,
    mut record: ExecutionRecord,
) -> StoreResult<ExecutionRecord> {
    if table.contains_key(&record.id) {
        return Err(StoreError::Duplicate(record.id.to_string()));
    }
    record.revision = 1;
    table.insert(record.id, record.clone());
    Ok(record)
}

pub(crate) fn table_due(
    table: &RecordTable,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<ExecutionRecord> {
    let mut due: Vec<&ExecutionRecord> = table.values().filter(|r| r.is_due(now)).collect();
    due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id)));
    due.into_iter().take(limit).cloned().collect()
}

pub(crate) fn table_scan(table: &RecordTable, query: &RecordQuery) -> Vec<ExecutionRecord> {
    let records = match query.after {
        Some(cursor) => table.range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded)),
        None => table.range(..),
    };
    records
        .map(|(_, record)| record)
        .filter(|record| query.matches(record))
        .take(query.limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

pub(crate) fn table_compare_and_swap(
    table: &mut RecordTable,
    observed: &ExecutionRecord,
    mut next: ExecutionRecord,
) -> CasOutcome {
    match table.get_mut(&observed.id) {
        Some(current)
            if current.revision == observed.revision
                && current.status == observed.status
                && next.id == observed.id =>
        {
            next.revision = current.revision + 1;
            *current = next.clone();
            CasOutcome::Applied(next)
        }
        _ => CasOutcome::Conflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::t0;
    use chrono::Duration;

    fn record(contact: &str, at: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord::enroll("welcome", 1, contact, format!("{}@example.com", contact), "start", at)
    }

    #[test]
    fn test_query_matches_filters() {
        let r = record("c1", t0());
        assert!(RecordQuery::new().matches(&r));
        assert!(RecordQuery::new().with_status(ExecutionStatus::Pending).matches(&r));
        assert!(!RecordQuery::new().with_status(ExecutionStatus::Failed).matches(&r));
        assert!(RecordQuery::new().with_workflow("welcome").with_node("start").matches(&r));
        assert!(!RecordQuery::new().with_contact("c2").matches(&r));
    }

    #[test]
    fn test_table_due_orders_by_schedule() {
        let mut table = RecordTable::new();
        let late = table_insert(&mut table, record("late", t0() + Duration::minutes(5))).unwrap();
        let early = table_insert(&mut table, record("early", t0())).unwrap();
        table_insert(&mut table, record("future", t0() + Duration::hours(2))).unwrap();

        let due = table_due(&table, t0() + Duration::minutes(10), 10);
        let ids: Vec<_> = due.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);

        assert_eq!(table_due(&table, t0() + Duration::minutes(10), 1).len(), 1);
    }

    #[test]
    fn test_table_scan_cursor() {
        let mut table = RecordTable::new();
        let a = table_insert(&mut table, record("a", t0())).unwrap();
        let b = table_insert(&mut table, record("b", t0())).unwrap();
        let c = table_insert(&mut table, record("c", t0())).unwrap();

        let first = table_scan(&table, &RecordQuery::new().limit(2));
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        let rest = table_scan(&table, &RecordQuery::new().after(Some(b.id)).limit(2));
        assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c.id]);
    }

    #[test]
    fn test_table_cas_conflict_on_stale_revision() {
        let mut table = RecordTable::new();
        let stored = table_insert(&mut table, record("c1", t0())).unwrap();
        assert_eq!(stored.revision, 1);

        let claimed = table_compare_and_swap(&mut table, &stored, stored.claimed(t0()));
        let claimed = claimed.into_record().unwrap();
        assert_eq!(claimed.revision, 2);

        let stale = table_compare_and_swap(&mut table, &stored, stored.claimed(t0()));
        assert_eq!(stale, CasOutcome::Conflict);
    }

    #[test]
    fn test_duplicate_insert() {
        let mut table = RecordTable::new();
        let r = record("c1", t0());
        table_insert(&mut table, r.clone()).unwrap();
        assert!(matches!(table_insert(&mut table, r), Err(StoreError::Duplicate(_))));
    }
}
