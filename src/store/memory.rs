//! In-process record store.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{
    table_compare_and_swap, table_due, table_insert, table_scan, CasOutcome, ExecutionStore,
    RecordQuery, RecordTable,
};
use crate::error::{StoreError, StoreResult};
use crate::store::record::{ExecutionId, ExecutionRecord};

/// Mutex-guarded table. Conditional writes are atomic with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<RecordTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, RecordTable>> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ExecutionStore for MemoryStore {
    fn insert(&self, record: ExecutionRecord) -> StoreResult<ExecutionRecord> {
        table_insert(&mut *self.lock()?, record)
    }

    fn get(&self, id: ExecutionId) -> StoreResult<Option<ExecutionRecord>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<ExecutionRecord>> {
        Ok(table_due(&*self.lock()?, now, limit))
    }

    fn scan(&self, query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>> {
        Ok(table_scan(&*self.lock()?, query))
    }

    fn compare_and_swap(
        &self,
        observed: &ExecutionRecord,
        next: ExecutionRecord,
    ) -> StoreResult<CasOutcome> {
        Ok(table_compare_and_swap(&mut *self.lock()?, observed, next))
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionStatus, RecordQuery};
    use crate::testing::t0;
    use chrono::Duration;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn record() -> ExecutionRecord {
        ExecutionRecord::enroll("welcome", 1, "c1", "c1@example.com", "start", t0())
    }

    #[test]
    fn test_insert_and_get() {
        let store = MemoryStore::new();
        let stored = store.insert(record()).unwrap();
        assert_eq!(store.get(stored.id).unwrap(), Some(stored));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_due_and_scan() {
        let store = MemoryStore::new();
        let due = store.insert(record()).unwrap();
        let later = record().pending_at("start", t0() + Duration::hours(1), t0());
        store.insert(later).unwrap();

        let ready = store.due(t0(), 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due.id);

        let query = RecordQuery::new().with_status(ExecutionStatus::Pending);
        assert_eq!(store.scan(&query).unwrap().len(), 2);
        assert_eq!(store.scan(&query.limit(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_cas_rejects_status_change() {
        let store = MemoryStore::new();
        let stored = store.insert(record()).unwrap();

        let cancelled = store
            .compare_and_swap(&stored, stored.cancelled(t0()))
            .unwrap()
            .into_record()
            .unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        let outcome = store.compare_and_swap(&stored, stored.claimed(t0())).unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
        assert_eq!(store.get(stored.id).unwrap().unwrap().status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let stored = store.insert(record()).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let observed = stored.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .compare_and_swap(&observed, observed.claimed(t0()))
                        .unwrap()
                        .is_applied()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
