//! In-memory offline store
//!
//! Same contract as `SqliteOfflineStore`, kept in a mutex-guarded vector.
//! Used for ephemeral queues and for driving the orchestrator in tests.

use super::models::{OfflineRecord, SyncConflict};
use super::store::{CleanupReport, OfflineStore, QueueStats, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    /// Insertion order is FIFO order
    records: Vec<StoredRecord>,
    conflicts: Vec<SyncConflict>,
}

struct StoredRecord {
    record: OfflineRecord,
    synced_at: Option<DateTime<Utc>>,
}

pub struct MemoryOfflineStore {
    inner: Mutex<Inner>,
    retention: Duration,
}

impl Default for MemoryOfflineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention: Duration::days(super::store::DEFAULT_RETENTION_DAYS),
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn record_mut(&mut self, id: &str) -> StoreResult<&mut StoredRecord> {
        self.records
            .iter_mut()
            .find(|stored| stored.record.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn enqueue(&self, record: OfflineRecord) -> StoreResult<String> {
        let id = record.id.clone();
        let synced_at = record.synced.then(Utc::now);
        self.lock().records.push(StoredRecord { record, synced_at });
        Ok(id)
    }

    async fn get_unsynced_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<OfflineRecord>> {
        let inner = self.lock();
        let start = after
            .and_then(|id| inner.records.iter().position(|stored| stored.record.id == id))
            .map_or(0, |index| index + 1);

        // Entities with a parked mutation seen so far
        let mut parked: HashSet<(String, String)> = HashSet::new();
        let mut page = Vec::new();

        for (index, stored) in inner.records.iter().enumerate() {
            if page.len() >= limit {
                break;
            }
            let record = &stored.record;
            if record.synced {
                continue;
            }

            let entity = record.entity_id().map(|id| (record.table.clone(), id));
            if record.awaiting_resolution {
                parked.extend(entity);
                continue;
            }
            if index < start || entity.is_some_and(|key| parked.contains(&key)) {
                continue;
            }
            page.push(record.clone());
        }

        Ok(page)
    }

    async fn get_record(&self, id: &str) -> StoreResult<Option<OfflineRecord>> {
        Ok(self
            .lock()
            .records
            .iter()
            .find(|stored| stored.record.id == id)
            .map(|stored| stored.record.clone()))
    }

    async fn mark_record_as_synced(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let stored = inner.record_mut(id)?;
        if !stored.record.synced {
            stored.record.synced = true;
            stored.record.awaiting_resolution = false;
            stored.record.last_error = None;
            stored.synced_at = Some(Utc::now());
        }

        let now = Utc::now();
        for conflict in inner
            .conflicts
            .iter_mut()
            .filter(|c| c.record_id == id && !c.resolved)
        {
            conflict.resolved = true;
            conflict.resolved_at = Some(now);
        }
        Ok(())
    }

    async fn increment_sync_attempts(&self, id: &str, error: Option<&str>) -> StoreResult<()> {
        let mut inner = self.lock();
        let stored = inner.record_mut(id)?;
        stored.record.sync_attempts = stored.record.sync_attempts.saturating_add(1);
        stored.record.last_attempt_at = Some(Utc::now());
        if let Some(error) = error {
            stored.record.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_record_conflicted(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let stored = inner.record_mut(id)?;
        if !stored.record.synced {
            stored.record.awaiting_resolution = true;
        }
        Ok(())
    }

    async fn store_conflict(&self, conflict: SyncConflict) -> StoreResult<()> {
        self.lock().conflicts.push(conflict);
        Ok(())
    }

    async fn get_conflicts(&self, only_unresolved: bool) -> StoreResult<Vec<SyncConflict>> {
        let mut conflicts: Vec<_> = self
            .lock()
            .conflicts
            .iter()
            .filter(|c| !only_unresolved || !c.resolved)
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.timestamp);
        Ok(conflicts)
    }

    async fn get_conflict(&self, id: &str) -> StoreResult<Option<SyncConflict>> {
        Ok(self.lock().conflicts.iter().find(|c| c.id == id).cloned())
    }

    async fn mark_conflict_resolved(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let conflict = inner
            .conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conflict.resolved = true;
        conflict.resolved_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn get_stats(&self, max_retries: u32) -> StoreResult<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats::default();

        for stored in &inner.records {
            let record = &stored.record;
            stats.total_count += 1;
            if record.synced {
                stats.synced_count += 1;
                continue;
            }
            if record.awaiting_resolution {
                stats.awaiting_resolution_count += 1;
            } else {
                stats.pending_count += 1;
            }
            if record.sync_attempts >= max_retries {
                stats.terminal_failed_count += 1;
            }
        }

        stats.unresolved_conflict_count =
            inner.conflicts.iter().filter(|c| !c.resolved).count() as u64;

        Ok(stats)
    }

    fn retention(&self) -> Duration {
        self.retention
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<CleanupReport> {
        let mut inner = self.lock();
        let mut report = CleanupReport::default();

        let before = inner.records.len();
        inner
            .records
            .retain(|stored| !matches!(stored.synced_at, Some(at) if stored.record.synced && at < cutoff));
        report.records_purged = before - inner.records.len();

        let expired: Vec<String> = inner
            .conflicts
            .iter()
            .filter(|c| !c.resolved && c.timestamp < cutoff)
            .map(|c| c.record_id.clone())
            .collect();
        let still_open: Vec<String> = inner
            .conflicts
            .iter()
            .filter(|c| !c.resolved && c.timestamp >= cutoff)
            .map(|c| c.record_id.clone())
            .collect();

        for stored in &mut inner.records {
            let record = &mut stored.record;
            if !record.synced
                && record.awaiting_resolution
                && expired.contains(&record.id)
                && !still_open.contains(&record.id)
            {
                record.awaiting_resolution = false;
                report.records_released += 1;
            }
        }

        let before = inner.conflicts.len();
        inner.conflicts.retain(|c| c.timestamp >= cutoff);
        report.conflicts_purged = before - inner.conflicts.len();

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{ConflictStrategy, ConflictType, Operation};
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_fifo_and_marking() {
        let store = MemoryOfflineStore::new();
        let first = store
            .enqueue(OfflineRecord::new("shifts", Operation::Create, json!({"n": 1})))
            .await
            .unwrap();
        let second = store
            .enqueue(OfflineRecord::new("shifts", Operation::Create, json!({"n": 2})))
            .await
            .unwrap();

        let pending = store.get_unsynced_records(10).await.unwrap();
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);

        store.mark_record_as_synced(&first).await.unwrap();
        store.mark_record_as_synced(&first).await.unwrap();
        let pending = store.get_unsynced_records(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);

        assert!(matches!(
            store.increment_sync_attempts("missing", None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_purge() {
        let store = MemoryOfflineStore::new();
        let id = store
            .enqueue(OfflineRecord::new("messages", Operation::Create, json!({})))
            .await
            .unwrap();
        store.mark_record_as_synced(&id).await.unwrap();

        let report = store
            .purge_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.records_purged, 1);
        assert!(store.get_record(&id).await.unwrap().is_none());
    }

    fn open_conflict(record: &OfflineRecord, timestamp: DateTime<Utc>) -> SyncConflict {
        SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            record_id: record.id.clone(),
            table: record.table.clone(),
            operation: record.operation,
            local_data: record.data.clone(),
            server_data: None,
            conflict_type: ConflictType::UpdateUpdate,
            strategy: ConflictStrategy::Manual,
            resolved: false,
            timestamp,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_parked_entity_and_expiry() {
        let store = MemoryOfflineStore::new();
        let first = OfflineRecord::new("reports", Operation::Update, json!({"id": 7, "v": 1}));
        let first_id = store.enqueue(first.clone()).await.unwrap();
        let second_id = store
            .enqueue(OfflineRecord::new("reports", Operation::Update, json!({"id": 7, "v": 2})))
            .await
            .unwrap();
        let unrelated = store
            .enqueue(OfflineRecord::new("reports", Operation::Create, json!({"title": "x"})))
            .await
            .unwrap();

        store
            .store_conflict(open_conflict(&first, Utc::now() - Duration::days(30)))
            .await
            .unwrap();
        store.mark_record_conflicted(&first_id).await.unwrap();

        let pending = store.get_unsynced_records(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, unrelated);

        let page = store.get_unsynced_after(Some(first_id.as_str()), 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, unrelated);

        let report = store.cleanup_expired_data().await.unwrap();
        assert_eq!(report.records_released, 1);
        assert_eq!(report.conflicts_purged, 1);

        let pending: Vec<_> = store
            .get_unsynced_records(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(pending, vec![first_id, second_id, unrelated]);
    }

    #[tokio::test]
    async fn test_memory_store_sync_closes_conflicts() {
        let store = MemoryOfflineStore::new();
        let record = OfflineRecord::new("reports", Operation::Update, json!({"id": "r-1"}));
        let id = store.enqueue(record.clone()).await.unwrap();
        store
            .store_conflict(open_conflict(&record, Utc::now()))
            .await
            .unwrap();

        store.mark_record_as_synced(&id).await.unwrap();

        assert!(store.get_conflicts(true).await.unwrap().is_empty());
        assert_eq!(store.get_stats(3).await.unwrap().unresolved_conflict_count, 0);
    }
}
