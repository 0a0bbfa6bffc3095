//! Conflict Resolver - classifies version conflicts and applies strategies
//!
//! SERVER_WINS drops the local mutation, CLIENT_WINS force-pushes it,
//! MERGE and MANUAL park the record until the application or an operator
//! calls back with a `ManualResolution`.

use super::gateway::{RemoteGateway, WriteMode};
use super::models::{
    ConflictStrategy, ConflictType, ManualResolution, OfflineRecord, Operation, SyncConflict,
};
use super::store::{OfflineStore, StoreError, StoreResult};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What happened to the originating record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Record marked synced (server state kept, or local state pushed)
    Synced,
    /// Left for MERGE/MANUAL handling
    Parked,
    /// CLIENT_WINS push failed; record stays eligible for retry
    PushFailed(String),
}

/// Whether the server still holds a live version of the entity
fn server_has_entity(server_data: Option<&Value>) -> bool {
    match server_data {
        None | Some(Value::Null) => false,
        Some(value) => !value
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Classify a conflict from the local operation and the server's view
pub fn determine_conflict_type(record: &OfflineRecord, server_data: Option<&Value>) -> ConflictType {
    let exists = server_has_entity(server_data);

    match record.operation {
        Operation::Delete if exists => ConflictType::DeleteUpdate,
        Operation::Update if !exists => ConflictType::UpdateDelete,
        _ => ConflictType::UpdateUpdate,
    }
}

#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn OfflineStore>,
    gateway: Arc<dyn RemoteGateway>,
    push_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<dyn OfflineStore>,
        gateway: Arc<dyn RemoteGateway>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            push_timeout,
        }
    }

    /// Record the conflict and apply `strategy`
    pub async fn resolve(
        &self,
        record: &OfflineRecord,
        server_data: Option<Value>,
        strategy: ConflictStrategy,
    ) -> StoreResult<ConflictOutcome> {
        let conflict_type = determine_conflict_type(record, server_data.as_ref());
        let now = Utc::now();
        let mut conflict = SyncConflict {
            id: Uuid::new_v4().to_string(),
            record_id: record.id.clone(),
            table: record.table.clone(),
            operation: record.operation,
            local_data: record.data.clone(),
            server_data,
            conflict_type,
            strategy,
            resolved: false,
            timestamp: now,
            resolved_at: None,
        };

        match strategy {
            ConflictStrategy::ServerWins => {
                conflict.resolved = true;
                conflict.resolved_at = Some(now);
                self.store.store_conflict(conflict).await?;
                self.store.mark_record_as_synced(&record.id).await?;
                log::info!(
                    "Conflict on {} record {} resolved in favour of server",
                    record.table,
                    record.id
                );
                Ok(ConflictOutcome::Synced)
            }
            ConflictStrategy::ClientWins => {
                self.store.store_conflict(conflict).await?;

                match self.force_push(record).await {
                    Ok(()) => {
                        // Also closes the conflict just stored
                        self.store.mark_record_as_synced(&record.id).await?;
                        log::info!(
                            "Conflict on {} record {} resolved by overwriting server",
                            record.table,
                            record.id
                        );
                        Ok(ConflictOutcome::Synced)
                    }
                    Err(message) => {
                        log::warn!("Force push of record {} failed: {}", record.id, message);
                        self.store
                            .increment_sync_attempts(&record.id, Some(&message))
                            .await?;
                        Ok(ConflictOutcome::PushFailed(message))
                    }
                }
            }
            ConflictStrategy::Merge | ConflictStrategy::Manual => {
                self.store.store_conflict(conflict).await?;
                self.store.mark_record_conflicted(&record.id).await?;
                log::info!(
                    "Conflict on {} record {} parked for {} resolution",
                    record.table,
                    record.id,
                    strategy.as_str()
                );
                Ok(ConflictOutcome::Parked)
            }
        }
    }

    /// Apply an operator decision to a parked conflict
    pub async fn apply_manual(
        &self,
        conflict: &SyncConflict,
        resolution: ManualResolution,
    ) -> StoreResult<ConflictOutcome> {
        let payload = match resolution {
            ManualResolution::KeepServer => None,
            ManualResolution::KeepLocal => Some(conflict.local_data.clone()),
            ManualResolution::Merged(merged) => Some(merged),
        };

        if let Some(data) = payload {
            let mut record = OfflineRecord::new(conflict.table.clone(), conflict.operation, data);
            record.id = conflict.record_id.clone();

            if let Err(message) = self.force_push(&record).await {
                log::warn!(
                    "Manual resolution push for conflict {} failed: {}",
                    conflict.id,
                    message
                );
                return Ok(ConflictOutcome::PushFailed(message));
            }
        }

        match self.store.mark_record_as_synced(&conflict.record_id).await {
            // Record may already be gone through retention
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.mark_conflict_resolved(&conflict.id).await?;

        log::info!("Conflict {} resolved manually", conflict.id);
        Ok(ConflictOutcome::Synced)
    }

    async fn force_push(&self, record: &OfflineRecord) -> Result<(), String> {
        match tokio::time::timeout(self.push_timeout, self.gateway.send(record, WriteMode::Force))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.is_conflict() => {
                Err("Server rejected forced overwrite with a version conflict".to_string())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "Request timed out after {}s",
                self.push_timeout.as_secs()
            )),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::gateway::{GatewayError, GatewayResult};
    use crate::sync::memory::MemoryOfflineStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers every call with the configured result and logs the mode used
    struct FixedGateway {
        fail: bool,
        calls: Mutex<Vec<WriteMode>>,
    }

    impl FixedGateway {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn answer(&self, mode: WriteMode) -> GatewayResult<Value> {
            self.calls.lock().unwrap().push(mode);
            if self.fail {
                Err(GatewayError::Status {
                    status: 502,
                    message: "bad gateway".to_string(),
                })
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    #[async_trait]
    impl RemoteGateway for FixedGateway {
        async fn create(&self, _: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
            self.answer(mode)
        }
        async fn update(&self, _: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
            self.answer(mode)
        }
        async fn delete(&self, _: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
            self.answer(mode)
        }
    }

    async fn setup(fail: bool) -> (Arc<MemoryOfflineStore>, Arc<FixedGateway>, ConflictResolver, OfflineRecord) {
        let store = Arc::new(MemoryOfflineStore::new());
        let gateway = FixedGateway::new(fail);
        let resolver = ConflictResolver::new(store.clone(), gateway.clone(), Duration::from_secs(5));
        let record = OfflineRecord::new("reports", Operation::Update, json!({"id": "r-1", "body": "local"}));
        store.enqueue(record.clone()).await.unwrap();
        (store, gateway, resolver, record)
    }

    #[test]
    fn test_determine_conflict_type() {
        let update = OfflineRecord::new("reports", Operation::Update, json!({"id": "1"}));
        let delete = OfflineRecord::new("reports", Operation::Delete, json!({"id": "1"}));
        let server = json!({"id": "1", "version": 3});

        assert_eq!(determine_conflict_type(&update, Some(&server)), ConflictType::UpdateUpdate);
        assert_eq!(determine_conflict_type(&update, None), ConflictType::UpdateDelete);
        assert_eq!(
            determine_conflict_type(&update, Some(&json!({"deleted": true}))),
            ConflictType::UpdateDelete
        );
        assert_eq!(determine_conflict_type(&delete, Some(&server)), ConflictType::DeleteUpdate);
        assert_eq!(determine_conflict_type(&delete, None), ConflictType::UpdateUpdate);
    }

    #[tokio::test]
    async fn test_server_wins_marks_synced() {
        let (store, gateway, resolver, record) = setup(false).await;

        let outcome = resolver
            .resolve(&record, Some(json!({"id": "r-1"})), ConflictStrategy::ServerWins)
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::Synced);
        assert!(store.get_record(&record.id).await.unwrap().unwrap().synced);
        assert!(gateway.calls.lock().unwrap().is_empty());

        let conflicts = store.get_conflicts(false).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].resolved);
    }

    #[tokio::test]
    async fn test_client_wins_force_pushes() {
        let (store, gateway, resolver, record) = setup(false).await;

        let outcome = resolver
            .resolve(&record, Some(json!({"id": "r-1"})), ConflictStrategy::ClientWins)
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::Synced);
        assert_eq!(*gateway.calls.lock().unwrap(), vec![WriteMode::Force]);
        assert!(store.get_record(&record.id).await.unwrap().unwrap().synced);
        assert!(store.get_conflicts(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_wins_failure_keeps_record_retryable() {
        let (store, _gateway, resolver, record) = setup(true).await;

        let outcome = resolver
            .resolve(&record, Some(json!({"id": "r-1"})), ConflictStrategy::ClientWins)
            .await
            .unwrap();

        assert!(matches!(outcome, ConflictOutcome::PushFailed(_)));
        let stored = store.get_record(&record.id).await.unwrap().unwrap();
        assert!(!stored.synced);
        assert!(!stored.awaiting_resolution);
        assert_eq!(store.get_unsynced_records(10).await.unwrap().len(), 1);
    }

    /// Rejects every write, forced or not, with a version conflict
    struct ConflictingGateway;

    #[async_trait]
    impl RemoteGateway for ConflictingGateway {
        async fn create(&self, _: &OfflineRecord, _: WriteMode) -> GatewayResult<Value> {
            Err(GatewayError::Conflict { server_data: None })
        }
        async fn update(&self, _: &OfflineRecord, _: WriteMode) -> GatewayResult<Value> {
            Err(GatewayError::Conflict { server_data: None })
        }
        async fn delete(&self, _: &OfflineRecord, _: WriteMode) -> GatewayResult<Value> {
            Err(GatewayError::Conflict { server_data: None })
        }
    }

    #[tokio::test]
    async fn test_forced_overwrite_rejected_by_conflict() {
        let store = Arc::new(MemoryOfflineStore::new());
        let resolver =
            ConflictResolver::new(store.clone(), Arc::new(ConflictingGateway), Duration::from_secs(5));
        let record = OfflineRecord::new("reports", Operation::Update, json!({"id": "r-1"}));
        store.enqueue(record.clone()).await.unwrap();

        let outcome = resolver
            .resolve(&record, Some(json!({"id": "r-1"})), ConflictStrategy::ClientWins)
            .await
            .unwrap();

        match outcome {
            ConflictOutcome::PushFailed(message) => {
                assert!(message.contains("forced overwrite"), "{message}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(store.get_record(&record.id).await.unwrap().unwrap().sync_attempts, 1);
        assert_eq!(store.get_conflicts(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_and_manual_park_record() {
        for strategy in [ConflictStrategy::Merge, ConflictStrategy::Manual] {
            let (store, gateway, resolver, record) = setup(false).await;

            let outcome = resolver.resolve(&record, None, strategy).await.unwrap();

            assert_eq!(outcome, ConflictOutcome::Parked);
            assert!(gateway.calls.lock().unwrap().is_empty());

            let stored = store.get_record(&record.id).await.unwrap().unwrap();
            assert!(!stored.synced);
            assert!(stored.awaiting_resolution);

            let conflicts = store.get_conflicts(true).await.unwrap();
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].conflict_type, ConflictType::UpdateDelete);
            assert_eq!(conflicts[0].strategy, strategy);
        }
    }

    #[tokio::test]
    async fn test_apply_manual_merged_payload() {
        let (store, gateway, resolver, record) = setup(false).await;
        resolver
            .resolve(&record, Some(json!({"id": "r-1"})), ConflictStrategy::Manual)
            .await
            .unwrap();
        let conflict = store.get_conflicts(true).await.unwrap().remove(0);

        let outcome = resolver
            .apply_manual(&conflict, ManualResolution::Merged(json!({"id": "r-1", "body": "merged"})))
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::Synced);
        assert_eq!(*gateway.calls.lock().unwrap(), vec![WriteMode::Force]);
        assert!(store.get_record(&record.id).await.unwrap().unwrap().synced);
        assert!(store.get_conflicts(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_manual_keep_server_skips_network() {
        let (store, gateway, resolver, record) = setup(true).await;
        resolver
            .resolve(&record, Some(json!({"id": "r-1"})), ConflictStrategy::Merge)
            .await
            .unwrap();
        let conflict = store.get_conflicts(true).await.unwrap().remove(0);

        let outcome = resolver
            .apply_manual(&conflict, ManualResolution::KeepServer)
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::Synced);
        assert!(gateway.calls.lock().unwrap().is_empty());
        assert!(store.get_record(&record.id).await.unwrap().unwrap().synced);
    }
}
