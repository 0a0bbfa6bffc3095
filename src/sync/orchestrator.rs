//! Sync Orchestrator - coordinates offline queue reconciliation
//!
//! Coordinates between the offline store, the remote gateway and the
//! conflict resolver. Handles:
//! - Single-flight runs (concurrent triggers are rejected, never queued)
//! - Connectivity gating
//! - FIFO batching with strictly sequential network calls
//! - Retry ceiling, backoff and per-record deadlines
//! - Force sync and manual conflict resolution behind the same run lock

use super::conflict::{ConflictOutcome, ConflictResolver};
use super::connectivity::ConnectivityMonitor;
use super::events::{EventBus, Subscription, SyncEvent};
use super::gateway::{GatewayError, RemoteGateway, WriteMode};
use super::models::{
    ConflictStrategy, ManualResolution, OfflineRecord, SyncConflict, SyncOptions, SyncResult,
    SyncStatus,
};
use super::store::{backoff_elapsed, OfflineStore, QueueStats, StoreError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator tuning that is not per-run
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for a single gateway call
    pub record_timeout: Duration,
    /// Retry ceiling used for queue statistics
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            record_timeout: DEFAULT_RECORD_TIMEOUT,
            max_retries: SyncOptions::default().max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastSync {
    at: DateTime<Utc>,
    instant: Instant,
}

/// Outcome of one gateway call
enum Delivery {
    Delivered,
    Conflict(Option<Value>),
    Failed(String),
}

/// Clears the syncing flag however the run ends
struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag.clone())
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sync orchestrator - main coordinator
#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<dyn OfflineStore>,
    gateway: Arc<dyn RemoteGateway>,
    monitor: Arc<ConnectivityMonitor>,
    resolver: ConflictResolver,
    events: EventBus,
    run_lock: Arc<Mutex<()>>,
    syncing: Arc<AtomicBool>,
    last_sync: Arc<StdMutex<Option<LastSync>>>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn OfflineStore>,
        gateway: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self::with_config(store, gateway, monitor, OrchestratorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OfflineStore>,
        gateway: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
        config: OrchestratorConfig,
    ) -> Self {
        let resolver = ConflictResolver::new(store.clone(), gateway.clone(), config.record_timeout);

        Self {
            store,
            gateway,
            monitor,
            resolver,
            events: EventBus::default(),
            run_lock: Arc::new(Mutex::new(())),
            syncing: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(StdMutex::new(None)),
            config,
        }
    }

    // ========================================================================
    // Accessors & Observers
    // ========================================================================

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn OfflineStore> {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Start time of the most recent run
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_guard().map(|last| last.at)
    }

    /// Monotonic time since the most recent run started
    pub fn since_last_sync(&self) -> Option<Duration> {
        self.last_sync_guard().map(|last| last.instant.elapsed())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Register a callback for sync events; drop or unsubscribe to stop
    pub fn on_sync_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        self.events.on_sync_event(callback)
    }

    fn last_sync_guard(&self) -> Option<LastSync> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_sync_started(&self) {
        let now = LastSync {
            at: Utc::now(),
            instant: Instant::now(),
        };
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    // ========================================================================
    // Queue Access
    // ========================================================================

    /// Queue a local mutation for the next run
    pub async fn enqueue(&self, record: OfflineRecord) -> Result<String, SyncError> {
        Ok(self.store.enqueue(record).await?)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, SyncError> {
        Ok(self.store.get_stats(self.config.max_retries).await?)
    }

    pub async fn get_conflicts(&self, only_unresolved: bool) -> Result<Vec<SyncConflict>, SyncError> {
        Ok(self.store.get_conflicts(only_unresolved).await?)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let stats = self.get_queue_stats().await?;
        Ok(SyncStatus {
            is_syncing: self.is_syncing(),
            last_sync_time: self.last_sync_time(),
            network: self.monitor.current(),
            pending: stats.pending_count,
        })
    }

    // ========================================================================
    // Sync Operations
    // ========================================================================

    /// Run one sync pass over the unsynced queue
    ///
    /// Guard rejections come back as `Ok` with `success == false`; only a
    /// failing store aborts the run with `Err`.
    pub async fn trigger_sync(&self, options: SyncOptions) -> Result<SyncResult, SyncError> {
        let Ok(guard) = self.run_lock.clone().try_lock_owned() else {
            log::info!("Sync requested while another run is active, skipping");
            return Ok(SyncResult::rejected(SyncError::AlreadyInProgress.to_string()));
        };

        if !self.monitor.is_online() {
            log::info!("Sync requested while offline, skipping");
            return Ok(SyncResult::rejected(SyncError::NoConnectivity.to_string()));
        }

        let running = RunningFlag::raise(&self.syncing);
        self.mark_sync_started();
        self.events.emit(SyncEvent::Started(options.clone()));

        log::info!(
            "Starting sync (batch size {}, max retries {}, priority only {}, strategy {})",
            options.batch_size,
            options.max_retries,
            options.priority_only,
            options.conflict_resolution.as_str()
        );

        let outcome = self.run_batches(&options).await;

        drop(running);
        drop(guard);

        match outcome {
            Ok(result) => {
                log::info!(
                    "Sync completed: synced={}, failed={}, conflicts={}, deferred={}",
                    result.synced_records,
                    result.failed_records,
                    result.conflicts,
                    result.deferred
                );
                self.events.emit(SyncEvent::Completed(result.clone()));
                Ok(result)
            }
            Err((error, partial)) => {
                log::error!("Sync aborted: {}", error);
                let mut result = partial;
                result.success = false;
                result.errors.push(error.to_string());
                self.events.emit(SyncEvent::Failed {
                    error: error.to_string(),
                    result,
                });
                Err(error)
            }
        }
    }

    /// Page through the queue in FIFO order until the cursor runs out
    ///
    /// Once a mutation for an entity is left behind in this run, later
    /// mutations for the same entity are held back too.
    async fn run_batches(
        &self,
        options: &SyncOptions,
    ) -> Result<SyncResult, (SyncError, SyncResult)> {
        let mut result = SyncResult::default();
        let batch_size = options.batch_size.max(1);
        let page_size = batch_size.saturating_mul(2);
        let mut cursor: Option<String> = None;
        let mut held: HashSet<(String, String)> = HashSet::new();
        let started_at = Utc::now();

        loop {
            let page = match self
                .store
                .get_unsynced_after(cursor.as_deref(), page_size)
                .await
            {
                Ok(records) => records,
                Err(e) => return Err((e.into(), result)),
            };

            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id.clone());

            let mut eligible = Vec::with_capacity(page.len());
            for record in page {
                let entity = record.entity_id().map(|id| (record.table.clone(), id));
                if entity.as_ref().is_some_and(|key| held.contains(key)) {
                    log::debug!("Holding record {} behind an earlier mutation", record.id);
                    result.deferred += 1;
                } else if options.admits(&record) {
                    eligible.push((record, entity));
                } else {
                    held.extend(entity);
                }
            }

            for (index, batch) in eligible.chunks(batch_size).enumerate() {
                log::debug!("Processing batch {} ({} records)", index + 1, batch.len());

                for (record, entity) in batch {
                    if entity.as_ref().is_some_and(|key| held.contains(key)) {
                        result.deferred += 1;
                        continue;
                    }

                    let delivered = if record.is_terminal(options.max_retries) {
                        result.record_failure(
                            SyncError::MaxRetriesExceeded(record.id.clone()).to_string(),
                        );
                        false
                    } else if options.respect_backoff && !backoff_elapsed(record, started_at) {
                        result.deferred += 1;
                        false
                    } else {
                        match self
                            .process_record(record, options.conflict_resolution, &mut result)
                            .await
                        {
                            Ok(delivered) => delivered,
                            Err(e) => return Err((e.into(), result)),
                        }
                    };

                    if !delivered {
                        held.extend(entity.clone());
                    }
                }
            }
        }

        if let Err(e) = self.store.cleanup_expired_data().await {
            return Err((e.into(), result));
        }

        result.success = result.errors.is_empty();
        Ok(result)
    }

    /// Send one record and fold the outcome into `result`
    ///
    /// Returns whether the record left the queue.
    async fn process_record(
        &self,
        record: &OfflineRecord,
        strategy: ConflictStrategy,
        result: &mut SyncResult,
    ) -> Result<bool, StoreError> {
        match self.deliver(record).await {
            Delivery::Delivered => {
                self.store.mark_record_as_synced(&record.id).await?;
                result.synced_records += 1;
                Ok(true)
            }
            Delivery::Conflict(server_data) => {
                result.conflicts += 1;
                match self.resolver.resolve(record, server_data, strategy).await? {
                    ConflictOutcome::Synced => Ok(true),
                    ConflictOutcome::Parked => Ok(false),
                    ConflictOutcome::PushFailed(message) => {
                        result
                            .errors
                            .push(format!("Record {}: {}", record.id, message));
                        Ok(false)
                    }
                }
            }
            Delivery::Failed(message) => {
                log::warn!(
                    "Sync of {} record {} failed (attempt {}): {}",
                    record.table,
                    record.id,
                    record.sync_attempts + 1,
                    message
                );
                self.store
                    .increment_sync_attempts(&record.id, Some(&message))
                    .await?;
                result.record_failure(format!("Record {}: {}", record.id, message));
                Ok(false)
            }
        }
    }

    async fn deliver(&self, record: &OfflineRecord) -> Delivery {
        let call = self.gateway.send(record, WriteMode::Checked);

        match tokio::time::timeout(self.config.record_timeout, call).await {
            Ok(Ok(_)) => Delivery::Delivered,
            Ok(Err(GatewayError::Conflict { server_data })) => Delivery::Conflict(server_data),
            Ok(Err(e)) => Delivery::Failed(e.to_string()),
            Err(_) => Delivery::Failed(format!(
                "Request timed out after {}s",
                self.config.record_timeout.as_secs()
            )),
        }
    }

    /// Sync one record regardless of its attempt count, CLIENT_WINS on conflict
    ///
    /// Waits for a running batch sync to finish rather than racing it.
    pub async fn force_sync_record(&self, id: &str) -> Result<SyncResult, SyncError> {
        let _guard = self.run_lock.clone().lock_owned().await;

        if !self.monitor.is_online() {
            return Ok(SyncResult::rejected(SyncError::NoConnectivity.to_string()));
        }

        let record = self
            .store
            .get_record(id)
            .await?
            .ok_or_else(|| SyncError::RecordNotFound(id.to_string()))?;

        let mut result = SyncResult::default();
        if record.synced {
            result.success = true;
            return Ok(result);
        }

        log::info!(
            "Force syncing {} record {} (attempts so far: {})",
            record.table,
            record.id,
            record.sync_attempts
        );

        let _running = RunningFlag::raise(&self.syncing);
        self.process_record(&record, ConflictStrategy::ClientWins, &mut result)
            .await?;

        result.success = result.errors.is_empty();
        Ok(result)
    }

    /// Settle a parked MERGE/MANUAL conflict
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ManualResolution,
    ) -> Result<ConflictOutcome, SyncError> {
        let _guard = self.run_lock.clone().lock_owned().await;

        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

        if conflict.resolved {
            return Ok(ConflictOutcome::Synced);
        }

        if resolution != ManualResolution::KeepServer && !self.monitor.is_online() {
            return Err(SyncError::NoConnectivity);
        }

        Ok(self.resolver.apply_manual(&conflict, resolution).await?)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sync already in progress")]
    AlreadyInProgress,

    #[error("No internet connection")]
    NoConnectivity,

    #[error("Max retries exceeded for record {0}")]
    MaxRetriesExceeded(String),

    #[error("Offline record not found: {0}")]
    RecordNotFound(String),

    #[error("Sync conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

// ============================================================================
// Tests
// ============================================================================
