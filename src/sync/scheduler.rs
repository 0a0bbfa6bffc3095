//! Background Sync Scheduler
//!
//! Owns the automatic sync triggers:
//! - Periodic priority-only pass while online and idle
//! - Full sync on every connectivity-restored edge
//! - Full sync on app foreground after the idle threshold
//!
//! All tasks are bound to `start`/`stop` through a cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::db::{Database, DbError};
use super::connectivity::ConnectivityEvent;
use super::models::{SyncOptions, SyncResult};
use super::orchestrator::{SyncError, SyncOrchestrator};

/// Settings key for the persisted scheduler configuration
pub const SCHEDULER_CONFIG_KEY: &str = "scheduler_config";

const MIN_MINUTES: u64 = 1;
const MAX_MINUTES: u64 = 1440;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Periodic background pass toggle
    pub enabled: bool,
    pub interval_minutes: u64,
    #[serde(default = "default_foreground_idle_minutes")]
    pub foreground_idle_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

fn default_foreground_idle_minutes() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            foreground_idle_minutes: default_foreground_idle_minutes(),
            last_run: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        validate_minutes("Interval", self.interval_minutes)?;
        validate_minutes("Foreground idle threshold", self.foreground_idle_minutes)
    }

    fn period(&self) -> Duration {
        Duration::from_secs(60 * self.interval_minutes)
    }

    fn idle_threshold(&self) -> Duration {
        Duration::from_secs(60 * self.foreground_idle_minutes)
    }
}

fn validate_minutes(label: &str, minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_MINUTES..=MAX_MINUTES).contains(&minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "{} must be {}-{} minutes, got {}",
            label, MIN_MINUTES, MAX_MINUTES, minutes
        )));
    }
    Ok(())
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Database,
    orchestrator: SyncOrchestrator,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    cancel: Arc<StdMutex<Option<CancellationToken>>>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Database, orchestrator: SyncOrchestrator) -> Self {
        Self {
            db,
            orchestrator,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(StdMutex::new(None)),
            tasks: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Seed the in-memory configuration (before `load_config`)
    #[must_use]
    pub fn with_config(self, config: SchedulerConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            ..self
        }
    }

    /// Load configuration from database settings table
    ///
    /// Keeps the current configuration when nothing has been saved yet.
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let stored: Option<SchedulerConfig> = self.db.get_setting(SCHEDULER_CONFIG_KEY)?;

        if let Some(config) = stored {
            *self.config.write().await = config;
        }
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db.set_setting(SCHEDULER_CONFIG_KEY, &config)?;
        Ok(())
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the connectivity listener and, when enabled, the periodic task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        config.validate()?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(2);

        // Subscribe before spawning so an edge right after start is not lost
        let connectivity = self.orchestrator.monitor().subscribe();
        handles.push(tokio::spawn(connectivity_loop(
            self.orchestrator.clone(),
            connectivity,
            cancel.clone(),
        )));

        if config.enabled {
            handles.push(tokio::spawn(periodic_loop(
                self.orchestrator.clone(),
                self.db.clone(),
                self.config.clone(),
                config.period(),
                cancel.clone(),
            )));
        }

        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel);
        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = handles;

        log::info!(
            "Background scheduler started (periodic: {}, interval: {} minutes)",
            config.enabled,
            config.interval_minutes
        );
        Ok(())
    }

    /// Stop all scheduler tasks; a sync already in flight finishes first
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(cancel) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Scheduler task ended abnormally: {}", e);
            }
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        foreground_idle_minutes: u64,
    ) -> Result<(), SchedulerError> {
        validate_minutes("Interval", interval_minutes)?;
        validate_minutes("Foreground idle threshold", foreground_idle_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
            config.foreground_idle_minutes = foreground_idle_minutes;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race with a concurrent stop)
            let _ = self.stop().await;
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes, foreground idle={} minutes",
            enabled,
            interval_minutes,
            foreground_idle_minutes
        );
        Ok(())
    }

    /// App became active; runs a full sync when idle long enough
    ///
    /// Returns `None` when the last run is recent enough to skip.
    pub async fn on_app_foreground(&self) -> Result<Option<SyncResult>, SyncError> {
        let threshold = self.config.read().await.idle_threshold();

        let idle = match self.orchestrator.since_last_sync() {
            Some(elapsed) => elapsed > threshold,
            None => true,
        };

        if !idle {
            log::debug!("App foregrounded, last sync is recent; skipping");
            return Ok(None);
        }

        log::info!("App foregrounded after idle period, triggering full sync");
        self.orchestrator
            .trigger_sync(SyncOptions::default())
            .await
            .map(Some)
    }
}

/// Periodic priority-only pass; first run one full period after start
async fn periodic_loop(
    orchestrator: SyncOrchestrator,
    db: Database,
    config: Arc<RwLock<SchedulerConfig>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    log::info!("Scheduler loop started (interval: {} seconds)", period.as_secs());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if !orchestrator.monitor().is_online() {
            log::debug!("Scheduled sync skipped: offline");
            continue;
        }
        if orchestrator.is_syncing() {
            log::debug!("Scheduled sync skipped: sync already running");
            continue;
        }

        log::info!("Background sync triggered by scheduler");

        match orchestrator.trigger_sync(SyncOptions::background()).await {
            Ok(result) => {
                log::info!(
                    "Background sync finished: synced={}, failed={}, conflicts={}, errors={}",
                    result.synced_records,
                    result.failed_records,
                    result.conflicts,
                    result.errors.len()
                );

                if !result.errors.is_empty() {
                    log::warn!("Background sync had {} errors: {:?}", result.errors.len(), result.errors);
                }

                let mut cfg = config.write().await;
                cfg.last_run = Some(Utc::now().to_rfc3339());
                if let Err(e) = db.set_setting(SCHEDULER_CONFIG_KEY, &*cfg) {
                    log::error!("Failed to save last_run timestamp: {}", e);
                }
            }
            Err(e) => {
                log::error!("Background sync failed: {}", e);
            }
        }
    }

    log::info!("Scheduler loop exited");
}

/// Full sync once per offline → online edge
async fn connectivity_loop(
    orchestrator: SyncOrchestrator,
    mut events: broadcast::Receiver<ConnectivityEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectivityEvent::Restored) => {
                log::info!("Connectivity restored, triggering full sync");
                if let Err(e) = orchestrator.trigger_sync(SyncOptions::default()).await {
                    log::error!("Sync after reconnect failed: {}", e);
                }
            }
            Ok(ConnectivityEvent::Lost) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Connectivity listener lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    log::debug!("Connectivity listener exited");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connectivity::ConnectivityMonitor;
    use crate::sync::gateway::{GatewayResult, RemoteGateway, WriteMode};
    use crate::sync::memory::MemoryOfflineStore;
    use crate::sync::models::{ConnectionType, NetworkState, OfflineRecord, Operation, Priority};
    use crate::sync::store::OfflineStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct CountingGateway {
        calls: StdMutex<Vec<String>>,
    }

    impl CountingGateway {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, record: &OfflineRecord) -> GatewayResult<Value> {
            self.calls.lock().unwrap().push(record.id.clone());
            Ok(Value::Null)
        }
    }

    #[async_trait]
    impl RemoteGateway for CountingGateway {
        async fn create(&self, record: &OfflineRecord, _: WriteMode) -> GatewayResult<Value> {
            self.record(record)
        }
        async fn update(&self, record: &OfflineRecord, _: WriteMode) -> GatewayResult<Value> {
            self.record(record)
        }
        async fn delete(&self, record: &OfflineRecord, _: WriteMode) -> GatewayResult<Value> {
            self.record(record)
        }
    }

    struct Setup {
        scheduler: BackgroundScheduler,
        store: Arc<MemoryOfflineStore>,
        gateway: Arc<CountingGateway>,
        monitor: Arc<ConnectivityMonitor>,
    }

    fn setup(initial: NetworkState) -> Setup {
        let db = Database::in_memory().unwrap();
        let store = Arc::new(MemoryOfflineStore::new());
        let gateway = Arc::new(CountingGateway::default());
        let monitor = Arc::new(ConnectivityMonitor::with_state(initial));
        let orchestrator = SyncOrchestrator::new(store.clone(), gateway.clone(), monitor.clone());

        Setup {
            scheduler: BackgroundScheduler::new(db, orchestrator),
            store,
            gateway,
            monitor,
        }
    }

    fn online() -> NetworkState {
        NetworkState::online(ConnectionType::Wifi)
    }

    fn record(priority: Priority) -> OfflineRecord {
        OfflineRecord::new("locations", Operation::Create, json!({"lat": 1.0})).with_priority(priority)
    }

    #[tokio::test]
    async fn test_config_default() {
        let setup = setup(online());

        let config = setup.scheduler.get_config().await;
        assert!(config.enabled);
        assert_eq!(config.interval_minutes, 5);
        assert_eq!(config.foreground_idle_minutes, 10);
        assert!(config.last_run.is_none());
        assert!(!setup.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_save_load_config() {
        let setup = setup(online());
        let scheduler = &setup.scheduler;

        let test_timestamp = "2026-01-01T12:00:00Z".to_string();
        {
            let mut config = scheduler.config.write().await;
            config.enabled = false;
            config.interval_minutes = 60;
            config.foreground_idle_minutes = 20;
            config.last_run = Some(test_timestamp.clone());
        }

        scheduler.save_config().await.unwrap();
        *scheduler.config.write().await = SchedulerConfig::default();
        scheduler.load_config().await.unwrap();

        let loaded = scheduler.get_config().await;
        assert!(!loaded.enabled);
        assert_eq!(loaded.interval_minutes, 60);
        assert_eq!(loaded.foreground_idle_minutes, 20);
        assert_eq!(loaded.last_run, Some(test_timestamp));
    }

    #[tokio::test]
    async fn test_persisted_config_overrides_seed() {
        let setup = setup(online());
        let seeded = setup.scheduler.clone().with_config(SchedulerConfig {
            interval_minutes: 15,
            ..SchedulerConfig::default()
        });

        // Nothing saved yet: seed survives
        seeded.load_config().await.unwrap();
        assert_eq!(seeded.get_config().await.interval_minutes, 15);

        seeded.update_config(true, 30, 10).await.unwrap();

        let restarted = seeded.clone().with_config(SchedulerConfig::default());
        restarted.load_config().await.unwrap();
        assert_eq!(restarted.get_config().await.interval_minutes, 30);
    }

    #[tokio::test]
    async fn test_invalid_interval() {
        let setup = setup(online());

        let result = setup.scheduler.update_config(true, 0, 10).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));

        let result = setup.scheduler.update_config(true, 2000, 10).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));

        let result = setup.scheduler.update_config(true, 5, 0).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let setup = setup(online());

        assert!(matches!(setup.scheduler.stop().await, Err(SchedulerError::NotRunning)));

        setup.scheduler.start().await.unwrap();
        assert!(setup.scheduler.is_running());
        assert!(matches!(setup.scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        setup.scheduler.stop().await.unwrap();
        assert!(!setup.scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_pass_is_priority_only() {
        let setup = setup(online());
        let critical = setup.store.enqueue(record(Priority::Critical)).await.unwrap();
        setup.store.enqueue(record(Priority::Low)).await.unwrap();

        setup.scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(setup.gateway.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(setup.gateway.calls(), vec![critical]);
        assert!(setup.scheduler.get_config().await.last_run.is_some());

        setup.scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_pass_skipped_while_offline() {
        let setup = setup(NetworkState::offline());
        setup.store.enqueue(record(Priority::High)).await.unwrap();

        setup.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(16 * 60)).await;

        assert!(setup.gateway.calls().is_empty());
        setup.scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_scheduler_has_no_periodic_pass() {
        let setup = setup(online());
        setup.scheduler.update_config(false, 5, 10).await.unwrap();
        setup.store.enqueue(record(Priority::Critical)).await.unwrap();

        setup.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;

        assert!(setup.gateway.calls().is_empty());
        setup.scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_full_sync_once_per_edge() {
        let setup = setup(NetworkState::offline());
        let low = setup.store.enqueue(record(Priority::Low)).await.unwrap();
        setup.scheduler.start().await.unwrap();

        setup.monitor.update(online());
        // Same online state on another transport is not a new edge
        setup.monitor.update(NetworkState::online(ConnectionType::Cellular));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(setup.gateway.calls(), vec![low.clone()]);

        let second = setup.store.enqueue(record(Priority::Low)).await.unwrap();
        setup.monitor.update(online());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(setup.gateway.calls().len(), 1);

        setup.monitor.update(NetworkState::offline());
        setup.monitor.update(online());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(setup.gateway.calls(), vec![low, second]);

        setup.scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_triggers() {
        let setup = setup(NetworkState::offline());
        setup.store.enqueue(record(Priority::Critical)).await.unwrap();

        setup.scheduler.start().await.unwrap();
        setup.scheduler.stop().await.unwrap();

        setup.monitor.update(online());
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;

        assert!(setup.gateway.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_respects_idle_threshold() {
        let setup = setup(online());
        setup.store.enqueue(record(Priority::Low)).await.unwrap();

        let first = setup.scheduler.on_app_foreground().await.unwrap();
        assert_eq!(first.map(|r| r.synced_records), Some(1));

        tokio::time::sleep(Duration::from_secs(9 * 60)).await;
        assert!(setup.scheduler.on_app_foreground().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        let again = setup.scheduler.on_app_foreground().await.unwrap();
        assert!(again.is_some_and(|r| r.success));
    }
}
