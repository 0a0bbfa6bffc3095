// Patrol Sync - offline-first sync engine for field devices

pub mod config;
pub mod db;
pub mod sync;

use config::{AppConfig, ConfigError};
use db::{Database, DbError};
use std::sync::Arc;
use sync::{
    BackgroundScheduler, ConnectivityMonitor, GatewayError, HttpGateway, ReachabilityProbe,
    SchedulerError, SqliteOfflineStore, SyncOrchestrator,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Service Wiring
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Reachability probe error: {0}")]
    Probe(#[from] reqwest::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running sync engine and the handles needed to tear it down
pub struct SyncService {
    pub db: Database,
    pub gateway: Arc<HttpGateway>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub orchestrator: SyncOrchestrator,
    pub scheduler: BackgroundScheduler,
    probe_cancel: CancellationToken,
    probe_task: JoinHandle<()>,
}

impl SyncService {
    /// Open the database, wire the components and start the triggers
    pub async fn start(config: &AppConfig) -> Result<Self, ServiceError> {
        let db_path = config.resolve_db_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        log::info!("Database path: {:?}", db_path);

        let db = Database::new(db_path)?;
        log::info!("Database initialized successfully");

        let store = Arc::new(
            SqliteOfflineStore::new(db.clone())
                .with_retention(chrono::Duration::days(config.retention_days)),
        );

        let gateway = Arc::new(HttpGateway::new(&config.api_url, config.record_timeout)?);
        if let Some(token) = &config.api_token {
            gateway.set_token(token.clone()).await;
        }

        let monitor = Arc::new(ConnectivityMonitor::new());
        let orchestrator = SyncOrchestrator::with_config(
            store,
            gateway.clone(),
            monitor.clone(),
            config.orchestrator_config(),
        );

        let probe_cancel = CancellationToken::new();
        let probe = ReachabilityProbe::new(
            gateway.base_url().clone(),
            config.probe_interval,
            config.record_timeout,
        )?;
        let probe_task = probe.spawn(monitor.clone(), probe_cancel.clone());

        let scheduler = BackgroundScheduler::new(db.clone(), orchestrator.clone())
            .with_config(config.scheduler_config());
        scheduler.load_config().await?;
        scheduler.start().await?;

        Ok(Self {
            db,
            gateway,
            monitor,
            orchestrator,
            scheduler,
            probe_cancel,
            probe_task,
        })
    }

    /// Stop the triggers; a sync in flight completes first
    pub async fn shutdown(self) {
        self.probe_cancel.cancel();
        if let Err(e) = self.scheduler.stop().await {
            log::warn!("Failed to stop scheduler: {}", e);
        }
        if let Err(e) = self.probe_task.await {
            log::warn!("Reachability probe ended abnormally: {}", e);
        }
        log::info!("Sync service stopped");
    }
}

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    // Load .env file for API settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let outcome: Result<(), ServiceError> = runtime.block_on(async {
        let service = SyncService::start(&config).await?;
        log::info!("Sync service running against {}", service.gateway.base_url());

        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }

        log::info!("Shutdown requested");
        service.shutdown().await;
        Ok(())
    });

    if let Err(e) = outcome {
        log::error!("Sync service error: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
