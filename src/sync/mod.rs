//! Sync Module - Offline-First Field Data Synchronization
//!
//! Queues mutations made in the field and reconciles them with the backend:
//! - Offline store (SQLite or in-memory) with FIFO order and retry counters
//! - Remote gateway over REST, with 409 conflict detection
//! - Conflict resolution: client wins, server wins, or park for review
//! - Single-flight orchestrator fed by connectivity, timer and foreground triggers

pub mod models;
pub mod store;
pub mod memory;
pub mod gateway;
pub mod api;
pub mod conflict;
pub mod connectivity;
pub mod events;
pub mod orchestrator;
pub mod scheduler;


// Re-export commonly used types
pub use models::{
    Operation, Priority,
    OfflineRecord,
    ConflictType, ConflictStrategy, SyncConflict, ManualResolution,
    ConnectionType, NetworkState,
    SyncOptions, SyncResult, SyncStatus,
};

pub use store::{OfflineStore, SqliteOfflineStore, QueueStats, CleanupReport, StoreError, StoreResult};
pub use memory::MemoryOfflineStore;
pub use gateway::{RemoteGateway, GatewayError, GatewayResult, WriteMode, endpoint_for};
pub use api::HttpGateway;
pub use conflict::{ConflictResolver, ConflictOutcome, determine_conflict_type};
pub use connectivity::{ConnectivityMonitor, ConnectivityEvent, ReachabilityProbe};
pub use events::{EventBus, SyncEvent, Subscription};
pub use orchestrator::{SyncOrchestrator, OrchestratorConfig, SyncError};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
