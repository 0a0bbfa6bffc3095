//! Sync Data Models
//!
//! Types shared by the offline store, the orchestrator and the conflict
//! resolver:
//! - Queued mutations (`OfflineRecord`) and their enums
//! - Conflict log entries (`SyncConflict`)
//! - Ephemeral network state
//! - Sync run options and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Offline Records
// ============================================================================

/// Mutation kind carried by a queued record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Priority tag set by the enqueuing caller (filter only, never a sort key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Included in priority-only (background) runs
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// A queued local mutation awaiting transmission to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineRecord {
    pub id: String,
    pub table: String,
    pub operation: Operation,
    pub data: Value,
    pub priority: Priority,
    pub sync_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub synced: bool,
    /// Parked behind an unresolved MERGE/MANUAL conflict
    #[serde(default)]
    pub awaiting_resolution: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OfflineRecord {
    /// Create a new pending record with a fresh identifier
    pub fn new(table: impl Into<String>, operation: Operation, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table: table.into(),
            operation,
            data,
            priority: Priority::default(),
            sync_attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            synced: false,
            awaiting_resolution: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Server-side identifier of the entity this mutation targets
    pub fn entity_id(&self) -> Option<String> {
        ["id", "server_id", "serverId"]
            .iter()
            .filter_map(|key| self.data.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Attempts exhausted; only `force_sync_record` can move it forward
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        !self.synced && self.sync_attempts >= max_retries
    }
}

// ============================================================================
// Conflicts
// ============================================================================

/// Shape of a detected disagreement between device and server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    UpdateUpdate,
    UpdateDelete,
    DeleteUpdate,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateUpdate => "update_update",
            Self::UpdateDelete => "update_delete",
            Self::DeleteUpdate => "delete_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "update_update" => Some(Self::UpdateUpdate),
            "update_delete" => Some(Self::UpdateDelete),
            "delete_update" => Some(Self::DeleteUpdate),
            _ => None,
        }
    }
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Force-push the local version over the server's
    ClientWins,

    /// Discard the local mutation in favour of server state
    ServerWins,

    /// Left for the application to merge out of band
    Merge,

    /// Left for human review
    Manual,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::ServerWins
    }
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_wins" => Some(Self::ClientWins),
            "server_wins" => Some(Self::ServerWins),
            "merge" => Some(Self::Merge),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Recorded version conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    /// Offline record that triggered the conflict
    pub record_id: String,
    pub table: String,
    pub operation: Operation,
    pub local_data: Value,
    /// Server's current version; `None` when the entity is gone
    pub server_data: Option<Value>,
    pub conflict_type: ConflictType,
    pub strategy: ConflictStrategy,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Operator decision for a parked MERGE/MANUAL conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    /// Accept the server state and drop the local mutation
    KeepServer,
    /// Overwrite the server with the local payload
    KeepLocal,
    /// Overwrite the server with a merged payload
    Merged(Value),
}

// ============================================================================
// Network State
// ============================================================================

/// Transport reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    None,
    Unknown,
    Wifi,
    Cellular,
    Ethernet,
}

/// Ephemeral reachability snapshot, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub connection_type: ConnectionType,
}

impl Default for NetworkState {
    /// No notification yet means offline
    fn default() -> Self {
        Self::offline()
    }
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            connection_type: ConnectionType::None,
        }
    }

    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            connection_type,
        }
    }

    /// Eligible for sync
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

// ============================================================================
// Sync Runs
// ============================================================================

/// Options for a single sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    /// Only HIGH/CRITICAL records
    pub priority_only: bool,
    /// Table allow-list
    pub tables: Option<Vec<String>>,
    pub conflict_resolution: ConflictStrategy,
    /// Skip records still inside their retry backoff window
    #[serde(default)]
    pub respect_backoff: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 3,
            priority_only: false,
            tables: None,
            conflict_resolution: ConflictStrategy::default(),
            respect_backoff: false,
        }
    }
}

impl SyncOptions {
    /// Lightweight pass used by the periodic background trigger
    pub fn background() -> Self {
        Self {
            priority_only: true,
            respect_backoff: true,
            ..Self::default()
        }
    }

    pub fn admits(&self, record: &OfflineRecord) -> bool {
        if self.priority_only && !record.priority.is_elevated() {
            return false;
        }

        match &self.tables {
            Some(tables) => tables.iter().any(|t| t == &record.table),
            None => true,
        }
    }
}

/// Aggregated outcome of a sync run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub synced_records: u32,
    pub failed_records: u32,
    pub conflicts: u32,
    /// Not attempted: inside the backoff window, or held behind an earlier
    /// mutation to the same entity
    pub deferred: u32,
    pub errors: Vec<String>,
}

impl SyncResult {
    /// A run that was refused before touching the queue
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![reason.into()],
            ..Self::default()
        }
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed_records += 1;
        self.errors.push(error.into());
    }
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub network: NetworkState,
    pub pending: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_options_default() {
        let options = SyncOptions::default();
        assert_eq!(options.batch_size, 20);
        assert_eq!(options.max_retries, 3);
        assert!(!options.priority_only);
        assert!(options.tables.is_none());
        assert_eq!(options.conflict_resolution, ConflictStrategy::ServerWins);
    }

    #[test]
    fn test_entity_id_lookup() {
        let record = OfflineRecord::new("reports", Operation::Update, json!({"id": "r-1"}));
        assert_eq!(record.entity_id().as_deref(), Some("r-1"));

        let record = OfflineRecord::new("shifts", Operation::Delete, json!({"server_id": 42}));
        assert_eq!(record.entity_id().as_deref(), Some("42"));

        let record = OfflineRecord::new("shifts", Operation::Delete, json!({"id": ""}));
        assert!(record.entity_id().is_none());
    }

    #[test]
    fn test_options_filtering() {
        let high = OfflineRecord::new("incidents", Operation::Create, json!({}))
            .with_priority(Priority::High);
        let low = OfflineRecord::new("locations", Operation::Create, json!({}))
            .with_priority(Priority::Low);

        let options = SyncOptions {
            priority_only: true,
            ..SyncOptions::default()
        };
        assert!(options.admits(&high));
        assert!(!options.admits(&low));

        let options = SyncOptions {
            tables: Some(vec!["locations".to_string()]),
            ..SyncOptions::default()
        };
        assert!(!options.admits(&high));
        assert!(options.admits(&low));
    }

    #[test]
    fn test_network_state_defaults_offline() {
        let state = NetworkState::default();
        assert!(!state.is_online());
        assert!(NetworkState::online(ConnectionType::Wifi).is_online());

        let captive = NetworkState {
            is_connected: true,
            is_internet_reachable: false,
            connection_type: ConnectionType::Wifi,
        };
        assert!(!captive.is_online());
    }

    #[test]
    fn test_enum_string_forms() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Priority::parse("critical"), Some(Priority::Critical));
        assert_eq!(ConflictType::parse("update_delete"), Some(ConflictType::UpdateDelete));
        assert_eq!(ConflictStrategy::parse("bogus"), None);
        assert_eq!(
            serde_json::to_value(ConflictStrategy::ClientWins).unwrap(),
            json!("CLIENT_WINS")
        );
    }
}
