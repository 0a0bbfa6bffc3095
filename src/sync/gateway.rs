//! Remote Gateway - maps `(table, operation)` onto the REST wire contract
//!
//! `POST {base}` for creates, `PUT {base}/{id}` for updates and
//! `DELETE {base}/{id}` for deletes. Failures are surfaced unchanged; only a
//! 409 is turned into `GatewayError::Conflict` so the orchestrator can route
//! it to the conflict resolver.

use super::models::{OfflineRecord, Operation};
use async_trait::async_trait;
use serde_json::Value;

/// Query parameter that tells the server to skip its version check
pub const FORCE_QUERY_PARAM: &str = "force";

/// Whether the server may apply its optimistic-concurrency check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Checked,
    /// Overwrite regardless of version (CLIENT_WINS)
    Force,
}

/// HTTP verb for a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::Post,
            Operation::Update => Self::Put,
            Operation::Delete => Self::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Endpoint base (relative to the API root) for a logical table
pub fn endpoint_for(table: &str) -> String {
    match table {
        "reports" => "reports".to_string(),
        "shifts" => "shifts".to_string(),
        "locations" => "locations/track".to_string(),
        "incidents" => "incidents".to_string(),
        "attachments" => "attachments".to_string(),
        "messages" => "messages".to_string(),
        // Unmapped tables go through the generic sync collection
        other => format!("sync/{}", other.trim_matches('/').replace('_', "-")),
    }
}

/// Relative request path for a record (entity id URL-encoded)
pub fn request_path(record: &OfflineRecord) -> GatewayResult<String> {
    let base = endpoint_for(&record.table);
    match record.operation {
        Operation::Create => Ok(base),
        Operation::Update | Operation::Delete => {
            let entity_id = record
                .entity_id()
                .ok_or_else(|| GatewayError::MissingEntityId {
                    table: record.table.clone(),
                    operation: record.operation,
                })?;
            Ok(format!("{}/{}", base, urlencoding::encode(&entity_id)))
        }
    }
}

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn create(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value>;

    async fn update(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value>;

    async fn delete(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value>;

    /// Dispatch on the record's operation
    async fn send(&self, record: &OfflineRecord, mode: WriteMode) -> GatewayResult<Value> {
        match record.operation {
            Operation::Create => self.create(record, mode).await,
            Operation::Update => self.update(record, mode).await,
            Operation::Delete => self.delete(record, mode).await,
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP 409; carries the server's current entity when it still exists
    #[error("Version conflict")]
    Conflict { server_data: Option<Value> },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{operation:?} on {table} requires an entity id in its payload")]
    MissingEntityId { table: String, operation: Operation },

    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid response from server")]
    InvalidResponse,
}

impl GatewayError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// Tests
// ============================================================================
