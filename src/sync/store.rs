//! Offline Record Store - durable queue of pending mutations and conflict log
//!
//! Purely local persistence; nothing in here performs network I/O. The
//! orchestrator talks to the `OfflineStore` trait so it can run against the
//! SQLite store in production and `MemoryOfflineStore` in tests.
//!
//! Features:
//! - FIFO retrieval of unsynced records (insertion order via `seq`)
//! - Later mutations to an entity held back while an earlier one is parked
//! - Atomic attempt counting and synced marking
//! - Exponential backoff helpers for background retries
//! - Retention sweep for synced records and stale conflicts

use super::models::{
    ConflictStrategy, ConflictType, OfflineRecord, Operation, Priority, SyncConflict,
};
use crate::db::{Database, DbError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30; // Initial retry delay: 30 seconds
const MAX_DELAY_SECS: i64 = 3600; // Max retry delay: 1 hour
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

// ============================================================================
// Data Types
// ============================================================================

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: u64,
    pub synced_count: u64,
    /// Unsynced with attempts at or above the retry ceiling
    pub terminal_failed_count: u64,
    pub awaiting_resolution_count: u64,
    pub unresolved_conflict_count: u64,
    pub total_count: u64,
}

/// What a retention sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub records_purged: usize,
    pub conflicts_purged: usize,
    /// Parked records whose conflicts all expired; back in the queue
    pub records_released: usize,
}

/// Delay before the next automatic retry after `attempts` failures
pub fn retry_delay(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let delay_secs = BASE_DELAY_SECS
        .saturating_mul(2_i64.pow(exponent))
        .min(MAX_DELAY_SECS);
    Duration::seconds(delay_secs)
}

/// Whether a previously failed record may be retried at `now`
pub fn backoff_elapsed(record: &OfflineRecord, now: DateTime<Utc>) -> bool {
    if record.sync_attempts == 0 {
        return true;
    }

    match record.last_attempt_at {
        Some(last) => now >= last + retry_delay(record.sync_attempts),
        None => true,
    }
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Append a new record; returns its id
    async fn enqueue(&self, record: OfflineRecord) -> StoreResult<String>;

    /// Up to `limit` sendable records in FIFO order, starting after record `after`
    ///
    /// Sendable means unsynced, not parked, and not queued behind a parked
    /// record for the same `(table, entity id)`.
    async fn get_unsynced_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<OfflineRecord>>;

    async fn get_unsynced_records(&self, limit: usize) -> StoreResult<Vec<OfflineRecord>> {
        self.get_unsynced_after(None, limit).await
    }

    async fn get_record(&self, id: &str) -> StoreResult<Option<OfflineRecord>>;

    /// Idempotent; also clears parking and closes the record's open conflicts
    async fn mark_record_as_synced(&self, id: &str) -> StoreResult<()>;

    /// Bump the attempt counter, stamp `last_attempt_at`, keep the error text
    async fn increment_sync_attempts(&self, id: &str, error: Option<&str>) -> StoreResult<()>;

    /// Park a record behind an unresolved conflict
    async fn mark_record_conflicted(&self, id: &str) -> StoreResult<()>;

    /// Append to the conflict log; the originating record is untouched
    async fn store_conflict(&self, conflict: SyncConflict) -> StoreResult<()>;

    async fn get_conflicts(&self, only_unresolved: bool) -> StoreResult<Vec<SyncConflict>>;

    async fn get_conflict(&self, id: &str) -> StoreResult<Option<SyncConflict>>;

    async fn mark_conflict_resolved(&self, id: &str) -> StoreResult<()>;

    async fn get_stats(&self, max_retries: u32) -> StoreResult<QueueStats>;

    /// Retention window applied by `cleanup_expired_data`
    fn retention(&self) -> Duration;

    /// Purge synced records and conflicts older than `cutoff`
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<CleanupReport>;

    async fn cleanup_expired_data(&self) -> StoreResult<CleanupReport> {
        self.purge_before(Utc::now() - self.retention()).await
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed offline store
#[derive(Clone)]
pub struct SqliteOfflineStore {
    db: Database,
    retention: Duration,
}

const RECORD_COLUMNS: &str = "id, table_name, operation, data, priority, sync_attempts, \
     created_at, last_attempt_at, synced, awaiting_resolution, last_error";

const CONFLICT_COLUMNS: &str = "id, record_id, table_name, operation, local_data, server_data, \
     conflict_type, strategy, resolved, timestamp, resolved_at";

/// Raw columns before JSON/enum decoding
struct RecordRow {
    id: String,
    table: String,
    operation: String,
    data: String,
    priority: String,
    sync_attempts: i64,
    created_at: String,
    last_attempt_at: Option<String>,
    synced: bool,
    awaiting_resolution: bool,
    last_error: Option<String>,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table: row.get(1)?,
            operation: row.get(2)?,
            data: row.get(3)?,
            priority: row.get(4)?,
            sync_attempts: row.get(5)?,
            created_at: row.get(6)?,
            last_attempt_at: row.get(7)?,
            synced: row.get(8)?,
            awaiting_resolution: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    fn decode(self) -> StoreResult<OfflineRecord> {
        Ok(OfflineRecord {
            operation: Operation::parse(&self.operation)
                .ok_or_else(|| StoreError::Corrupt(format!("operation '{}'", self.operation)))?,
            priority: Priority::parse(&self.priority)
                .ok_or_else(|| StoreError::Corrupt(format!("priority '{}'", self.priority)))?,
            data: serde_json::from_str(&self.data)?,
            sync_attempts: u32::try_from(self.sync_attempts).unwrap_or(u32::MAX),
            created_at: parse_timestamp(&self.created_at)?,
            last_attempt_at: self
                .last_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: self.id,
            table: self.table,
            synced: self.synced,
            awaiting_resolution: self.awaiting_resolution,
            last_error: self.last_error,
        })
    }
}

struct ConflictRow {
    id: String,
    record_id: String,
    table: String,
    operation: String,
    local_data: String,
    server_data: Option<String>,
    conflict_type: String,
    strategy: String,
    resolved: bool,
    timestamp: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            record_id: row.get(1)?,
            table: row.get(2)?,
            operation: row.get(3)?,
            local_data: row.get(4)?,
            server_data: row.get(5)?,
            conflict_type: row.get(6)?,
            strategy: row.get(7)?,
            resolved: row.get(8)?,
            timestamp: row.get(9)?,
            resolved_at: row.get(10)?,
        })
    }

    fn decode(self) -> StoreResult<SyncConflict> {
        Ok(SyncConflict {
            operation: Operation::parse(&self.operation)
                .ok_or_else(|| StoreError::Corrupt(format!("operation '{}'", self.operation)))?,
            local_data: serde_json::from_str(&self.local_data)?,
            server_data: self
                .server_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            conflict_type: ConflictType::parse(&self.conflict_type).ok_or_else(|| {
                StoreError::Corrupt(format!("conflict type '{}'", self.conflict_type))
            })?,
            strategy: ConflictStrategy::parse(&self.strategy)
                .ok_or_else(|| StoreError::Corrupt(format!("strategy '{}'", self.strategy)))?,
            timestamp: parse_timestamp(&self.timestamp)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            record_id: self.record_id,
            table: self.table,
            resolved: self.resolved,
        })
    }
}

impl SqliteOfflineStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn ensure_record_exists(&self, id: &str) -> StoreResult<()> {
        let exists: bool = self.db.query_row(
            "SELECT COUNT(*) > 0 FROM offline_records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;

        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl OfflineStore for SqliteOfflineStore {
    async fn enqueue(&self, record: OfflineRecord) -> StoreResult<String> {
        log::info!(
            "Queueing {} {} ({}, priority {})",
            record.operation.as_str(),
            record.table,
            record.id,
            record.priority.as_str()
        );

        let data = serde_json::to_string(&record.data)?;

        self.db.execute(
            r#"
            INSERT INTO offline_records (
                id, table_name, operation, data, entity_id, priority, sync_attempts,
                created_at, last_attempt_at, synced, synced_at,
                awaiting_resolution, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.id,
                record.table,
                record.operation.as_str(),
                data,
                record.entity_id(),
                record.priority.as_str(),
                record.sync_attempts,
                format_timestamp(record.created_at),
                record.last_attempt_at.map(format_timestamp),
                record.synced,
                record.synced.then(|| format_timestamp(Utc::now())),
                record.awaiting_resolution,
                record.last_error,
            ],
        )?;

        Ok(record.id)
    }

    async fn get_unsynced_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<OfflineRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self.db.query(
            &format!(
                r#"
                SELECT {RECORD_COLUMNS} FROM offline_records AS r
                WHERE r.synced = 0 AND r.awaiting_resolution = 0
                  AND r.seq > COALESCE((SELECT seq FROM offline_records WHERE id = ?1), 0)
                  AND NOT EXISTS (
                      SELECT 1 FROM offline_records AS p
                      WHERE p.synced = 0 AND p.awaiting_resolution = 1
                        AND p.table_name = r.table_name
                        AND p.entity_id = r.entity_id
                        AND p.seq < r.seq
                  )
                ORDER BY r.seq ASC LIMIT ?2
                "#
            ),
            params![after, limit],
            RecordRow::from_row,
        )?;

        rows.into_iter().map(RecordRow::decode).collect()
    }

    async fn get_record(&self, id: &str) -> StoreResult<Option<OfflineRecord>> {
        let conn = self.db.get_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM offline_records WHERE id = ?1"),
                params![id],
                RecordRow::from_row,
            )
            .optional()
            .map_err(DbError::from)?;

        row.map(RecordRow::decode).transpose()
    }

    async fn mark_record_as_synced(&self, id: &str) -> StoreResult<()> {
        let now = format_timestamp(Utc::now());

        let (updated, conflicts_closed) = self.db.transaction(|tx| {
            let updated = tx.execute(
                r#"
                UPDATE offline_records
                SET synced = 1, synced_at = ?1, awaiting_resolution = 0, last_error = NULL
                WHERE id = ?2 AND synced = 0
                "#,
                params![now, id],
            )?;

            let conflicts_closed = tx.execute(
                r#"
                UPDATE sync_conflicts
                SET resolved = 1, resolved_at = ?1
                WHERE record_id = ?2 AND resolved = 0
                "#,
                params![now, id],
            )?;

            Ok((updated, conflicts_closed))
        })?;

        if conflicts_closed > 0 {
            log::info!(
                "Closed {} open conflict(s) for synced record {}",
                conflicts_closed,
                id
            );
        }

        if updated == 0 {
            // Already synced is fine; unknown is not
            self.ensure_record_exists(id)?;
        }

        Ok(())
    }

    async fn increment_sync_attempts(&self, id: &str, error: Option<&str>) -> StoreResult<()> {
        let updated = self.db.execute(
            r#"
            UPDATE offline_records
            SET sync_attempts = sync_attempts + 1,
                last_attempt_at = ?1,
                last_error = COALESCE(?2, last_error)
            WHERE id = ?3
            "#,
            params![format_timestamp(Utc::now()), error, id],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn mark_record_conflicted(&self, id: &str) -> StoreResult<()> {
        let updated = self.db.execute(
            "UPDATE offline_records SET awaiting_resolution = 1 WHERE id = ?1 AND synced = 0",
            params![id],
        )?;

        if updated == 0 {
            self.ensure_record_exists(id)?;
        }

        Ok(())
    }

    async fn store_conflict(&self, conflict: SyncConflict) -> StoreResult<()> {
        log::warn!(
            "Recording {} conflict {} for {} record {} ({})",
            conflict.conflict_type.as_str(),
            conflict.id,
            conflict.table,
            conflict.record_id,
            conflict.strategy.as_str()
        );

        let local_data = serde_json::to_string(&conflict.local_data)?;
        let server_data = conflict
            .server_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.execute(
            r#"
            INSERT INTO sync_conflicts (
                id, record_id, table_name, operation, local_data, server_data,
                conflict_type, strategy, resolved, timestamp, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                conflict.id,
                conflict.record_id,
                conflict.table,
                conflict.operation.as_str(),
                local_data,
                server_data,
                conflict.conflict_type.as_str(),
                conflict.strategy.as_str(),
                conflict.resolved,
                format_timestamp(conflict.timestamp),
                conflict.resolved_at.map(format_timestamp),
            ],
        )?;

        Ok(())
    }

    async fn get_conflicts(&self, only_unresolved: bool) -> StoreResult<Vec<SyncConflict>> {
        let sql = if only_unresolved {
            format!(
                "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE resolved = 0 \
                 ORDER BY timestamp ASC"
            )
        } else {
            format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts ORDER BY timestamp ASC")
        };

        let rows = self.db.query(&sql, [], ConflictRow::from_row)?;
        rows.into_iter().map(ConflictRow::decode).collect()
    }

    async fn get_conflict(&self, id: &str) -> StoreResult<Option<SyncConflict>> {
        let conn = self.db.get_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"),
                params![id],
                ConflictRow::from_row,
            )
            .optional()
            .map_err(DbError::from)?;

        row.map(ConflictRow::decode).transpose()
    }

    async fn mark_conflict_resolved(&self, id: &str) -> StoreResult<()> {
        let updated = self.db.execute(
            r#"
            UPDATE sync_conflicts
            SET resolved = 1, resolved_at = COALESCE(resolved_at, ?1)
            WHERE id = ?2
            "#,
            params![format_timestamp(Utc::now()), id],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn get_stats(&self, max_retries: u32) -> StoreResult<QueueStats> {
        let stats = self.db.query_row(
            r#"
            SELECT
                SUM(CASE WHEN synced = 0 AND awaiting_resolution = 0 THEN 1 ELSE 0 END),
                SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN synced = 0 AND sync_attempts >= ?1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN synced = 0 AND awaiting_resolution = 1 THEN 1 ELSE 0 END),
                (SELECT COUNT(*) FROM sync_conflicts WHERE resolved = 0),
                COUNT(*)
            FROM offline_records
            "#,
            params![max_retries],
            |row| {
                let count = |idx: usize| -> rusqlite::Result<u64> {
                    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0).max(0) as u64)
                };
                Ok(QueueStats {
                    pending_count: count(0)?,
                    synced_count: count(1)?,
                    terminal_failed_count: count(2)?,
                    awaiting_resolution_count: count(3)?,
                    unresolved_conflict_count: count(4)?,
                    total_count: count(5)?,
                })
            },
        )?;

        Ok(stats)
    }

    fn retention(&self) -> Duration {
        self.retention
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<CleanupReport> {
        let cutoff = format_timestamp(cutoff);

        let report = self.db.transaction(|tx| {
            let records_purged = tx.execute(
                "DELETE FROM offline_records WHERE synced = 1 AND synced_at < ?1",
                params![cutoff],
            )?;

            let records_released = tx.execute(
                r#"
                UPDATE offline_records
                SET awaiting_resolution = 0
                WHERE synced = 0 AND awaiting_resolution = 1
                  AND id IN (
                      SELECT record_id FROM sync_conflicts
                      WHERE resolved = 0 AND timestamp < ?1
                  )
                  AND id NOT IN (
                      SELECT record_id FROM sync_conflicts
                      WHERE resolved = 0 AND timestamp >= ?1
                  )
                "#,
                params![cutoff],
            )?;

            let conflicts_purged = tx.execute(
                "DELETE FROM sync_conflicts WHERE timestamp < ?1",
                params![cutoff],
            )?;

            Ok(CleanupReport {
                records_purged,
                conflicts_purged,
                records_released,
            })
        })?;

        if report != CleanupReport::default() {
            log::info!(
                "Retention sweep: {} records purged, {} conflicts purged, {} parked records requeued",
                report.records_purged,
                report.conflicts_purged,
                report.records_released
            );
        }

        Ok(report)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Offline record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Tests
// ============================================================================
