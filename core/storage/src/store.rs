//! Durable local store trait and the records it persists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plotsync_common::{EntityTable, MutationOp, Record, RecordId, Result, SyncStatus};

/// Snapshot of one remote entity as last known, keyed by `(table, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache table name (e.g. `inspections_cache`).
    pub table: String,
    /// Record id within the table.
    pub id: RecordId,
    /// Entity payload.
    pub record: Record,
    /// Whether the snapshot awaits a queued write.
    pub sync_status: SyncStatus,
    /// Last time this entry was written.
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create a synced entry from a backend record.
    pub fn synced(table: impl Into<String>, id: RecordId, record: Record) -> Self {
        Self {
            table: table.into(),
            id,
            record,
            sync_status: SyncStatus::Synced,
            updated_at: Utc::now(),
        }
    }

    /// Create a pending entry for a local write.
    pub fn pending(table: impl Into<String>, id: RecordId, record: Record) -> Self {
        Self {
            table: table.into(),
            id,
            record,
            sync_status: SyncStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    /// Whether two entries hold the same snapshot, ignoring write time.
    pub fn same_snapshot(&self, other: &CacheEntry) -> bool {
        self.record == other.record && self.sync_status == other.sync_status
    }
}

/// How an upsert treats existing entries that still carry a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Overwrite unconditionally.
    Replace,
    /// Leave `pending` entries untouched.
    KeepPending,
}

/// Lifecycle status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Waiting to be replayed.
    Pending,
    /// Currently being sent to the backend.
    Applying,
    /// Terminally rejected; needs user attention.
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Applying => "applying",
            MutationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "applying" => Ok(MutationStatus::Applying),
            "failed" => Ok(MutationStatus::Failed),
            other => Err(plotsync_common::Error::Serialization(format!(
                "Unknown mutation status: {}",
                other
            ))),
        }
    }
}

/// A write to be appended to the mutation queue.
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub table: EntityTable,
    pub op: MutationOp,
    /// Cache key the write refers to (placeholder id for offline inserts).
    pub record_id: Option<RecordId>,
    /// Full record for INSERT/UPDATE, identifying key for DELETE.
    pub payload: Record,
}

/// A durable record of one write intended for the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Monotonically increasing insertion order; defines replay order.
    pub seq: u64,
    pub table: EntityTable,
    pub op: MutationOp,
    pub record_id: Option<RecordId>,
    pub payload: Record,
    pub created_at: DateTime<Utc>,
    pub status: MutationStatus,
    /// Number of transient failures seen so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl MutationEntry {
    /// Mark as being applied.
    pub fn mark_applying(&mut self) {
        self.status = MutationStatus::Applying;
    }

    /// Record a transient failure; returns to `pending` for the next drain,
    /// unless the attempt budget is exhausted.
    pub fn record_transient_failure(&mut self, error: impl Into<String>, max_attempts: u32) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.status = if self.attempts >= max_attempts {
            MutationStatus::Failed
        } else {
            MutationStatus::Pending
        };
    }

    /// Mark as terminally failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.status = MutationStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Reset a failed entry so the next drain replays it.
    pub fn reset(&mut self) {
        self.status = MutationStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
    }

    /// Whether the next drain should replay this entry.
    pub fn is_replayable(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

/// Durable local storage backing both the cache and the mutation queue.
///
/// Implementations must make every single call atomic: an upsert batch is
/// either fully written or not at all, and a call that has started runs to
/// completion even if the awaiting future is dropped.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert or replace cache entries, keyed by `(table, id)`.
    ///
    /// An existing entry holding the same snapshot is left as is, so
    /// applying the same batch twice yields the same state.
    async fn upsert_entries(&self, entries: Vec<CacheEntry>, mode: UpsertMode) -> Result<()>;

    /// All entries of a cache table, ordered by id. Unknown tables are empty.
    async fn list_entries(&self, table: &str) -> Result<Vec<CacheEntry>>;

    /// A single cache entry.
    async fn get_entry(&self, table: &str, id: &RecordId) -> Result<Option<CacheEntry>>;

    /// Delete a cache entry. Returns whether it existed.
    async fn delete_entry(&self, table: &str, id: &RecordId) -> Result<bool>;

    /// Names of all cache tables holding at least one entry.
    async fn cache_tables(&self) -> Result<Vec<String>>;

    /// Append a mutation with the next sequence number.
    async fn append_mutation(&self, mutation: NewMutation) -> Result<MutationEntry>;

    /// All queued mutations in ascending sequence order.
    async fn list_mutations(&self) -> Result<Vec<MutationEntry>>;

    /// A single queued mutation.
    async fn get_mutation(&self, seq: u64) -> Result<Option<MutationEntry>>;

    /// Persist the mutable fields of an existing mutation
    /// (status, attempts, last error, record id, payload).
    ///
    /// # Errors
    /// - Mutation not found
    async fn update_mutation(&self, entry: &MutationEntry) -> Result<()>;

    /// Delete a mutation. Returns whether it existed.
    async fn remove_mutation(&self, seq: u64) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> MutationEntry {
        MutationEntry {
            seq: 1,
            table: EntityTable::new("tasks").unwrap(),
            op: MutationOp::Update,
            record_id: Some(RecordId::new("t1")),
            payload: Record::from_value(json!({"status": "done"})).unwrap(),
            created_at: Utc::now(),
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_transient_failure_stays_pending_until_budget() {
        let mut entry = entry();
        entry.record_transient_failure("503", 3);
        assert_eq!(entry.status, MutationStatus::Pending);
        entry.record_transient_failure("503", 3);
        assert_eq!(entry.status, MutationStatus::Pending);
        entry.record_transient_failure("503", 3);
        assert_eq!(entry.status, MutationStatus::Failed);
        assert_eq!(entry.attempts, 3);
    }

    #[test]
    fn test_reset_clears_failure() {
        let mut entry = entry();
        entry.mark_failed("permission denied");
        assert!(!entry.is_replayable());
        entry.reset();
        assert!(entry.is_replayable());
        assert_eq!(entry.attempts, 0);
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_entry_serialization() {
        let entry = entry();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"UPDATE\""));
        let restored: MutationEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, entry);
    }
}
