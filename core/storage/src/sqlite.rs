//! SQLite-backed local store.
//!
//! Persists cache snapshots and the mutation queue so both survive app
//! restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::store::{
    CacheEntry, LocalStore, MutationEntry, MutationStatus, NewMutation, UpsertMode,
};
use plotsync_common::{EntityTable, Error, MutationOp, RecordId, Result, SyncStatus};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        cache_table TEXT NOT NULL,
        id TEXT NOT NULL,
        record TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (cache_table, id)
    );

    CREATE TABLE IF NOT EXISTS mutation_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_table TEXT NOT NULL,
        operation TEXT NOT NULL,
        record_id TEXT,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queue_table ON mutation_queue(entity_table, seq);
"#;

const UPSERT_REPLACE: &str = r#"
    INSERT INTO cache_entries (cache_table, id, record, sync_status, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(cache_table, id) DO UPDATE SET
        record = excluded.record,
        sync_status = excluded.sync_status,
        updated_at = excluded.updated_at
    WHERE NOT (cache_entries.record = excluded.record
               AND cache_entries.sync_status = excluded.sync_status)
"#;

const UPSERT_KEEP_PENDING: &str = r#"
    INSERT INTO cache_entries (cache_table, id, record, sync_status, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(cache_table, id) DO UPDATE SET
        record = excluded.record,
        sync_status = excluded.sync_status,
        updated_at = excluded.updated_at
    WHERE cache_entries.sync_status != 'pending'
      AND NOT (cache_entries.record = excluded.record
               AND cache_entries.sync_status = excluded.sync_status)
"#;

const SELECT_MUTATION: &str = r#"
    SELECT seq, entity_table, operation, record_id, payload, created_at, status, attempts, last_error
    FROM mutation_queue
"#;

/// Cache row as stored, before JSON and timestamp decoding.
struct RawEntry {
    table: String,
    id: String,
    record: String,
    sync_status: String,
    updated_at: String,
}

/// Queue row as stored, before decoding.
struct RawMutation {
    seq: i64,
    table: String,
    operation: String,
    record_id: Option<String>,
    payload: String,
    created_at: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
}

fn sqlite_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Invalid timestamp {}: {}", raw, e)))
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            table: row.get(0)?,
            id: row.get(1)?,
            record: row.get(2)?,
            sync_status: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<CacheEntry> {
        Ok(CacheEntry {
            table: self.table,
            id: RecordId::new(self.id),
            record: serde_json::from_str(&self.record)?,
            sync_status: SyncStatus::parse(&self.sync_status)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

impl RawMutation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            table: row.get(1)?,
            operation: row.get(2)?,
            record_id: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            status: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn decode(self) -> Result<MutationEntry> {
        Ok(MutationEntry {
            seq: self.seq as u64,
            table: EntityTable::new(self.table)?,
            op: MutationOp::parse(&self.operation)?,
            record_id: self.record_id.map(RecordId::new),
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_time(&self.created_at)?,
            status: MutationStatus::parse(&self.status)?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
        })
    }
}

/// Local store persisted in a SQLite database file.
///
/// All statements run on the blocking thread pool. A statement that has
/// been handed to the pool completes even when the caller stops waiting.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;

        info!("Local store opened at {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            f(&mut conn).map_err(sqlite_err)
        })
        .await
        .map_err(|e| Error::Storage(format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert_entries(&self, entries: Vec<CacheEntry>, mode: UpsertMode) -> Result<()> {
        let rows = entries
            .into_iter()
            .map(|e| {
                Ok((
                    e.table,
                    e.id.as_str().to_string(),
                    serde_json::to_string(&e.record)?,
                    e.sync_status.as_str(),
                    e.updated_at.to_rfc3339(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = rows.len();
        let sql = match mode {
            UpsertMode::Replace => UPSERT_REPLACE,
            UpsertMode::KeepPending => UPSERT_KEEP_PENDING,
        };

        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(sql)?;
                for (table, id, record, status, updated_at) in &rows {
                    stmt.execute(params![table, id, record, status, updated_at])?;
                }
            }
            tx.commit()
        })
        .await?;

        debug!("Upserted {} cache entries", count);
        Ok(())
    }

    async fn list_entries(&self, table: &str) -> Result<Vec<CacheEntry>> {
        let table = table.to_string();
        let raw = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT cache_table, id, record, sync_status, updated_at
                    FROM cache_entries WHERE cache_table = ?1 ORDER BY id
                    "#,
                )?;
                let rows = stmt.query_map([table], RawEntry::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        raw.into_iter().map(RawEntry::decode).collect()
    }

    async fn get_entry(&self, table: &str, id: &RecordId) -> Result<Option<CacheEntry>> {
        let table = table.to_string();
        let id = id.as_str().to_string();
        let raw = self
            .run(move |conn| {
                conn.query_row(
                    r#"
                    SELECT cache_table, id, record, sync_status, updated_at
                    FROM cache_entries WHERE cache_table = ?1 AND id = ?2
                    "#,
                    params![table, id],
                    RawEntry::from_row,
                )
                .optional()
            })
            .await?;

        raw.map(RawEntry::decode).transpose()
    }

    async fn delete_entry(&self, table: &str, id: &RecordId) -> Result<bool> {
        let table = table.to_string();
        let id = id.as_str().to_string();
        let deleted = self
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE cache_table = ?1 AND id = ?2",
                    params![table, id],
                )
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn cache_tables(&self) -> Result<Vec<String>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT cache_table FROM cache_entries ORDER BY cache_table")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })
        .await
    }

    async fn append_mutation(&self, mutation: NewMutation) -> Result<MutationEntry> {
        let created_at = Utc::now();
        let payload = serde_json::to_string(&mutation.payload)?;
        let table = mutation.table.as_str().to_string();
        let operation = mutation.op.as_str();
        let record_id = mutation.record_id.as_ref().map(|id| id.as_str().to_string());
        let created = created_at.to_rfc3339();

        let seq = self
            .run(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO mutation_queue
                    (entity_table, operation, record_id, payload, created_at, status, attempts)
                    VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0)
                    "#,
                    params![table, operation, record_id, payload, created],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!("Appended mutation {} ({} {})", seq, mutation.op, mutation.table);
        Ok(MutationEntry {
            seq: seq as u64,
            table: mutation.table,
            op: mutation.op,
            record_id: mutation.record_id,
            payload: mutation.payload,
            created_at,
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
        })
    }

    async fn list_mutations(&self) -> Result<Vec<MutationEntry>> {
        let raw = self
            .run(|conn| {
                let mut stmt = conn.prepare(&format!("{} ORDER BY seq", SELECT_MUTATION))?;
                let rows = stmt.query_map([], RawMutation::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        raw.into_iter().map(RawMutation::decode).collect()
    }

    async fn get_mutation(&self, seq: u64) -> Result<Option<MutationEntry>> {
        let raw = self
            .run(move |conn| {
                conn.query_row(
                    &format!("{} WHERE seq = ?1", SELECT_MUTATION),
                    [seq as i64],
                    RawMutation::from_row,
                )
                .optional()
            })
            .await?;

        raw.map(RawMutation::decode).transpose()
    }

    async fn update_mutation(&self, entry: &MutationEntry) -> Result<()> {
        let seq = entry.seq;
        let record_id = entry.record_id.as_ref().map(|id| id.as_str().to_string());
        let payload = serde_json::to_string(&entry.payload)?;
        let status = entry.status.as_str();
        let attempts = i64::from(entry.attempts);
        let last_error = entry.last_error.clone();

        let updated = self
            .run(move |conn| {
                conn.execute(
                    r#"
                    UPDATE mutation_queue
                    SET record_id = ?2, payload = ?3, status = ?4, attempts = ?5, last_error = ?6
                    WHERE seq = ?1
                    "#,
                    params![seq as i64, record_id, payload, status, attempts, last_error],
                )
            })
            .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!("Mutation not found: {}", seq)));
        }
        Ok(())
    }

    async fn remove_mutation(&self, seq: u64) -> Result<bool> {
        let deleted = self
            .run(move |conn| {
                conn.execute("DELETE FROM mutation_queue WHERE seq = ?1", [seq as i64])
            })
            .await?;
        Ok(deleted > 0)
    }
}
