//! Read-through and write-through helpers shared by the domain hooks.
//!
//! Every path asks the sync manager whether the backend is reachable and
//! branches on that single answer: online reads fetch and refresh the
//! cache, offline reads filter the cache; online writes go straight to the
//! backend, offline writes go to the mutation queue.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use plotsync_common::{EntityTable, Error, MutationOp, Record, RecordId, Result, SyncStatus};
use plotsync_storage::MutationStatus;
use plotsync_sync::{FailedMutation, Filter, SyncManager};

/// Where the data of a query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Network,
    Cache,
}

/// Result shape of every domain list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryState<T> {
    pub data: Vec<T>,
    pub loading: bool,
    /// Backend failure the data was served around, if any.
    pub error: Option<String>,
    pub source: DataSource,
    /// Queued writes to this table the backend refused for good. They stay
    /// queued until the user retries or discards them.
    #[serde(default)]
    pub failed: Vec<FailedMutation>,
}

impl<T> QueryState<T> {
    /// State before the first answer arrives.
    pub fn loading() -> Self {
        Self {
            data: Vec::new(),
            loading: true,
            error: None,
            source: DataSource::Cache,
            failed: Vec::new(),
        }
    }

    pub fn network(data: Vec<T>) -> Self {
        Self {
            data,
            loading: false,
            error: None,
            source: DataSource::Network,
            failed: Vec::new(),
        }
    }

    pub fn cache(data: Vec<T>, error: Option<String>) -> Self {
        Self {
            data,
            loading: false,
            error,
            source: DataSource::Cache,
            failed: Vec::new(),
        }
    }

    pub fn is_offline_data(&self) -> bool {
        self.source == DataSource::Cache
    }

    /// Whether any write to this table needs user action.
    pub fn has_failed_writes(&self) -> bool {
        !self.failed.is_empty()
    }

    fn with_failed(mut self, failed: Vec<FailedMutation>) -> Self {
        self.failed = failed;
        self
    }

    /// Keep the state, transform the rows.
    pub fn map<U, F>(self, f: F) -> QueryState<U>
    where
        F: FnMut(T) -> U,
    {
        QueryState {
            data: self.data.into_iter().map(f).collect(),
            loading: self.loading,
            error: self.error,
            source: self.source,
            failed: self.failed,
        }
    }

    /// Keep the rows matching a predicate.
    pub fn retain<F>(mut self, f: F) -> Self
    where
        F: FnMut(&T) -> bool,
    {
        self.data.retain(f);
        self
    }
}

/// Read with an explicit fetch closure.
///
/// Online: runs `fetch`, which must return every backend row matching
/// `filter`, refreshes that part of the cache, and overlays pending local
/// writes matching `filter`. Offline: never runs `fetch` and serves the
/// cached rows matching `filter`. A failed fetch falls back to the cache
/// and reports the error in the state. Rows with a queued delete are
/// hidden either way, and terminally failed writes to the table are
/// listed in `failed`.
///
/// # Errors
/// - Local storage failure
pub async fn read_through_with<F, Fut>(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    filter: &Filter,
    fetch: F,
) -> Result<QueryState<Record>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Record>>>,
{
    if !sync.is_online().await {
        debug!(table = %table, "Offline, reading from cache");
        let queued = QueuedWrites::load(sync, table).await?;
        let rows = cached_rows(sync, table, filter, &queued).await?;
        return Ok(QueryState::cache(rows, None).with_failed(queued.failed));
    }

    let fetched_at = Utc::now();
    match fetch().await {
        Ok(rows) => {
            let queued = QueuedWrites::load(sync, table).await?;
            let rows: Vec<Record> = rows.into_iter().filter(|r| !queued.hides(r)).collect();
            sync.cache()
                .refresh(table, rows.clone(), fetched_at, |r| filter.matches(r))
                .await?;
            let rows = overlay_pending(sync, table, filter, rows).await?;
            Ok(QueryState::network(rows).with_failed(queued.failed))
        }
        Err(err) if err.is_local_storage() => Err(err),
        Err(err) => {
            warn!(table = %table, "Fetch failed, serving cache: {}", err);
            let queued = QueuedWrites::load(sync, table).await?;
            let rows = cached_rows(sync, table, filter, &queued).await?;
            Ok(QueryState::cache(rows, Some(err.to_string())).with_failed(queued.failed))
        }
    }
}

/// Queue entries of one table that change what a read shows.
struct QueuedWrites {
    /// Records with a queued DELETE stay hidden until it is replayed or
    /// discarded.
    deleted: HashSet<RecordId>,
    failed: Vec<FailedMutation>,
}

impl QueuedWrites {
    async fn load(sync: &Arc<SyncManager>, table: &EntityTable) -> Result<Self> {
        let mut deleted = HashSet::new();
        let mut failed = Vec::new();
        for entry in sync.queue().entries().await? {
            if &entry.table != table {
                continue;
            }
            if entry.op == MutationOp::Delete {
                if let Some(id) = &entry.record_id {
                    deleted.insert(id.clone());
                }
            }
            if entry.status == MutationStatus::Failed {
                failed.push(FailedMutation::from_entry(&entry));
            }
        }
        Ok(Self { deleted, failed })
    }

    fn hides(&self, record: &Record) -> bool {
        record.id().is_some_and(|id| self.deleted.contains(&id))
    }
}

/// Read a table through the backend's filtered select.
pub async fn read_through(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    filter: &Filter,
) -> Result<QueryState<Record>> {
    let backend = sync.backend().clone();
    read_through_with(sync, table, filter, || async move {
        backend.select(table, filter).await
    })
    .await
}

/// Typed variant of [`read_through`]; rows that do not fit `T` are
/// skipped.
pub async fn read_typed<T: DeserializeOwned>(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    filter: &Filter,
) -> Result<QueryState<T>> {
    let state = read_through(sync, table, filter).await?;
    Ok(decode_state(table, state))
}

pub(crate) fn decode_state<T: DeserializeOwned>(table: &EntityTable, state: QueryState<Record>) -> QueryState<T> {
    let QueryState {
        data,
        loading,
        error,
        source,
        failed,
    } = state;
    let data = data
        .into_iter()
        .filter_map(|record| match record.to_typed::<T>() {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(table = %table, "Skipping malformed row: {}", e);
                None
            }
        })
        .collect();
    QueryState {
        data,
        loading,
        error,
        source,
        failed,
    }
}

async fn cached_rows(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    filter: &Filter,
    queued: &QueuedWrites,
) -> Result<Vec<Record>> {
    let rows = sync
        .cache()
        .filter(table, |r| filter.matches(r) && !queued.hides(r))
        .await?;
    Ok(filter.apply(rows))
}

async fn overlay_pending(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    filter: &Filter,
    rows: Vec<Record>,
) -> Result<Vec<Record>> {
    let pending: Vec<Record> = sync
        .cache()
        .entries(table)
        .await?
        .into_iter()
        .filter(|e| e.sync_status == SyncStatus::Pending && filter.matches(&e.record))
        .map(|e| e.record)
        .collect();
    if pending.is_empty() {
        return Ok(rows);
    }

    let mut merged: Vec<Record> = rows
        .into_iter()
        .filter(|r| !pending.iter().any(|p| p.id().is_some() && p.id() == r.id()))
        .collect();
    merged.extend(pending);
    Ok(filter.apply(merged))
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub id: RecordId,
    /// Server copy when applied online, pending snapshot when queued;
    /// `None` for deletes.
    pub record: Option<Record>,
    /// Queue sequence number when the write was deferred.
    pub queued: Option<u64>,
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        self.queued.is_some()
    }

    /// Decode the written record.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.record.as_ref().map(|r| r.to_typed::<T>()).transpose()
    }
}

/// Whether a write must go through the queue to keep per-record order.
///
/// A write naming a record created offline (its own id or a field such as
/// `rule_id`) can only be replayed after that record's insert.
async fn must_queue(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    id: &RecordId,
    changes: &Record,
) -> Result<bool> {
    if id.is_placeholder() || !changes.placeholder_references().is_empty() {
        return Ok(true);
    }
    Ok(sync
        .queue()
        .entries()
        .await?
        .iter()
        .any(|e| &e.table == table && e.record_id.as_ref() == Some(id)))
}

async fn defer(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    op: MutationOp,
    id: RecordId,
    record: Record,
) -> Result<WriteOutcome> {
    let entry = sync.record_local_write(table, op, id.clone(), record).await?;
    info!(table = %table, seq = entry.seq, "{} deferred to the mutation queue", op);
    let record = match op {
        MutationOp::Delete => None,
        MutationOp::Insert | MutationOp::Update => Some(entry.payload),
    };
    Ok(WriteOutcome {
        id,
        record,
        queued: Some(entry.seq),
    })
}

/// Insert a new record.
///
/// A record referencing another record created offline is queued behind
/// that record's insert even when online.
///
/// # Errors
/// - Backend rejection (permission or validation)
/// - Local storage failure
pub async fn insert(sync: &Arc<SyncManager>, table: &EntityTable, record: Record) -> Result<WriteOutcome> {
    if sync.is_online().await && record.placeholder_references().is_empty() {
        match sync.backend().insert(table, record.without_id()).await {
            Ok(server) => {
                let id = sync.cache().put_synced(table, None, server.clone()).await?;
                return Ok(WriteOutcome {
                    id,
                    record: Some(server),
                    queued: None,
                });
            }
            Err(err) if err.is_transient() => {
                warn!(table = %table, "Insert failed transiently, queueing: {}", err);
            }
            Err(err) => return Err(err),
        }
    }
    defer(sync, table, MutationOp::Insert, RecordId::placeholder(), record.without_id()).await
}

/// Apply changes to an existing record.
///
/// Offline, the pending snapshot is the cached record with the changes
/// applied.
pub async fn update(
    sync: &Arc<SyncManager>,
    table: &EntityTable,
    id: &RecordId,
    changes: Record,
) -> Result<WriteOutcome> {
    let changes = changes.without_id();
    if sync.is_online().await && !must_queue(sync, table, id, &changes).await? {
        match sync.backend().update(table, id, changes.clone()).await {
            Ok(server) => {
                sync.cache().put_synced(table, Some(id), server.clone()).await?;
                return Ok(WriteOutcome {
                    id: id.clone(),
                    record: Some(server),
                    queued: None,
                });
            }
            Err(err) if err.is_transient() => {
                warn!(table = %table, id = %id, "Update failed transiently, queueing: {}", err);
            }
            Err(err) => return Err(err),
        }
    }

    let mut snapshot = sync
        .cache()
        .get_one(table, id)
        .await?
        .map(|e| e.record)
        .unwrap_or_default();
    snapshot.merge(&changes);
    defer(sync, table, MutationOp::Update, id.clone(), snapshot).await
}

/// Delete a record.
pub async fn delete(sync: &Arc<SyncManager>, table: &EntityTable, id: &RecordId) -> Result<WriteOutcome> {
    if sync.is_online().await && !must_queue(sync, table, id, &Record::new()).await? {
        match sync.backend().delete(table, id).await {
            Ok(()) | Err(Error::NotFound(_)) => {
                sync.cache().remove(table, id).await?;
                return Ok(WriteOutcome {
                    id: id.clone(),
                    record: None,
                    queued: None,
                });
            }
            Err(err) if err.is_transient() => {
                warn!(table = %table, id = %id, "Delete failed transiently, queueing: {}", err);
            }
            Err(err) => return Err(err),
        }
    }
    defer(sync, table, MutationOp::Delete, id.clone(), Record::new()).await
}
