//! Replay of the mutation queue against the remote backend.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use plotsync_common::{EntityTable, Error, MutationOp, Record, RecordId, Result, SyncStatus};
use plotsync_storage::{CacheStore, MutationEntry, MutationQueue, MutationStatus};

use crate::backend::RemoteBackend;
use crate::retry::RetryPolicy;

/// A queue entry confirmed by the backend and removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMutation {
    pub seq: u64,
    pub table: EntityTable,
    pub op: MutationOp,
    /// Server id of the affected record.
    pub record_id: Option<RecordId>,
}

/// A queue entry the backend did not accept this pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMutation {
    pub seq: u64,
    pub table: EntityTable,
    pub op: MutationOp,
    /// Cache key of the affected record.
    #[serde(default)]
    pub record_id: Option<RecordId>,
    pub error: String,
    /// `true` once the entry needs user action; `false` means it stays
    /// pending for the next online transition.
    pub terminal: bool,
}

impl FailedMutation {
    /// Describe a queue entry after its last failure.
    pub fn from_entry(entry: &MutationEntry) -> Self {
        Self {
            seq: entry.seq,
            table: entry.table.clone(),
            op: entry.op,
            record_id: entry.record_id.clone(),
            error: entry.last_error.clone().unwrap_or_default(),
            terminal: entry.status == MutationStatus::Failed,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub applied: Vec<AppliedMutation>,
    pub failed: Vec<FailedMutation>,
    /// Tables skipped because an earlier entry is terminally failed.
    pub blocked_tables: Vec<EntityTable>,
    /// Entries held back because they reference a record created offline
    /// whose insert has not been applied yet.
    #[serde(default)]
    pub waiting: Vec<u64>,
    pub duration: Duration,
}

impl DrainReport {
    /// Whether every considered entry was applied.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.blocked_tables.is_empty() && self.waiting.is_empty()
    }

    /// Terminal failures produced by this pass.
    pub fn terminal_failures(&self) -> impl Iterator<Item = &FailedMutation> {
        self.failed.iter().filter(|f| f.terminal)
    }

    fn absorb(&mut self, other: TableReport) {
        self.applied.extend(other.applied);
        self.failed.extend(other.failed);
        if let Some(table) = other.blocked {
            self.blocked_tables.push(table);
        }
    }
}

#[derive(Default)]
struct TableReport {
    applied: Vec<AppliedMutation>,
    failed: Vec<FailedMutation>,
    blocked: Option<EntityTable>,
    /// Entry the lane stopped at to wait for another table.
    waiting: Option<(EntityTable, u64)>,
}

/// Replays a snapshot of the queue, one sequential lane per entity table.
///
/// Lanes run concurrently. Inside a lane the first entry that fails stops
/// the lane. An entry that references a record still queued for insert in
/// another table stops its lane until that insert lands; such lanes are
/// run again within the same pass once other lanes made progress.
pub struct QueueDrainer {
    cache: CacheStore,
    queue: MutationQueue,
    backend: Arc<dyn RemoteBackend>,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl QueueDrainer {
    pub fn new(
        cache: CacheStore,
        queue: MutationQueue,
        backend: Arc<dyn RemoteBackend>,
        retry: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            cache,
            queue,
            backend,
            retry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run one pass over the entries queued at call time.
    ///
    /// Entries appended while the pass runs are left for the next pass.
    ///
    /// # Errors
    /// - Local storage failure (cache or queue); backend failures are
    ///   reported in the `DrainReport` instead
    pub async fn drain(&self) -> Result<DrainReport> {
        let start = Instant::now();
        let snapshot = self.queue.entries().await?;
        let Some(last_seq) = snapshot.iter().map(|e| e.seq).max() else {
            debug!("Mutation queue empty, nothing to drain");
            return Ok(DrainReport::default());
        };
        let mut lanes = group_by_table(snapshot);
        info!("Draining mutation queue across {} tables", lanes.len());

        let mut report = DrainReport::default();
        loop {
            let results = join_all(
                lanes
                    .into_iter()
                    .map(|(table, entries)| self.drain_table(table, entries)),
            )
            .await;

            let mut progressed = false;
            let mut waiting = Vec::new();
            for result in results {
                let lane = result?;
                progressed |= !lane.applied.is_empty();
                if let Some(held) = lane.waiting.clone() {
                    waiting.push(held);
                }
                report.absorb(lane);
            }

            if waiting.is_empty() || !progressed {
                report.waiting = waiting.into_iter().map(|(_, seq)| seq).collect();
                break;
            }

            // Another lane may just have created what the held entries need.
            let tables: Vec<EntityTable> = waiting.into_iter().map(|(table, _)| table).collect();
            let rest = self
                .queue
                .entries()
                .await?
                .into_iter()
                .filter(|e| e.seq <= last_seq && tables.contains(&e.table))
                .collect();
            lanes = group_by_table(rest);
        }
        report.duration = start.elapsed();

        info!(
            "Drain finished in {:?}: {} applied, {} failed, {} blocked tables, {} waiting",
            report.duration,
            report.applied.len(),
            report.failed.len(),
            report.blocked_tables.len(),
            report.waiting.len()
        );
        Ok(report)
    }

    async fn drain_table(&self, table: EntityTable, entries: Vec<MutationEntry>) -> Result<TableReport> {
        let mut report = TableReport::default();

        for snapshot in entries {
            // Re-read: an earlier entry may have rebound ids in this one.
            let Some(mut entry) = self.queue.get(snapshot.seq).await? else {
                continue;
            };
            match entry.status {
                MutationStatus::Failed => {
                    debug!("Table {} blocked by failed mutation #{}", table, entry.seq);
                    report.blocked = Some(table.clone());
                    break;
                }
                MutationStatus::Applying => {
                    warn!("Mutation #{} already applying, stopping table {}", entry.seq, table);
                    break;
                }
                MutationStatus::Pending => {}
            }

            let reference = self.check_references(&mut entry).await?;
            if let Reference::Waiting(id) = &reference {
                debug!("Mutation #{} on {} waits for the insert of {}", entry.seq, table, id);
                report.waiting = Some((table.clone(), entry.seq));
                break;
            }

            entry.mark_applying();
            self.queue.save(&entry).await?;

            let result = match reference {
                Reference::Missing(id) => Err(Error::InvalidInput(format!(
                    "References {} which was never synced",
                    id
                ))),
                _ => self.apply(&entry).await,
            };
            match result {
                Ok(record_id) => {
                    self.queue.complete(entry.seq).await?;
                    debug!("Applied {} #{} on {}", entry.op, entry.seq, table);
                    report.applied.push(AppliedMutation {
                        seq: entry.seq,
                        table: table.clone(),
                        op: entry.op,
                        record_id,
                    });
                }
                Err(err) if err.is_local_storage() => return Err(err),
                Err(err) => {
                    let message = err.to_string();
                    if err.is_transient() {
                        entry.record_transient_failure(&message, self.max_attempts);
                    } else {
                        entry.mark_failed(&message);
                    }
                    self.queue.save(&entry).await?;

                    let failed = FailedMutation::from_entry(&entry);
                    if failed.terminal {
                        warn!("Mutation #{} on {} failed terminally: {}", entry.seq, table, message);
                    } else {
                        info!(
                            "Mutation #{} on {} deferred ({}/{}): {}",
                            entry.seq, table, entry.attempts, self.max_attempts, message
                        );
                    }
                    report.failed.push(failed);
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Whether the placeholders the payload references can be sent.
    /// Refreshes `entry` when a reference was resolved meanwhile.
    async fn check_references(&self, entry: &mut MutationEntry) -> Result<Reference> {
        for reference in foreign_references(entry) {
            if self.queue.has_unapplied_insert(&reference).await? {
                return Ok(Reference::Waiting(reference));
            }
            // The insert landed after the entry was read.
            if let Some(fresh) = self.queue.get(entry.seq).await? {
                *entry = fresh;
            }
        }
        // Anything still a placeholder lost its insert (e.g. discarded).
        Ok(match foreign_references(entry).into_iter().next() {
            Some(id) => Reference::Missing(id),
            None => Reference::Ready,
        })
    }

    async fn apply(&self, entry: &MutationEntry) -> Result<Option<RecordId>> {
        match entry.op {
            MutationOp::Insert => self.apply_insert(entry).await,
            MutationOp::Update => self.apply_update(entry).await.map(Some),
            MutationOp::Delete => self.apply_delete(entry).await.map(Some),
        }
    }

    async fn apply_insert(&self, entry: &MutationEntry) -> Result<Option<RecordId>> {
        let table = &entry.table;
        let local_id = entry.record_id.clone().or_else(|| entry.payload.id());

        let payload = match &local_id {
            Some(id) if id.is_placeholder() => entry.payload.without_id(),
            _ => entry.payload.clone(),
        };

        let backend = self.backend.clone();
        let mut server = self
            .retry
            .replay(entry, || {
                let b = backend.clone();
                let payload = payload.clone();
                async move { b.insert(table, payload).await }
            })
            .await?;

        // The row exists on the backend either way; replaying would insert
        // it twice.
        let server_id = match (server.id(), local_id.clone()) {
            (Some(id), _) => id,
            (None, Some(local)) => {
                warn!(
                    "Backend returned no id for #{} on {}, keeping {}",
                    entry.seq, table, local
                );
                let mut record = entry.payload.clone();
                record.merge(&server);
                record.set_id(&local);
                server = record;
                local
            }
            (None, None) => {
                warn!("Backend returned no id for #{} on {}, nothing to cache", entry.seq, table);
                return Ok(None);
            }
        };

        let mut later_writes = false;
        if let Some(local) = local_id.as_ref().filter(|id| *id != &server_id) {
            later_writes = self.queue.rebind_record_id(table, local, &server_id).await? > 0;
            self.queue.rebind_references(local, &server_id).await?;
            self.cache.rebind_references(local, &server_id).await?;
        } else if let Some(local) = local_id.as_ref() {
            later_writes = self.has_later_writes(table, local, entry.seq).await?;
        }

        if later_writes {
            // Keep the newest local state visible until the later writes land.
            let local = match local_id.as_ref() {
                Some(id) => self.cache.get_one(table, id).await?,
                None => None,
            };
            let mut merged = server.clone();
            if let Some(local) = local.filter(|e| e.sync_status == SyncStatus::Pending) {
                merged.merge(&local.record.without_id());
            }
            merged.set_id(&server_id);
            if let Some(local) = local_id.as_ref().filter(|id| *id != &server_id) {
                self.cache.remove(table, local).await?;
            }
            self.cache.put_pending(table, &server_id, merged).await?;
        } else {
            self.cache.put_synced(table, local_id.as_ref(), server).await?;
        }

        Ok(Some(server_id))
    }

    async fn apply_update(&self, entry: &MutationEntry) -> Result<RecordId> {
        let table = &entry.table;
        let id = target_id(entry)?;
        let changes = entry.payload.without_id();

        let backend = self.backend.clone();
        let server = self
            .retry
            .replay(entry, || {
                let b = backend.clone();
                let id = id.clone();
                let changes = changes.clone();
                async move { b.update(table, &id, changes).await }
            })
            .await?;

        if !self.has_later_writes(table, &id, entry.seq).await? {
            self.cache.put_synced(table, Some(&id), server).await?;
        }
        Ok(id)
    }

    async fn apply_delete(&self, entry: &MutationEntry) -> Result<RecordId> {
        let table = &entry.table;
        let id = target_id(entry)?;

        let backend = self.backend.clone();
        let result = self
            .retry
            .replay(entry, || {
                let b = backend.clone();
                let id = id.clone();
                async move { b.delete(table, &id).await }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!("{} row {} already gone, delete counts as applied", table, id);
            }
            Err(err) => return Err(err),
        }

        self.cache.remove(table, &id).await?;
        Ok(id)
    }

    /// Whether the queue holds a newer write for the same record.
    async fn has_later_writes(&self, table: &EntityTable, id: &RecordId, seq: u64) -> Result<bool> {
        Ok(self.queue.entries().await?.iter().any(|e| {
            e.seq > seq && &e.table == table && e.record_id.as_ref() == Some(id)
        }))
    }
}

/// State of the placeholders an entry's payload points at.
enum Reference {
    Ready,
    /// The referenced insert is still queued.
    Waiting(RecordId),
    /// No queued insert owns the placeholder any more.
    Missing(RecordId),
}

/// Placeholders referenced by the payload, other than the entry's own id.
fn foreign_references(entry: &MutationEntry) -> Vec<RecordId> {
    entry
        .payload
        .placeholder_references()
        .into_iter()
        .filter(|id| entry.record_id.as_ref() != Some(id))
        .collect()
}

/// Group entries by table, keeping sequence order inside each group and
/// first-appearance order across groups.
fn group_by_table(entries: Vec<MutationEntry>) -> Vec<(EntityTable, Vec<MutationEntry>)> {
    let mut lanes: Vec<(EntityTable, Vec<MutationEntry>)> = Vec::new();
    let mut index: HashMap<EntityTable, usize> = HashMap::new();

    let mut entries = entries;
    entries.sort_by_key(|e| e.seq);
    for entry in entries {
        match index.get(&entry.table) {
            Some(&i) => lanes[i].1.push(entry),
            None => {
                index.insert(entry.table.clone(), lanes.len());
                lanes.push((entry.table.clone(), vec![entry]));
            }
        }
    }
    lanes
}

fn target_id(entry: &MutationEntry) -> Result<RecordId> {
    entry
        .record_id
        .clone()
        .or_else(|| entry.payload.id())
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} #{} on {} has no record id",
                entry.op, entry.seq, entry.table
            ))
        })
}

/// Payload for a DELETE entry: just the identifying key.
pub fn delete_payload(id: &RecordId) -> Record {
    let mut payload = Record::new();
    payload.set_id(id);
    payload
}
