//! Durable ordered log of pending writes.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::{LocalStore, MutationEntry, MutationStatus, NewMutation};
use plotsync_common::{EntityTable, Error, MutationOp, Record, RecordId, Result};

/// Mutation queue over a durable local store.
///
/// Entries are replayed in sequence order per entity table. A successfully
/// applied entry is removed exactly once; terminally failed entries stay in
/// the queue until the user retries or discards them.
#[derive(Clone)]
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
}

impl MutationQueue {
    /// Open the queue, resetting entries left `applying` by an interrupted
    /// drain back to `pending`.
    pub async fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let queue = Self { store };
        let mut recovered = 0;
        for mut entry in queue.store.list_mutations().await? {
            if entry.status == MutationStatus::Applying {
                entry.status = MutationStatus::Pending;
                queue.store.update_mutation(&entry).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} interrupted mutations", recovered);
        }
        Ok(queue)
    }

    /// Append a new pending entry.
    ///
    /// # Errors
    /// - Storage failure; the write is lost unless the caller handles it
    pub async fn enqueue(
        &self,
        table: &EntityTable,
        op: MutationOp,
        record_id: Option<RecordId>,
        payload: Record,
    ) -> Result<MutationEntry> {
        let entry = self
            .store
            .append_mutation(NewMutation {
                table: table.clone(),
                op,
                record_id,
                payload,
            })
            .await?;
        info!("Queued {} on {} as #{}", op, table, entry.seq);
        Ok(entry)
    }

    /// Every entry, in sequence order.
    pub async fn entries(&self) -> Result<Vec<MutationEntry>> {
        self.store.list_mutations().await
    }

    /// Entries the next drain would consider, in sequence order.
    pub async fn pending(&self) -> Result<Vec<MutationEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(MutationEntry::is_replayable)
            .collect())
    }

    /// Terminally failed entries awaiting user action.
    pub async fn failed(&self) -> Result<Vec<MutationEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == MutationStatus::Failed)
            .collect())
    }

    pub async fn get(&self, seq: u64) -> Result<Option<MutationEntry>> {
        self.store.get_mutation(seq).await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Persist status, attempts and error of an entry.
    pub async fn save(&self, entry: &MutationEntry) -> Result<()> {
        self.store.update_mutation(entry).await
    }

    /// Remove an applied entry.
    pub async fn complete(&self, seq: u64) -> Result<()> {
        if !self.store.remove_mutation(seq).await? {
            warn!("Mutation #{} was already removed", seq);
        }
        debug!("Mutation #{} applied and removed", seq);
        Ok(())
    }

    /// Point every queued entry of `table` that refers to `from` at `to`.
    ///
    /// Used once a queued insert has been applied and the server assigned
    /// the real id for a locally created record.
    pub async fn rebind_record_id(
        &self,
        table: &EntityTable,
        from: &RecordId,
        to: &RecordId,
    ) -> Result<usize> {
        let mut rebound = 0;
        for mut entry in self.entries().await? {
            if &entry.table != table || entry.record_id.as_ref() != Some(from) {
                continue;
            }
            entry.record_id = Some(to.clone());
            if entry.payload.id().as_ref() == Some(from) {
                entry.payload.set_id(to);
            }
            self.store.update_mutation(&entry).await?;
            rebound += 1;
        }
        if rebound > 0 {
            debug!("Rebound {} queued mutations from {} to {}", rebound, from, to);
        }
        Ok(rebound)
    }

    /// Rewrite payload fields of every queued entry, in any table, that
    /// reference the placeholder `from` (e.g. an acknowledgement's
    /// `rule_id` pointing at a rule created offline).
    pub async fn rebind_references(&self, from: &RecordId, to: &RecordId) -> Result<usize> {
        let mut rebound = 0;
        for mut entry in self.entries().await? {
            if entry.payload.replace_reference(from, to) {
                self.store.update_mutation(&entry).await?;
                rebound += 1;
            }
        }
        if rebound > 0 {
            debug!("Rewrote {} queued references from {} to {}", rebound, from, to);
        }
        Ok(rebound)
    }

    /// Whether a queued INSERT, in any state, still owns the placeholder.
    pub async fn has_unapplied_insert(&self, id: &RecordId) -> Result<bool> {
        Ok(self
            .entries()
            .await?
            .iter()
            .any(|e| e.op == MutationOp::Insert && e.record_id.as_ref() == Some(id)))
    }

    /// Reset a terminally failed entry so the next drain replays it.
    pub async fn retry_failed(&self, seq: u64) -> Result<MutationEntry> {
        let mut entry = self.failed_entry(seq).await?;
        entry.reset();
        self.store.update_mutation(&entry).await?;
        info!("Mutation #{} reset for retry", seq);
        Ok(entry)
    }

    /// Drop a terminally failed entry.
    pub async fn discard_failed(&self, seq: u64) -> Result<MutationEntry> {
        let entry = self.failed_entry(seq).await?;
        self.store.remove_mutation(seq).await?;
        info!("Mutation #{} discarded", seq);
        Ok(entry)
    }

    async fn failed_entry(&self, seq: u64) -> Result<MutationEntry> {
        let entry = self
            .store
            .get_mutation(seq)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Mutation not found: {}", seq)))?;
        if entry.status != MutationStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "Mutation #{} is not failed",
                seq
            )));
        }
        Ok(entry)
    }
}
