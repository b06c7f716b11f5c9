//! Local cache of entity snapshots, one cache table per entity table.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::store::{CacheEntry, LocalStore, UpsertMode};
use plotsync_common::{EntityTable, Error, Record, RecordId, Result, SyncStatus};

/// Durable key-scoped storage of entity snapshots.
///
/// The cache is always subordinate to the remote backend: every entry is
/// either a copy of a backend row (`synced`) or a local write still waiting
/// in the mutation queue (`pending`).
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn LocalStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Merge fresh backend records into the table's snapshot set.
    ///
    /// Records are keyed by their `id`; entries still holding a pending
    /// local write are left untouched. Idempotent.
    ///
    /// # Errors
    /// - A record has no `id`
    /// - Storage failure
    pub async fn upsert(&self, table: &EntityTable, records: Vec<Record>) -> Result<usize> {
        let cache_table = table.cache_table();
        let entries = records
            .into_iter()
            .map(|record| {
                let id = record.id().ok_or_else(|| {
                    Error::InvalidInput(format!("Record in {} has no id", table))
                })?;
                Ok(CacheEntry::synced(cache_table.clone(), id, record))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = entries.len();
        self.store
            .upsert_entries(entries, UpsertMode::KeepPending)
            .await?;
        debug!("Cached {} records into {}", count, cache_table);
        Ok(count)
    }

    /// Replace the part of a table covered by a fetch.
    ///
    /// `records` is the complete backend answer, started at `fetched_at`,
    /// for every row satisfying `in_scope`. They are upserted like
    /// [`CacheStore::upsert`], and synced entries in scope that the backend
    /// no longer returned are dropped, so rows deleted elsewhere do not
    /// linger for offline reads. Pending entries, and entries written after
    /// the fetch started, are kept.
    pub async fn refresh<F>(
        &self,
        table: &EntityTable,
        records: Vec<Record>,
        fetched_at: DateTime<Utc>,
        in_scope: F,
    ) -> Result<usize>
    where
        F: Fn(&Record) -> bool,
    {
        let fresh: HashSet<RecordId> = records.iter().filter_map(Record::id).collect();
        self.upsert(table, records).await?;

        let cache_table = table.cache_table();
        let mut pruned = 0;
        for entry in self.store.list_entries(&cache_table).await? {
            if entry.sync_status == SyncStatus::Synced
                && entry.updated_at < fetched_at
                && !fresh.contains(&entry.id)
                && in_scope(&entry.record)
            {
                self.store.delete_entry(&cache_table, &entry.id).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} stale entries from {}", pruned, cache_table);
        }
        Ok(pruned)
    }

    /// Rewrite references to a placeholder id held by pending snapshots of
    /// any table.
    pub async fn rebind_references(&self, from: &RecordId, to: &RecordId) -> Result<usize> {
        let mut changed = Vec::new();
        for cache_table in self.store.cache_tables().await? {
            for mut entry in self.store.list_entries(&cache_table).await? {
                if entry.sync_status == SyncStatus::Pending && entry.record.replace_reference(from, to) {
                    changed.push(entry);
                }
            }
        }
        let count = changed.len();
        if count > 0 {
            self.store.upsert_entries(changed, UpsertMode::Replace).await?;
        }
        Ok(count)
    }

    /// Store a local write that has not reached the backend yet.
    pub async fn put_pending(&self, table: &EntityTable, id: &RecordId, record: Record) -> Result<()> {
        let entry = CacheEntry::pending(table.cache_table(), id.clone(), record);
        self.store.upsert_entries(vec![entry], UpsertMode::Replace).await
    }

    /// Fold the authoritative server copy of a record into the cache.
    ///
    /// `local_id` is the key the record was cached under; when the server
    /// assigned a different id, the local entry is replaced by the server's.
    pub async fn put_synced(
        &self,
        table: &EntityTable,
        local_id: Option<&RecordId>,
        server_record: Record,
    ) -> Result<RecordId> {
        let cache_table = table.cache_table();
        let server_id = server_record
            .id()
            .or_else(|| local_id.cloned())
            .ok_or_else(|| Error::InvalidInput(format!("Server record in {} has no id", table)))?;

        if let Some(local_id) = local_id {
            if local_id != &server_id {
                self.store.delete_entry(&cache_table, local_id).await?;
            }
        }

        let entry = CacheEntry::synced(cache_table, server_id.clone(), server_record);
        self.store.upsert_entries(vec![entry], UpsertMode::Replace).await?;
        Ok(server_id)
    }

    /// All cached entries of a table. Empty if never populated.
    pub async fn entries(&self, table: &EntityTable) -> Result<Vec<CacheEntry>> {
        self.store.list_entries(&table.cache_table()).await
    }

    /// All cached records of a table.
    pub async fn get(&self, table: &EntityTable) -> Result<Vec<Record>> {
        Ok(self
            .entries(table)
            .await?
            .into_iter()
            .map(|e| e.record)
            .collect())
    }

    /// Cached records of a table matching a predicate.
    pub async fn filter<F>(&self, table: &EntityTable, predicate: F) -> Result<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        Ok(self
            .get(table)
            .await?
            .into_iter()
            .filter(|r| predicate(r))
            .collect())
    }

    pub async fn get_one(&self, table: &EntityTable, id: &RecordId) -> Result<Option<CacheEntry>> {
        self.store.get_entry(&table.cache_table(), id).await
    }

    /// Whether a cached record still carries a queued local write.
    pub async fn is_pending(&self, table: &EntityTable, id: &RecordId) -> Result<bool> {
        Ok(self
            .get_one(table, id)
            .await?
            .map(|e| e.sync_status == SyncStatus::Pending)
            .unwrap_or(false))
    }

    pub async fn remove(&self, table: &EntityTable, id: &RecordId) -> Result<bool> {
        self.store.delete_entry(&table.cache_table(), id).await
    }

    /// Names of populated cache tables.
    pub async fn tables(&self) -> Result<Vec<String>> {
        self.store.cache_tables().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn cache() -> CacheStore {
        CacheStore::new(Arc::new(MemoryStore::new()))
    }

    fn table(name: &str) -> EntityTable {
        EntityTable::new(name).unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_never_populated_table_is_empty() {
        let cache = cache();
        assert!(cache.get(&table("documents")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let cache = cache();
        let docs = table("documents");
        cache
            .upsert(&docs, vec![record(json!({"id": "d1", "title": "Old"}))])
            .await
            .unwrap();
        cache
            .upsert(
                &docs,
                vec![
                    record(json!({"id": "d1", "title": "New"})),
                    record(json!({"id": "d2", "title": "Other"})),
                ],
            )
            .await
            .unwrap();

        let records = cache.get(&docs).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get_str("title"), Some("New"));
    }

    #[tokio::test]
    async fn test_upsert_requires_id() {
        let cache = cache();
        let result = cache
            .upsert(&table("documents"), vec![record(json!({"title": "x"}))])
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_refresh_does_not_clobber_pending() {
        let cache = cache();
        let tasks = table("tasks");
        let id = RecordId::new("t1");
        cache
            .put_pending(&tasks, &id, record(json!({"id": "t1", "status": "done"})))
            .await
            .unwrap();
        cache
            .upsert(&tasks, vec![record(json!({"id": "t1", "status": "open"}))])
            .await
            .unwrap();

        assert!(cache.is_pending(&tasks, &id).await.unwrap());
        let records = cache.get(&tasks).await.unwrap();
        assert_eq!(records[0].get_str("status"), Some("done"));
    }

    #[tokio::test]
    async fn test_put_synced_replaces_placeholder() {
        let cache = cache();
        let inspections = table("inspections");
        let local = RecordId::placeholder();
        let mut pending = record(json!({"plot_id": "P1", "score": 80}));
        pending.set_id(&local);
        cache.put_pending(&inspections, &local, pending).await.unwrap();

        let server = record(json!({"id": "srv-1", "plot_id": "P1", "score": 80}));
        let id = cache
            .put_synced(&inspections, Some(&local), server)
            .await
            .unwrap();

        assert_eq!(id.as_str(), "srv-1");
        let entries = cache.entries(&inspections).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id.as_str(), "srv-1");
        assert_eq!(entries[0].sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_refresh_drops_rows_deleted_remotely() {
        let cache = cache();
        let tasks = table("tasks");
        cache
            .upsert(
                &tasks,
                vec![
                    record(json!({"id": "t1", "assigned_to": "u1"})),
                    record(json!({"id": "t2", "assigned_to": "u1"})),
                    record(json!({"id": "t3", "assigned_to": "u2"})),
                ],
            )
            .await
            .unwrap();
        let local = RecordId::placeholder();
        cache
            .put_pending(&tasks, &local, record(json!({"id": local.as_str(), "assigned_to": "u1"})))
            .await
            .unwrap();

        // t2 was deleted on another device; the fetch covered u1 only.
        let pruned = cache
            .refresh(
                &tasks,
                vec![record(json!({"id": "t1", "assigned_to": "u1"}))],
                Utc::now(),
                |r| r.get_str("assigned_to") == Some("u1"),
            )
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let ids: Vec<String> = cache
            .entries(&tasks)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"t1".to_string()));
        assert!(ids.contains(&"t3".to_string()));
        assert!(ids.contains(&local.to_string()));
    }

    #[tokio::test]
    async fn test_rebind_references_in_pending_snapshots() {
        let cache = cache();
        let rule = RecordId::placeholder();
        let acks = table("rule_acknowledgments");
        let ack = RecordId::placeholder();
        cache
            .put_pending(&acks, &ack, record(json!({"id": ack.as_str(), "rule_id": rule.as_str()})))
            .await
            .unwrap();

        let server = RecordId::new("srv-1");
        assert_eq!(cache.rebind_references(&rule, &server).await.unwrap(), 1);
        let entry = cache.get_one(&acks, &ack).await.unwrap().unwrap();
        assert_eq!(entry.record.get_str("rule_id"), Some("srv-1"));
        assert_eq!(entry.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_filter() {
        let cache = cache();
        let docs = table("documents");
        cache
            .upsert(
                &docs,
                vec![
                    record(json!({"id": "d1", "user_id": "u1"})),
                    record(json!({"id": "d2", "user_id": "u2"})),
                ],
            )
            .await
            .unwrap();
        let mine = cache
            .filter(&docs, |r| r.get_str("user_id") == Some("u1"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_last_write_wins() {
        let cache = cache();
        let rules = table("rules");
        let a = cache.upsert(&rules, vec![record(json!({"id": "r1", "v": 1}))]);
        let b = cache.upsert(&rules, vec![record(json!({"id": "r1", "v": 2}))]);
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();

        let records = cache.get(&rules).await.unwrap();
        assert_eq!(records.len(), 1);
        let v = records[0].get("v").and_then(|v| v.as_i64()).unwrap();
        assert!(v == 1 || v == 2);
    }

    fn arb_records() -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec(("[a-d]", 0i64..5), 0..12).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(id, v)| record(json!({"id": id, "v": v})))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_upsert_is_idempotent(records in arb_records()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let once = cache();
                let twice = cache();
                let docs = table("documents");

                once.upsert(&docs, records.clone()).await.unwrap();
                twice.upsert(&docs, records.clone()).await.unwrap();
                twice.upsert(&docs, records.clone()).await.unwrap();

                let single = once.get(&docs).await.unwrap();
                let double = twice.get(&docs).await.unwrap();
                prop_assert_eq!(single, double);
                Ok(())
            })?;
        }
    }
}
