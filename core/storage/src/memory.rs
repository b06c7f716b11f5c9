//! In-memory local store for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::store::{
    CacheEntry, LocalStore, MutationEntry, MutationStatus, NewMutation, UpsertMode,
};
use plotsync_common::{Error, RecordId, Result, SyncStatus};

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<(String, RecordId), CacheEntry>,
    mutations: BTreeMap<u64, MutationEntry>,
    next_seq: u64,
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_entries(&self, entries: Vec<CacheEntry>, mode: UpsertMode) -> Result<()> {
        let mut inner = self.write()?;
        for entry in entries {
            let key = (entry.table.clone(), entry.id.clone());
            if let Some(existing) = inner.entries.get(&key) {
                if existing.same_snapshot(&entry) {
                    continue;
                }
                if mode == UpsertMode::KeepPending && existing.sync_status == SyncStatus::Pending
                {
                    continue;
                }
            }
            inner.entries.insert(key, entry);
        }
        Ok(())
    }

    async fn list_entries(&self, table: &str) -> Result<Vec<CacheEntry>> {
        let inner = self.read()?;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.table == table)
            .cloned()
            .collect())
    }

    async fn get_entry(&self, table: &str, id: &RecordId) -> Result<Option<CacheEntry>> {
        let inner = self.read()?;
        Ok(inner.entries.get(&(table.to_string(), id.clone())).cloned())
    }

    async fn delete_entry(&self, table: &str, id: &RecordId) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner
            .entries
            .remove(&(table.to_string(), id.clone()))
            .is_some())
    }

    async fn cache_tables(&self) -> Result<Vec<String>> {
        let inner = self.read()?;
        let mut tables: Vec<String> = inner.entries.keys().map(|(t, _)| t.clone()).collect();
        tables.dedup();
        Ok(tables)
    }

    async fn append_mutation(&self, mutation: NewMutation) -> Result<MutationEntry> {
        let mut inner = self.write()?;
        inner.next_seq += 1;
        let entry = MutationEntry {
            seq: inner.next_seq,
            table: mutation.table,
            op: mutation.op,
            record_id: mutation.record_id,
            payload: mutation.payload,
            created_at: Utc::now(),
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
        };
        inner.mutations.insert(entry.seq, entry.clone());
        Ok(entry)
    }

    async fn list_mutations(&self) -> Result<Vec<MutationEntry>> {
        let inner = self.read()?;
        Ok(inner.mutations.values().cloned().collect())
    }

    async fn get_mutation(&self, seq: u64) -> Result<Option<MutationEntry>> {
        let inner = self.read()?;
        Ok(inner.mutations.get(&seq).cloned())
    }

    async fn update_mutation(&self, entry: &MutationEntry) -> Result<()> {
        let mut inner = self.write()?;
        match inner.mutations.get_mut(&entry.seq) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Mutation not found: {}", entry.seq))),
        }
    }

    async fn remove_mutation(&self, seq: u64) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner.mutations.remove(&seq).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plotsync_common::{EntityTable, MutationOp, Record};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_list() {
        let store = MemoryStore::new();
        store
            .upsert_entries(
                vec![
                    CacheEntry::synced("tasks_cache", "b".into(), record(json!({"id": "b"}))),
                    CacheEntry::synced("tasks_cache", "a".into(), record(json!({"id": "a"}))),
                    CacheEntry::synced("rules_cache", "r".into(), record(json!({"id": "r"}))),
                ],
                UpsertMode::Replace,
            )
            .await
            .unwrap();

        let tasks = store.list_entries("tasks_cache").await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id.as_str(), "a");
        assert_eq!(
            store.cache_tables().await.unwrap(),
            vec!["rules_cache".to_string(), "tasks_cache".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_table_is_empty() {
        let store = MemoryStore::new();
        assert!(store.list_entries("never_cache").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keep_pending_mode() {
        let store = MemoryStore::new();
        let pending = CacheEntry::pending("tasks_cache", "t1".into(), record(json!({"v": 1})));
        store
            .upsert_entries(vec![pending], UpsertMode::Replace)
            .await
            .unwrap();

        let fresh = CacheEntry::synced("tasks_cache", "t1".into(), record(json!({"v": 0})));
        store
            .upsert_entries(vec![fresh], UpsertMode::KeepPending)
            .await
            .unwrap();

        let entry = store
            .get_entry("tasks_cache", &"t1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.sync_status, SyncStatus::Pending);
        assert_eq!(entry.record.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_mutation_sequence_is_monotonic() {
        let store = MemoryStore::new();
        let table = EntityTable::new("tasks").unwrap();
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let entry = store
                .append_mutation(NewMutation {
                    table: table.clone(),
                    op: MutationOp::Insert,
                    record_id: None,
                    payload: Record::new(),
                })
                .await
                .unwrap();
            seqs.push(entry.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        assert!(store.remove_mutation(2).await.unwrap());
        assert!(!store.remove_mutation(2).await.unwrap());
        let seqs: Vec<u64> = store
            .list_mutations()
            .await
            .unwrap()
            .iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_update_missing_mutation_fails() {
        let store = MemoryStore::new();
        let entry = store
            .append_mutation(NewMutation {
                table: EntityTable::new("tasks").unwrap(),
                op: MutationOp::Delete,
                record_id: Some("t1".into()),
                payload: Record::new(),
            })
            .await
            .unwrap();
        store.remove_mutation(entry.seq).await.unwrap();
        assert!(matches!(
            store.update_mutation(&entry).await,
            Err(Error::NotFound(_))
        ));
    }
}
