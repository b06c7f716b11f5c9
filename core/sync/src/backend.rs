//! Remote backend contract and an in-memory implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use plotsync_common::{EntityTable, Error, MutationOp, Record, RecordId, Result};

/// Ordering clause of a select.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Equality filter plus optional ordering, the query shape every domain
/// read uses. The same filter doubles as the offline predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
    pub order: Option<Order>,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    /// Order results by a column.
    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            descending,
        });
        self
    }

    /// Whether a record satisfies every equality condition.
    pub fn matches(&self, record: &Record) -> bool {
        self.eq
            .iter()
            .all(|(column, value)| record.get(column) == Some(value))
    }

    /// Filter and order a record set the way the backend would.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut matched: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(order) = &self.order {
            matched.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        matched
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    match (a, b) {
        (None, None) => Equal,
        (None, Some(_)) => Less,
        (Some(_), None) => Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Remote entity-table CRUD and filtered-query service.
///
/// The backend enforces row-level permissions itself; implementations map
/// its error signals onto the common taxonomy so callers can tell transient
/// failures (`Error::is_transient`) from rejections.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Get the backend name (e.g., "rest", "memory").
    fn name(&self) -> &str;

    /// Select rows matching a filter.
    async fn select(&self, table: &EntityTable, filter: &Filter) -> Result<Vec<Record>>;

    /// Insert a row; returns the stored row with server-assigned fields.
    async fn insert(&self, table: &EntityTable, record: Record) -> Result<Record>;

    /// Update a row by id; returns the stored row.
    ///
    /// # Errors
    /// - Row not found
    async fn update(&self, table: &EntityTable, id: &RecordId, changes: Record) -> Result<Record>;

    /// Delete a row by id.
    ///
    /// # Errors
    /// - Row not found
    async fn delete(&self, table: &EntityTable, id: &RecordId) -> Result<()>;
}

/// One call observed by the memory backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub table: EntityTable,
    /// `None` for selects.
    pub op: Option<MutationOp>,
    pub record_id: Option<RecordId>,
    pub payload: Option<Record>,
}

/// Injected failure for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Respond as if the network dropped.
    Transient,
    /// Respond with a permission rejection.
    Permanent,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<EntityTable, BTreeMap<RecordId, Record>>,
    calls: Vec<BackendCall>,
    failures: HashMap<EntityTable, (FailureMode, Option<usize>)>,
    latency: Option<Duration>,
}

/// In-memory remote backend.
///
/// Assigns `srv-<n>` ids and `created_at` timestamps on insert, records
/// every call in order, and can be told to fail per table. Used in tests
/// and for local demos.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Network("Memory backend lock poisoned".to_string()))
    }

    /// Seed rows without recording calls.
    pub fn seed(&self, table: &EntityTable, records: Vec<Record>) -> Result<()> {
        let mut state = self.lock()?;
        let rows = state.tables.entry(table.clone()).or_default();
        for record in records {
            let id = record
                .id()
                .ok_or_else(|| Error::InvalidInput("Seed record has no id".to_string()))?;
            rows.insert(id, record);
        }
        Ok(())
    }

    /// Fail calls on `table`, `times` times or forever when `None`.
    pub fn fail_table(&self, table: &EntityTable, mode: FailureMode, times: Option<usize>) {
        if let Ok(mut state) = self.lock() {
            state.failures.insert(table.clone(), (mode, times));
        }
    }

    /// Stop failing calls on `table`.
    pub fn heal_table(&self, table: &EntityTable) {
        if let Ok(mut state) = self.lock() {
            state.failures.remove(table);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut state) = self.lock() {
            state.latency = latency;
        }
    }

    /// Calls observed so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Write calls observed so far, in order.
    pub fn mutation_calls(&self) -> Vec<BackendCall> {
        self.calls().into_iter().filter(|c| c.op.is_some()).collect()
    }

    /// Current rows of a table.
    pub fn rows(&self, table: &EntityTable) -> Vec<Record> {
        self.lock()
            .map(|s| {
                s.tables
                    .get(table)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Record a call and return the injected failure, if any.
    async fn enter(&self, call: BackendCall) -> Result<()> {
        let latency = {
            let mut state = self.lock()?;
            let table = call.table.clone();
            state.calls.push(call);

            if let Some((mode, remaining)) = state.failures.get_mut(&table) {
                let mode = *mode;
                let exhausted = match remaining {
                    Some(0) => true,
                    Some(n) => {
                        *n -= 1;
                        false
                    }
                    None => false,
                };
                if exhausted {
                    state.failures.remove(&table);
                } else {
                    return Err(match mode {
                        FailureMode::Transient => {
                            Error::Network(format!("Connection reset while calling {}", table))
                        }
                        FailureMode::Permanent => Error::Rejected(format!(
                            "new row violates row-level security policy for table \"{}\"",
                            table
                        )),
                    });
                }
            }
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn select(&self, table: &EntityTable, filter: &Filter) -> Result<Vec<Record>> {
        self.enter(BackendCall {
            table: table.clone(),
            op: None,
            record_id: None,
            payload: None,
        })
        .await?;

        let rows = self.rows(table);
        Ok(filter.apply(rows))
    }

    async fn insert(&self, table: &EntityTable, record: Record) -> Result<Record> {
        self.enter(BackendCall {
            table: table.clone(),
            op: Some(MutationOp::Insert),
            record_id: record.id(),
            payload: Some(record.clone()),
        })
        .await?;

        let mut stored = record;
        let id = match stored.id() {
            Some(id) => id,
            None => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let id = RecordId::new(format!("srv-{}", n));
                stored.set_id(&id);
                id
            }
        };
        if stored.get("created_at").is_none() {
            stored.insert("created_at", Utc::now().to_rfc3339());
        }

        let mut state = self.lock()?;
        let rows = state.tables.entry(table.clone()).or_default();
        if rows.contains_key(&id) {
            return Err(Error::Conflict(format!("duplicate key value: id={}", id)));
        }
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, table: &EntityTable, id: &RecordId, changes: Record) -> Result<Record> {
        self.enter(BackendCall {
            table: table.clone(),
            op: Some(MutationOp::Update),
            record_id: Some(id.clone()),
            payload: Some(changes.clone()),
        })
        .await?;

        let mut state = self.lock()?;
        let row = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{} row {} not found", table, id)))?;
        row.merge(&changes.without_id());
        row.insert("updated_at", Utc::now().to_rfc3339());
        Ok(row.clone())
    }

    async fn delete(&self, table: &EntityTable, id: &RecordId) -> Result<()> {
        self.enter(BackendCall {
            table: table.clone(),
            op: Some(MutationOp::Delete),
            record_id: Some(id.clone()),
            payload: None,
        })
        .await?;

        let mut state = self.lock()?;
        state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} row {} not found", table, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(name: &str) -> EntityTable {
        EntityTable::new(name).unwrap()
    }

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_filter_matches_and_orders() {
        let filter = Filter::all().eq("user_id", "u1").order_by("score", true);
        let rows = vec![
            record(json!({"id": "a", "user_id": "u1", "score": 50})),
            record(json!({"id": "b", "user_id": "u2", "score": 90})),
            record(json!({"id": "c", "user_id": "u1", "score": 70})),
        ];
        let result = filter.apply(rows);
        let ids: Vec<String> = result.iter().map(|r| r.id().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_insert_assigns_server_id() {
        let backend = MemoryBackend::new();
        let inspections = table("inspections");
        let stored = backend
            .insert(&inspections, record(json!({"plot_id": "P1", "score": 80})))
            .await
            .unwrap();
        assert_eq!(stored.id().unwrap().as_str(), "srv-1");
        assert!(stored.get("created_at").is_some());
        assert_eq!(backend.rows(&inspections).len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_row() {
        let backend = MemoryBackend::new();
        let tasks = table("tasks");
        let missing = RecordId::new("nope");
        assert!(matches!(
            backend.update(&tasks, &missing, Record::new()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            backend.delete(&tasks, &missing).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection_counts_down() {
        let backend = MemoryBackend::new();
        let rules = table("rules");
        backend.fail_table(&rules, FailureMode::Transient, Some(1));

        let first = backend.select(&rules, &Filter::all()).await;
        assert!(first.unwrap_err().is_transient());
        assert!(backend.select(&rules, &Filter::all()).await.is_ok());

        backend.fail_table(&rules, FailureMode::Permanent, None);
        let err = backend.insert(&rules, Record::new()).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(backend.calls().len(), 3);
    }
}
