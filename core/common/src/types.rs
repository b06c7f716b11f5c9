//! Common types used throughout PlotSync.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use zeroize::Zeroize;

use crate::{Error, Result};

const CACHE_SUFFIX: &str = "_cache";
const PLACEHOLDER_PREFIX: &str = "local-";

/// A named collection of same-shaped records mirrored between the remote
/// backend and the local cache (e.g. `documents`, `inspections`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityTable(String);

impl EntityTable {
    /// Create a new EntityTable from a backend table name.
    ///
    /// # Preconditions
    /// - `name` must be non-empty
    /// - `name` may only contain ASCII lowercase letters, digits and `_`
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains other characters
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "Entity table name cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "Invalid entity table name: {}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Resolve a table from either its backend name or its cache table name.
    pub fn from_cache_table(name: &str) -> Result<Self> {
        Self::new(name.strip_suffix(CACHE_SUFFIX).unwrap_or(name))
    }

    /// The backend table name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the local cache table mirroring this backend table.
    pub fn cache_table(&self) -> String {
        format!("{}{}", self.0, CACHE_SUFFIX)
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EntityTable {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EntityTable> for String {
    fn from(table: EntityTable) -> Self {
        table.0
    }
}

/// Identifier of a single record within an entity table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a local placeholder id for a record created offline.
    ///
    /// Placeholders are replaced by the server-assigned id once the insert
    /// has been applied.
    pub fn placeholder() -> Self {
        Self(format!("{}{}", PLACEHOLDER_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Whether this id was generated locally and never confirmed by the server.
    pub fn is_placeholder(&self) -> bool {
        is_placeholder(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_placeholder(id: &str) -> bool {
    id.strip_prefix(PLACEHOLDER_PREFIX)
        .is_some_and(|rest| uuid::Uuid::parse_str(rest).is_ok())
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A loosely-typed entity record.
///
/// The sync core never interprets record fields beyond `id`; schemas are
/// enforced by the domain layer when converting to and from typed structs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidInput(format!(
                "Record must be a JSON object, got: {}",
                other
            ))),
        }
    }

    /// Convert any serializable domain struct into a record.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Convert this record into a typed domain struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// The record id, if present. Numeric ids are rendered as strings.
    pub fn id(&self) -> Option<RecordId> {
        match self.0.get("id")? {
            Value::String(s) if !s.is_empty() => Some(RecordId::new(s.clone())),
            Value::Number(n) => Some(RecordId::new(n.to_string())),
            _ => None,
        }
    }

    pub fn set_id(&mut self, id: &RecordId) {
        self.0
            .insert("id".to_string(), Value::String(id.as_str().to_string()));
    }

    /// Copy of this record without its `id` field.
    pub fn without_id(&self) -> Self {
        let mut map = self.0.clone();
        map.remove("id");
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Overlay every field of `other` onto this record.
    pub fn merge(&mut self, other: &Record) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Placeholder ids held by fields other than `id`, i.e. references to
    /// records created offline in this or another table.
    pub fn placeholder_references(&self) -> Vec<RecordId> {
        self.0
            .iter()
            .filter(|(key, _)| key.as_str() != "id")
            .filter_map(|(_, value)| value.as_str())
            .filter(|s| is_placeholder(s))
            .map(RecordId::from)
            .collect()
    }

    /// Rewrite every non-`id` field holding `from` to `to`. Returns whether
    /// anything changed.
    pub fn replace_reference(&mut self, from: &RecordId, to: &RecordId) -> bool {
        let mut changed = false;
        for (key, value) in self.0.iter_mut() {
            if key != "id" && value.as_str() == Some(from.as_str()) {
                *value = Value::String(to.as_str().to_string());
                changed = true;
            }
        }
        changed
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Kind of write carried by a mutation queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Insert => "INSERT",
            MutationOp::Update => "UPDATE",
            MutationOp::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(MutationOp::Insert),
            "UPDATE" => Ok(MutationOp::Update),
            "DELETE" => Ok(MutationOp::Delete),
            other => Err(Error::Serialization(format!(
                "Unknown mutation operation: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a cached snapshot matches the backend or awaits a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Snapshot reflects the last known backend state.
    Synced,
    /// Snapshot carries a local write not yet applied to the backend.
    Pending,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            other => Err(Error::Serialization(format!(
                "Unknown sync status: {}",
                other
            ))),
        }
    }
}

/// Credential wrapper that zeroizes on drop.
#[derive(Clone, Default, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the inner value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} chars])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_entity_table_creation() {
        let table = EntityTable::new("inspections").unwrap();
        assert_eq!(table.as_str(), "inspections");
        assert_eq!(table.cache_table(), "inspections_cache");
    }

    #[test]
    fn test_entity_table_invalid_names() {
        assert!(EntityTable::new("").is_err());
        assert!(EntityTable::new("Drop Table").is_err());
        assert!(EntityTable::new("docs;--").is_err());
    }

    #[test]
    fn test_entity_table_from_cache_table() {
        let table = EntityTable::from_cache_table("tasks_cache").unwrap();
        assert_eq!(table.as_str(), "tasks");
        let table = EntityTable::from_cache_table("tasks").unwrap();
        assert_eq!(table.as_str(), "tasks");
    }

    #[test]
    fn test_placeholder_ids() {
        let id = RecordId::placeholder();
        assert!(id.is_placeholder());
        assert!(!RecordId::new("4f1c").is_placeholder());
        assert!(!RecordId::new("local-market").is_placeholder());
        assert_ne!(RecordId::placeholder(), RecordId::placeholder());
    }

    #[test]
    fn test_record_id_accessor() {
        let record = Record::from_value(json!({"id": "abc", "score": 80})).unwrap();
        assert_eq!(record.id(), Some(RecordId::new("abc")));

        let numeric = Record::from_value(json!({"id": 17})).unwrap();
        assert_eq!(numeric.id(), Some(RecordId::new("17")));

        let missing = Record::from_value(json!({"score": 80})).unwrap();
        assert_eq!(missing.id(), None);
    }

    #[test]
    fn test_record_rejects_non_object() {
        assert!(Record::from_value(json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_record_merge_overwrites() {
        let mut local = Record::from_value(json!({"id": "local-1", "score": 80})).unwrap();
        let server =
            Record::from_value(json!({"id": "srv-9", "created_at": "2024-05-01T10:00:00Z"}))
                .unwrap();
        local.merge(&server);
        assert_eq!(local.id(), Some(RecordId::new("srv-9")));
        assert_eq!(local.get("score"), Some(&json!(80)));
        assert!(local.get("created_at").is_some());
    }

    #[test]
    fn test_placeholder_references() {
        let rule = RecordId::placeholder();
        let mut ack = Record::from_value(json!({
            "id": "local-ack",
            "rule_id": rule.as_str(),
            "user_id": "u1",
            "note": "local-market stall",
        }))
        .unwrap();
        assert_eq!(ack.placeholder_references(), vec![rule.clone()]);

        let server = RecordId::new("srv-4");
        assert!(ack.replace_reference(&rule, &server));
        assert_eq!(ack.get_str("rule_id"), Some("srv-4"));
        assert_eq!(ack.get_str("id"), Some("local-ack"));
        assert!(ack.placeholder_references().is_empty());
        assert!(!ack.replace_reference(&rule, &server));
    }

    #[test]
    fn test_mutation_op_wire_names() {
        assert_eq!(serde_json::to_string(&MutationOp::Insert).unwrap(), "\"INSERT\"");
        assert_eq!(MutationOp::parse("DELETE").unwrap(), MutationOp::Delete);
        assert!(MutationOp::parse("UPSERT").is_err());
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("service-role-key");
        assert!(!format!("{:?}", secret).contains("service"));
        assert_eq!(secret.expose(), "service-role-key");
    }

    proptest! {
        #[test]
        fn prop_cache_table_resolves_back(name in "[a-z0-9_]{1,24}") {
            let table = EntityTable::new(name.clone()).unwrap();
            let resolved = EntityTable::from_cache_table(&table.cache_table()).unwrap();
            prop_assert_eq!(resolved.as_str(), name.as_str());
        }

        #[test]
        fn prop_rejects_foreign_characters(name in "[a-z]{0,8}[A-Z./ -][a-z]{0,8}") {
            prop_assert!(EntityTable::new(name).is_err());
        }
    }
}
