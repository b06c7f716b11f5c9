//! Community rules and their acknowledgments.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use plotsync_common::{EntityTable, Error, Record, RecordId, Result};
use plotsync_sync::{Filter, SyncManager};

use super::{now, require_text};
use crate::query::{self, DataSource, QueryState, WriteOutcome};
use crate::viewer::Viewer;

pub const TABLE: &str = "rules";
pub const ACK_TABLE: &str = "rule_acknowledgments";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A member's confirmation of having read a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAcknowledgment {
    pub id: String,
    pub rule_id: String,
    pub user_id: String,
    #[serde(default)]
    pub acknowledged_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Partial rule update; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Rules hook.
pub struct Rules {
    sync: Arc<SyncManager>,
    viewer: Viewer,
}

impl Rules {
    pub fn new(sync: Arc<SyncManager>, viewer: Viewer) -> Self {
        Self { sync, viewer }
    }

    fn table() -> Result<EntityTable> {
        EntityTable::new(TABLE)
    }

    fn ack_table() -> Result<EntityTable> {
        EntityTable::new(ACK_TABLE)
    }

    fn my_ack_filter(&self) -> Filter {
        Filter::all().eq("user_id", self.viewer.user_id.as_str())
    }

    /// Every rule, newest first.
    pub async fn list(&self) -> Result<QueryState<Rule>> {
        let filter = Filter::all().order_by("created_at", true);
        query::read_typed(&self.sync, &Self::table()?, &filter).await
    }

    /// Publish a rule. Admin only.
    pub async fn create(&self, rule: NewRule) -> Result<WriteOutcome> {
        self.viewer.require_admin("create rules")?;
        require_text("title", &rule.title)?;

        let mut record = Record::from_serializable(&rule)?;
        record.insert("created_by", self.viewer.user_id.as_str());
        record.insert("created_at", now());
        query::insert(&self.sync, &Self::table()?, record).await
    }

    /// Edit a rule. Admin only.
    pub async fn update(&self, id: &RecordId, changes: RuleChanges) -> Result<WriteOutcome> {
        self.viewer.require_admin("edit rules")?;
        if let Some(title) = &changes.title {
            require_text("title", title)?;
        }

        let mut record = Record::from_serializable(&changes)?;
        if record.as_map().is_empty() {
            return Err(Error::InvalidInput("No rule changes given".to_string()));
        }
        record.insert("updated_at", now());
        query::update(&self.sync, &Self::table()?, id, record).await
    }

    /// Acknowledge a rule for the viewer.
    ///
    /// Acknowledging twice returns the existing acknowledgment.
    pub async fn acknowledge(&self, rule_id: &RecordId) -> Result<WriteOutcome> {
        let acks = Self::ack_table()?;
        let mine = query::read_through(&self.sync, &acks, &self.my_ack_filter()).await?;
        if let Some(existing) = mine
            .data
            .into_iter()
            .find(|r| r.get_str("rule_id") == Some(rule_id.as_str()))
        {
            debug!(rule_id = %rule_id, "Rule already acknowledged");
            let id = existing
                .id()
                .ok_or_else(|| Error::InvalidInput("Acknowledgment row has no id".to_string()))?;
            return Ok(WriteOutcome {
                id,
                record: Some(existing),
                queued: None,
            });
        }

        let mut record = Record::new();
        record.insert("rule_id", rule_id.as_str());
        record.insert("user_id", self.viewer.user_id.as_str());
        record.insert("acknowledged_at", now());
        query::insert(&self.sync, &acks, record).await
    }

    /// The viewer's acknowledgments.
    pub async fn my_acknowledgments(&self) -> Result<QueryState<RuleAcknowledgment>> {
        query::read_typed(&self.sync, &Self::ack_table()?, &self.my_ack_filter()).await
    }

    /// Rules the viewer has not acknowledged yet.
    pub async fn unacknowledged(&self) -> Result<QueryState<Rule>> {
        let rules = self.list().await?;
        let acks = self.my_acknowledgments().await?;

        let acked: HashSet<String> = acks.data.iter().map(|a| a.rule_id.clone()).collect();
        let source = if rules.source == DataSource::Cache || acks.source == DataSource::Cache {
            DataSource::Cache
        } else {
            DataSource::Network
        };

        Ok(QueryState {
            data: rules
                .data
                .into_iter()
                .filter(|r| !acked.contains(&r.id))
                .collect(),
            loading: false,
            error: rules.error.or(acks.error),
            source,
            failed: rules.failed.into_iter().chain(acks.failed).collect(),
        })
    }
}
