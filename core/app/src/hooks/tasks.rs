//! Work tasks assigned to members.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use plotsync_common::{EntityTable, Record, RecordId, Result};
use plotsync_sync::{Filter, SyncManager};

use super::{now, require_text};
use crate::query::{self, QueryState, WriteOutcome};
use crate::viewer::Viewer;

pub const TABLE: &str = "tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub assigned_to: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Defaults to the viewer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

/// Tasks hook.
pub struct Tasks {
    sync: Arc<SyncManager>,
    viewer: Viewer,
}

impl Tasks {
    pub fn new(sync: Arc<SyncManager>, viewer: Viewer) -> Self {
        Self { sync, viewer }
    }

    fn table() -> Result<EntityTable> {
        EntityTable::new(TABLE)
    }

    /// Tasks assigned to the viewer, by due date.
    pub async fn list_mine(&self) -> Result<QueryState<Task>> {
        let filter = Filter::all()
            .eq("assigned_to", self.viewer.user_id.as_str())
            .order_by("due_date", false);
        query::read_typed(&self.sync, &Self::table()?, &filter).await
    }

    pub async fn create(&self, task: NewTask) -> Result<WriteOutcome> {
        require_text("title", &task.title)?;

        let assignee = task
            .assigned_to
            .clone()
            .unwrap_or_else(|| self.viewer.user_id.clone());
        let mut record = Record::from_serializable(&task)?;
        record.insert("assigned_to", assignee);
        record.insert("created_by", self.viewer.user_id.as_str());
        record.insert("status", TaskStatus::Open.to_string());
        record.insert("created_at", now());
        query::insert(&self.sync, &Self::table()?, record).await
    }

    pub async fn set_status(&self, id: &RecordId, status: TaskStatus) -> Result<WriteOutcome> {
        let mut changes = Record::new();
        changes.insert("status", status.to_string());
        query::update(&self.sync, &Self::table()?, id, changes).await
    }

    pub async fn delete(&self, id: &RecordId) -> Result<WriteOutcome> {
        query::delete(&self.sync, &Self::table()?, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            serde_json::json!("in_progress")
        );
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }
}
