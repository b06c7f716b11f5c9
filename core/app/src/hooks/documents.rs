//! Member documents (leases, certificates, photos of plot boundaries).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use plotsync_common::{EntityTable, Record, RecordId, Result};
use plotsync_sync::{Filter, SyncManager};

use super::{now, require_text};
use crate::query::{self, QueryState, WriteOutcome};
use crate::viewer::Viewer;

pub const TABLE: &str = "documents";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Metadata of an uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub file_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

/// Documents hook.
pub struct Documents {
    sync: Arc<SyncManager>,
    viewer: Viewer,
}

impl Documents {
    pub fn new(sync: Arc<SyncManager>, viewer: Viewer) -> Self {
        Self { sync, viewer }
    }

    fn table() -> Result<EntityTable> {
        EntityTable::new(TABLE)
    }

    /// Documents owned by the viewer, newest first.
    pub async fn list_mine(&self) -> Result<QueryState<Document>> {
        let filter = Filter::all()
            .eq("user_id", self.viewer.user_id.as_str())
            .order_by("created_at", true);
        query::read_typed(&self.sync, &Self::table()?, &filter).await
    }

    /// Every member's documents. Admin only.
    pub async fn list_all(&self) -> Result<QueryState<Document>> {
        self.viewer.require_admin("list all documents")?;
        let filter = Filter::all().order_by("created_at", true);
        query::read_typed(&self.sync, &Self::table()?, &filter).await
    }

    /// Register an uploaded file for the viewer.
    ///
    /// # Errors
    /// - Empty title or file URL
    /// - Backend rejection
    /// - Local storage failure
    pub async fn upload(&self, document: NewDocument) -> Result<WriteOutcome> {
        require_text("title", &document.title)?;
        require_text("file_url", &document.file_url)?;

        let mut record = Record::from_serializable(&document)?;
        record.insert("user_id", self.viewer.user_id.as_str());
        record.insert("created_at", now());
        query::insert(&self.sync, &Self::table()?, record).await
    }

    pub async fn rename(&self, id: &RecordId, title: &str) -> Result<WriteOutcome> {
        require_text("title", title)?;
        let mut changes = Record::new();
        changes.insert("title", title);
        query::update(&self.sync, &Self::table()?, id, changes).await
    }

    pub async fn delete(&self, id: &RecordId) -> Result<WriteOutcome> {
        query::delete(&self.sync, &Self::table()?, id).await
    }
}
