//! Plot inspections.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use plotsync_common::{EntityTable, Error, Record, RecordId, Result};
use plotsync_sync::{Filter, SyncManager};

use super::now;
use crate::query::{self, QueryState, WriteOutcome};
use crate::viewer::Viewer;

pub const TABLE: &str = "inspections";

/// Highest inspection score.
pub const MAX_SCORE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub id: String,
    pub plot_id: String,
    pub score: i64,
    #[serde(default)]
    pub inspector_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub inspected_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInspection {
    pub plot_id: String,
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn check_score(score: i64) -> Result<()> {
    if !(0..=MAX_SCORE).contains(&score) {
        return Err(Error::InvalidInput(format!(
            "Score must be between 0 and {}, got {}",
            MAX_SCORE, score
        )));
    }
    Ok(())
}

/// Inspections hook.
pub struct Inspections {
    sync: Arc<SyncManager>,
    viewer: Viewer,
}

impl Inspections {
    pub fn new(sync: Arc<SyncManager>, viewer: Viewer) -> Self {
        Self { sync, viewer }
    }

    fn table() -> Result<EntityTable> {
        EntityTable::new(TABLE)
    }

    /// Inspections of one plot, most recent first.
    pub async fn list_for_plot(&self, plot_id: &str) -> Result<QueryState<Inspection>> {
        let filter = Filter::all()
            .eq("plot_id", plot_id)
            .order_by("inspected_at", true);
        query::read_typed(&self.sync, &Self::table()?, &filter).await
    }

    pub async fn list_all(&self) -> Result<QueryState<Inspection>> {
        let filter = Filter::all().order_by("inspected_at", true);
        query::read_typed(&self.sync, &Self::table()?, &filter).await
    }

    /// Record an inspection by the viewer.
    ///
    /// # Errors
    /// - Score out of range
    /// - Backend rejection
    /// - Local storage failure
    pub async fn create(&self, inspection: NewInspection) -> Result<WriteOutcome> {
        check_score(inspection.score)?;
        if inspection.plot_id.is_empty() {
            return Err(Error::InvalidInput("plot_id must not be empty".to_string()));
        }

        let mut record = Record::from_serializable(&inspection)?;
        record.insert("inspector_id", self.viewer.user_id.as_str());
        record.insert("inspected_at", now());
        query::insert(&self.sync, &Self::table()?, record).await
    }

    pub async fn update(&self, id: &RecordId, changes: InspectionChanges) -> Result<WriteOutcome> {
        if let Some(score) = changes.score {
            check_score(score)?;
        }
        let record = Record::from_serializable(&changes)?;
        if record.as_map().is_empty() {
            return Err(Error::InvalidInput("No inspection changes given".to_string()));
        }
        query::update(&self.sync, &Self::table()?, id, record).await
    }
}
