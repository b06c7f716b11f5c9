//! Allotment plots.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use plotsync_common::{EntityTable, Result};
use plotsync_sync::{Filter, SyncManager};

use crate::query::{self, QueryState};
use crate::viewer::Viewer;

pub const TABLE: &str = "plots";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plot {
    pub id: String,
    pub number: String,
    /// Member currently holding the plot.
    #[serde(default)]
    pub holder_id: Option<String>,
    #[serde(default)]
    pub area_sqm: Option<f64>,
}

/// Plots hook.
pub struct Plots {
    sync: Arc<SyncManager>,
    viewer: Viewer,
}

impl Plots {
    pub fn new(sync: Arc<SyncManager>, viewer: Viewer) -> Self {
        Self { sync, viewer }
    }

    /// All plots, by number.
    pub async fn list(&self) -> Result<QueryState<Plot>> {
        let filter = Filter::all().order_by("number", false);
        query::read_typed(&self.sync, &EntityTable::new(TABLE)?, &filter).await
    }

    /// Plots held by the viewer.
    pub async fn my_plots(&self) -> Result<QueryState<Plot>> {
        let filter = Filter::all()
            .eq("holder_id", self.viewer.user_id.as_str())
            .order_by("number", false);
        query::read_typed(&self.sync, &EntityTable::new(TABLE)?, &filter).await
    }
}
