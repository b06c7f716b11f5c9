//! Domain hooks: typed entry points per entity table.
//!
//! Hooks validate payloads and apply the viewer's ownership predicate; the
//! online/offline branch itself lives in [`crate::query`].

pub mod documents;
pub mod inspections;
pub mod plots;
pub mod rules;
pub mod tasks;

pub use documents::{Document, Documents, NewDocument};
pub use inspections::{Inspection, InspectionChanges, Inspections, NewInspection};
pub use plots::{Plot, Plots};
pub use rules::{NewRule, Rule, RuleAcknowledgment, RuleChanges, Rules};
pub use tasks::{NewTask, Task, TaskStatus, Tasks};

use chrono::Utc;

use plotsync_common::{Error, Result};

/// Client-side timestamp for new rows; the backend may overwrite it.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}
