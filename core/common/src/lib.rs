//! Common utilities and types shared across PlotSync modules.
//!
//! This module provides the vocabulary every other crate speaks: the error
//! taxonomy used to classify backend and storage failures, and the
//! schema-agnostic record types mirrored between the remote backend and the
//! local cache.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{EntityTable, MutationOp, Record, RecordId, Secret, SyncStatus};
