//! PlotSync application layer.
//!
//! This crate composes the sync core into an app session:
//! - Configuration and the composition root
//! - HTTP client for the remote backend
//! - Read-through / write-through helpers with a uniform query state
//! - Domain hooks for documents, rules, inspections, tasks and plots

pub mod app;
pub mod config;
pub mod hooks;
pub mod query;
pub mod rest;
pub mod viewer;

pub use app::PlotSync;
pub use config::{default_store_path, AppConfig, StoreConfig};
pub use query::{DataSource, QueryState, WriteOutcome};
pub use rest::RestBackend;
pub use viewer::{Role, Viewer};
