//! Local persistence for PlotSync.
//!
//! This crate provides the durable on-device state of the sync layer:
//! a trait-based local store with in-memory and SQLite backends, the
//! Local Cache Store of entity snapshots, and the Mutation Queue of writes
//! waiting for the remote backend.
//!
//! # Design Principles
//! - Schema-agnostic: records are opaque beyond their `id`
//! - Atomic calls: no half-written cache entry or queue row
//! - Unified error semantics: every store failure is `Error::Storage`

pub mod cache;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use cache::CacheStore;
pub use memory::MemoryStore;
pub use queue::MutationQueue;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::{CacheEntry, LocalStore, MutationEntry, MutationStatus, NewMutation, UpsertMode};
