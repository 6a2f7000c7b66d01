//! Etymograph Store - persistence for the ingestion system
//!
//! This crate provides the storage layer:
//! - Append-only raw record store with checksum deduplication (SQLite)
//! - Typed entry store with staging-table bulk upserts and a trigram index
//! - Append-only transform log
//! - Durable pipeline checkpoints
//! - Qdrant vector index over entry embeddings
//!
//! All SQLite stores share one database file; each store instance owns its
//! own connection so pipeline workers never share a connection across a
//! queue wait.

pub mod checkpoint;
pub mod entries;
pub mod error;
pub mod log;
pub mod raw;
pub mod schema;
pub mod vector;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use entries::{EntryFilter, EntryStore, UpsertStats};
pub use error::{Result, StoreError};
pub use log::TransformLogStore;
pub use raw::{InsertStats, RawStore, StoredRaw};
pub use vector::{
    EntryIndex, EntryPoint, KnnFilter, VectorHit, VectorIndexConfig, ENTRIES_COLLECTION,
};
