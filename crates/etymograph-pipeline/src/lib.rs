//! Etymograph Pipeline - staged bounded-queue orchestration
//!
//! This crate is the system's throughput engine:
//! - The [`Stage`] abstraction: N workers over one bounded input queue,
//!   batch accumulation with idle flush, per-item error routing, and a
//!   sliding-window error-rate abort
//! - Bounded channels with explicit end-of-stream sentinels (one per
//!   downstream worker, always after every real item)
//! - Progress monitoring over relaxed atomic counters, published on a
//!   watch channel
//! - Committed-cursor watermarks feeding durable checkpoints, so a killed
//!   run resumes to the same final state (all writes key on deterministic
//!   ids)
//! - The two canonical pipelines: [`run_ingest`] and [`run_enrich`]

pub mod enrich;
pub mod error;
pub mod ingest;
pub mod message;
pub mod progress;
pub mod retry;
pub mod stage;

// Re-exports for convenience
pub use enrich::{run_enrich, spawn_enrich, EnrichOptions, EnrichReport, RunningEnrich};
pub use error::{PipelineError, Result};
pub use ingest::{run_ingest, spawn_ingest, IngestOptions, IngestReport, RunningIngest};
pub use message::{stage_channel, BatchRecv, Envelope, StageRx, StageTx};
pub use progress::{Monitor, ProgressSnapshot, StageCounters, StageSnapshot, Watermark};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use stage::{
    spawn_stage, ErrorSink, ErrorWindow, ItemError, ItemOutcome, Stage, StageConfig,
    StageContext, StageKind,
};
