//! Progress accounting
//!
//! Per-stage counters use relaxed atomic adds on the hot path; the monitor
//! task reads each counter once per cycle to take a consistent-enough
//! snapshot and publishes `(rate, queue depths, eta, errors)` over a watch
//! channel. The committed-cursor watermark lives here too: it is what the
//! checkpointer persists.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// std Mutex is fine here: these sections never hold across an await.
use std::sync::Mutex;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Relaxed per-stage counters.
#[derive(Debug, Default)]
pub struct StageCounters {
    pub name: String,
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

impl StageCounters {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn add_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self, n: u64) {
        self.succeeded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of one stage at one monitor cycle.
#[derive(Debug, Clone, Default)]
pub struct StageSnapshot {
    pub name: String,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Items per second since the previous cycle
    pub rate: f64,
    /// Depth of the stage's input queue, when it has one
    pub queue_depth: Option<usize>,
}

/// Snapshot of the whole pipeline at one monitor cycle.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub pipeline: String,
    pub stages: Vec<StageSnapshot>,
    /// Total known input size, when the source can tell us
    pub total: Option<u64>,
    /// Estimated seconds to completion, when total and rate allow
    pub eta_secs: Option<f64>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Processed count of the first stage (pipeline input side).
    pub fn input_processed(&self) -> u64 {
        self.stages.first().map(|s| s.processed).unwrap_or(0)
    }

    /// Failure count across all stages.
    pub fn total_failed(&self) -> u64 {
        self.stages.iter().map(|s| s.failed).sum()
    }
}

/// A type-erased probe reading one queue's depth.
pub type DepthProbe = Box<dyn Fn() -> usize + Send + Sync>;

/// The monitor task: aggregates counters on a fixed cadence.
pub struct Monitor {
    pipeline: String,
    stages: Vec<(Arc<StageCounters>, Option<DepthProbe>)>,
    total: Option<u64>,
    cadence: Duration,
}

impl Monitor {
    pub fn new(pipeline: impl Into<String>, cadence: Duration) -> Self {
        Self {
            pipeline: pipeline.into(),
            stages: Vec::new(),
            total: None,
            cadence,
        }
    }

    /// Register a stage and, optionally, its input-queue depth probe.
    pub fn register(&mut self, counters: Arc<StageCounters>, depth: Option<DepthProbe>) {
        self.stages.push((counters, depth));
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = Some(total);
    }

    /// Spawn the monitor; it publishes snapshots until cancelled and sends
    /// one final snapshot on the way out.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (watch::Receiver<ProgressSnapshot>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut last_input = 0u64;
            let mut last_cycle = started;

            loop {
                let finished = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(self.cadence) => false,
                };

                let now = std::time::Instant::now();
                let cycle_secs = now.duration_since(last_cycle).as_secs_f64().max(1e-6);

                let mut stages = Vec::with_capacity(self.stages.len());
                for (counters, depth) in &self.stages {
                    // One read per counter per cycle
                    stages.push(StageSnapshot {
                        name: counters.name.clone(),
                        processed: counters.processed.load(Ordering::Relaxed),
                        succeeded: counters.succeeded.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                        skipped: counters.skipped.load(Ordering::Relaxed),
                        rate: 0.0,
                        queue_depth: depth.as_ref().map(|probe| probe()),
                    });
                }

                let input = stages.first().map(|s| s.processed).unwrap_or(0);
                let rate = (input.saturating_sub(last_input)) as f64 / cycle_secs;
                if let Some(first) = stages.first_mut() {
                    first.rate = rate;
                }
                let eta_secs = match (self.total, rate > 0.0) {
                    (Some(total), true) => {
                        Some((total.saturating_sub(input)) as f64 / rate)
                    }
                    _ => None,
                };

                let snapshot = ProgressSnapshot {
                    pipeline: self.pipeline.clone(),
                    stages,
                    total: self.total,
                    eta_secs,
                    elapsed: started.elapsed(),
                };

                info!(
                    pipeline = %snapshot.pipeline,
                    processed = snapshot.input_processed(),
                    failed = snapshot.total_failed(),
                    rate = format!("{:.0}/s", rate),
                    "progress"
                );
                if tx.send(snapshot).is_err() {
                    break; // every receiver gone
                }

                last_input = input;
                last_cycle = now;
                if finished {
                    break;
                }
            }
        });
        (rx, handle)
    }
}

/// Tracks the highest cursor C such that every record with cursor ≤ C has
/// been fully committed downstream.
///
/// The reader registers cursors in read order; any stage that finishes a
/// record (write, skip, or drop) marks it done. The watermark only ever
/// advances, which is exactly the monotone-progress guarantee checkpoints
/// need.
#[derive(Debug, Default)]
pub struct Watermark {
    inner: Mutex<WatermarkInner>,
}

#[derive(Debug, Default)]
struct WatermarkInner {
    /// Registered but not yet done, ascending
    pending: BTreeSet<u64>,
    /// Done but blocked behind a smaller pending cursor
    done_ahead: BTreeSet<u64>,
    committed: u64,
}

impl Watermark {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Note a cursor entering the pipeline.
    pub fn register(&self, cursor: u64) {
        let mut inner = self.inner.lock().expect("watermark lock");
        inner.pending.insert(cursor);
    }

    /// Note a cursor fully committed (written or legitimately dropped).
    pub fn mark_done(&self, cursor: u64) {
        let mut inner = self.inner.lock().expect("watermark lock");
        if !inner.pending.remove(&cursor) {
            return; // unknown or double-done; ignore
        }
        inner.done_ahead.insert(cursor);

        // Advance past any done prefix
        loop {
            let next = match inner.done_ahead.iter().next() {
                Some(&c) => c,
                None => break,
            };
            let blocked = inner.pending.iter().next().is_some_and(|&p| p < next);
            if blocked {
                break;
            }
            inner.done_ahead.remove(&next);
            inner.committed = inner.committed.max(next);
        }
    }

    /// The committed watermark.
    pub fn committed(&self) -> u64 {
        self.inner.lock().expect("watermark lock").committed
    }
}
