//! The Stage abstraction
//!
//! A stage is N identical workers pulling batches from one bounded input
//! queue, processing them, and pushing results to the next queue. Per-item
//! failures are routed to the error sink and the worker continues; a
//! sliding-window error rate above the configured threshold aborts the
//! whole pipeline via the shared cancellation token.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{PipelineError, Result};
use crate::message::{StageRx, StageTx};
use crate::progress::StageCounters;

/// How many queued items a cancelled worker drains before exiting.
const CANCEL_DRAIN_BOUND: usize = 10_000;

/// Whether a stage's work is CPU-bound (dispatch via the blocking pool) or
/// I/O-bound (runs inline on the async worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Cpu,
    Io,
}

/// Per-item outcome of a stage function.
#[derive(Debug)]
pub enum ItemOutcome<T> {
    /// Forward downstream
    Emit(T),
    /// Legitimately dropped (duplicate, filtered); not an error
    Skip,
    /// Per-item failure; routed to the error sink, worker continues
    Failed(String),
}

/// A stage function over batches.
///
/// Batches arrive already accumulated by the runtime (up to the configured
/// size or the idle flush). Implementations return one outcome per input
/// item; order within the batch is preserved by the runtime, order across
/// workers is not.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type In: Send + 'static;
    type Out: Send + 'static;

    fn name(&self) -> &'static str;

    fn kind(&self) -> StageKind {
        StageKind::Io
    }

    async fn process(&self, batch: Vec<Self::In>) -> Vec<ItemOutcome<Self::Out>>;
}

/// One routed per-item error.
#[derive(Debug, Clone)]
pub struct ItemError {
    pub stage: String,
    pub message: String,
}

/// Collects per-item errors, bounded; overflow is counted and logged only.
#[derive(Debug, Default)]
pub struct ErrorSink {
    items: Mutex<Vec<ItemError>>,
    overflow: AtomicU64,
    capacity: usize,
}

impl ErrorSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            overflow: AtomicU64::new(0),
            capacity,
        })
    }

    pub fn record(&self, stage: &str, message: impl Into<String>) {
        let message = message.into();
        debug!("item error in stage '{}': {}", stage, message);
        let mut items = self.items.lock().expect("error sink lock");
        if items.len() < self.capacity {
            items.push(ItemError {
                stage: stage.to_string(),
                message,
            });
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn drain(&self) -> (Vec<ItemError>, u64) {
        let mut items = self.items.lock().expect("error sink lock");
        (
            std::mem::take(&mut *items),
            self.overflow.swap(0, Ordering::Relaxed),
        )
    }

    pub fn count(&self) -> usize {
        self.items.lock().expect("error sink lock").len()
            + self.overflow.load(Ordering::Relaxed) as usize
    }
}

/// Sliding-window error-rate tripwire.
///
/// Records a pass/fail bit per item; once the window is full and the
/// failure fraction exceeds the threshold, the stage aborts the pipeline.
#[derive(Debug)]
pub struct ErrorWindow {
    window: Mutex<VecDeque<bool>>,
    capacity: usize,
    max_rate: f64,
}

impl ErrorWindow {
    pub fn new(capacity: usize, max_rate: f64) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            max_rate,
        }
    }

    /// Record one item; returns the tripped rate if the threshold is
    /// exceeded.
    pub fn record(&self, failed: bool) -> Option<f64> {
        let mut window = self.window.lock().expect("error window lock");
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(failed);
        if window.len() < self.capacity {
            return None;
        }
        let failures = window.iter().filter(|&&f| f).count();
        let rate = failures as f64 / window.len() as f64;
        (rate > self.max_rate).then_some(rate)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Runtime configuration for one stage.
pub struct StageConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub idle_flush: Duration,
    /// Worker count of the next stage (how many sentinels to emit)
    pub downstream_consumers: usize,
}

/// Everything a spawned stage shares with the rest of the pipeline.
pub struct StageContext {
    pub pipeline: String,
    pub counters: Arc<StageCounters>,
    pub errors: Arc<ErrorSink>,
    pub error_window: Arc<ErrorWindow>,
    pub cancel: CancellationToken,
}

/// Spawn a stage's workers.
///
/// The last worker to exit emits the end-of-stream sentinels downstream,
/// one per downstream consumer, after all of the stage's real output.
pub fn spawn_stage<S: Stage>(
    stage: Arc<S>,
    config: StageConfig,
    input: StageRx<S::In>,
    output: StageTx<S::Out>,
    context: Arc<StageContext>,
) -> Vec<JoinHandle<Result<()>>> {
    let live_workers = Arc::new(AtomicUsize::new(config.workers));
    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        let stage = stage.clone();
        let input = input.clone();
        let output = output.clone();
        let context = context.clone();
        let live_workers = live_workers.clone();
        let batch_size = config.batch_size;
        let idle_flush = config.idle_flush;
        let downstream = config.downstream_consumers;

        handles.push(tokio::spawn(async move {
            let result = run_worker(
                &*stage,
                worker_id,
                batch_size,
                idle_flush,
                &input,
                &output,
                &context,
            )
            .await;

            if let Err(ref e) = result {
                error!(
                    "stage '{}' worker {} failed: {}",
                    stage.name(),
                    worker_id,
                    e
                );
                context.cancel.cancel();
            }
            // Last one out propagates end-of-stream (unless aborting)
            if live_workers.fetch_sub(1, Ordering::AcqRel) == 1
                && !context.cancel.is_cancelled()
            {
                output.send_eos(downstream).await;
            }
            result
        }));
    }
    handles
}

async fn run_worker<S: Stage>(
    stage: &S,
    worker_id: usize,
    batch_size: usize,
    idle_flush: Duration,
    input: &StageRx<S::In>,
    output: &StageTx<S::Out>,
    context: &StageContext,
) -> Result<()> {
    loop {
        let batch = input.recv_batch(batch_size, idle_flush, &context.cancel).await;
        if batch.cancelled {
            let drained = input.drain(CANCEL_DRAIN_BOUND).await;
            debug!(
                "stage '{}' worker {} cancelled, drained {} queued items",
                stage.name(),
                worker_id,
                drained
            );
            return Ok(());
        }
        let saw_eos = batch.saw_eos;

        if !batch.items.is_empty() {
            let count = batch.items.len();
            let outcomes = stage.process(batch.items).await;
            debug_assert_eq!(outcomes.len(), count, "stage must produce one outcome per item");

            context.counters.add_processed(count as u64);
            for outcome in outcomes {
                let failed = matches!(outcome, ItemOutcome::Failed(_));
                match outcome {
                    ItemOutcome::Emit(item) => {
                        context.counters.add_succeeded(1);
                        if !output.send_item(item).await {
                            // Downstream gone; nothing more to do
                            return Ok(());
                        }
                    }
                    ItemOutcome::Skip => context.counters.add_skipped(1),
                    ItemOutcome::Failed(message) => {
                        context.counters.add_failed(1);
                        context.errors.record(stage.name(), message);
                    }
                }

                if let Some(rate) = context.error_window.record(failed) {
                    warn!(
                        "stage '{}' error rate {:.2} tripped the abort threshold",
                        stage.name(),
                        rate
                    );
                    return Err(PipelineError::ErrorRateExceeded {
                        pipeline: context.pipeline.clone(),
                        stage: stage.name().to_string(),
                        rate,
                        window: context.error_window.capacity(),
                    });
                }
            }
        }

        if saw_eos {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::stage_channel;

    /// Doubles numbers; fails on odd multiples of 5, skips negatives.
    struct Doubler;

    #[async_trait]
    impl Stage for Doubler {
        type In = i64;
        type Out = i64;

        fn name(&self) -> &'static str {
            "doubler"
        }

        fn kind(&self) -> StageKind {
            StageKind::Cpu
        }

        async fn process(&self, batch: Vec<i64>) -> Vec<ItemOutcome<i64>> {
            batch
                .into_iter()
                .map(|n| {
                    if n < 0 {
                        ItemOutcome::Skip
                    } else if n % 5 == 0 && n % 2 == 1 {
                        ItemOutcome::Failed(format!("odd multiple of five: {}", n))
                    } else {
                        ItemOutcome::Emit(n * 2)
                    }
                })
                .collect()
        }
    }

    fn context(max_rate: f64, window: usize) -> Arc<StageContext> {
        Arc::new(StageContext {
            pipeline: "test".to_string(),
            counters: StageCounters::new("doubler"),
            errors: ErrorSink::new(100),
            error_window: Arc::new(ErrorWindow::new(window, max_rate)),
            cancel: CancellationToken::new(),
        })
    }

    async fn collect_until_eos(rx: &StageRx<i64>, cancel: &CancellationToken) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            let batch = rx.recv_batch(64, Duration::from_millis(20), cancel).await;
            out.extend(batch.items);
            if batch.saw_eos || batch.cancelled {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn test_stage_processes_and_propagates_eos() {
        let (in_tx, in_rx) = stage_channel::<i64>(32);
        let (out_tx, out_rx) = stage_channel::<i64>(32);
        let ctx = context(0.9, 100);

        let handles = spawn_stage(
            Arc::new(Doubler),
            StageConfig {
                workers: 2,
                batch_size: 4,
                idle_flush: Duration::from_millis(10),
                downstream_consumers: 1,
            },
            in_rx,
            out_tx,
            ctx.clone(),
        );

        for n in [1i64, 2, 3, -1, 4] {
            in_tx.send_item(n).await;
        }
        in_tx.send_eos(2).await;

        let mut out = collect_until_eos(&out_rx, &ctx.cancel).await;
        out.sort();
        assert_eq!(out, vec![2, 4, 6, 8]);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ctx.counters.skipped.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.counters.succeeded.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_per_item_failure_does_not_stop_worker() {
        let (in_tx, in_rx) = stage_channel::<i64>(32);
        let (out_tx, out_rx) = stage_channel::<i64>(32);
        let ctx = context(0.9, 100);

        let handles = spawn_stage(
            Arc::new(Doubler),
            StageConfig {
                workers: 1,
                batch_size: 8,
                idle_flush: Duration::from_millis(10),
                downstream_consumers: 1,
            },
            in_rx,
            out_tx,
            ctx.clone(),
        );

        // 5 and 15 fail; 2 and 4 pass
        for n in [5i64, 2, 15, 4] {
            in_tx.send_item(n).await;
        }
        in_tx.send_eos(1).await;

        let mut out = collect_until_eos(&out_rx, &ctx.cancel).await;
        out.sort();
        assert_eq!(out, vec![4, 8]);
        assert_eq!(ctx.errors.count(), 2);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_error_rate_aborts_pipeline() {
        let (in_tx, in_rx) = stage_channel::<i64>(64);
        let (out_tx, _out_rx) = stage_channel::<i64>(64);
        // Window of 4, abort above 50%
        let ctx = context(0.5, 4);

        let handles = spawn_stage(
            Arc::new(Doubler),
            StageConfig {
                workers: 1,
                batch_size: 16,
                idle_flush: Duration::from_millis(10),
                downstream_consumers: 1,
            },
            in_rx,
            out_tx,
            ctx.clone(),
        );

        // All failures: odd multiples of five
        for n in [5i64, 15, 25, 35, 45] {
            in_tx.send_item(n).await;
        }
        in_tx.send_eos(1).await;

        let mut saw_abort = false;
        for handle in handles {
            if let Err(PipelineError::ErrorRateExceeded { rate, .. }) = handle.await.unwrap() {
                assert!(rate > 0.5);
                saw_abort = true;
            }
        }
        assert!(saw_abort, "error rate must abort the stage");
        assert!(ctx.cancel.is_cancelled(), "abort must cancel the pipeline");
    }

    #[test]
    fn test_error_window_needs_full_window() {
        let window = ErrorWindow::new(4, 0.5);
        assert!(window.record(true).is_none());
        assert!(window.record(true).is_none());
        assert!(window.record(true).is_none());
        // Fourth item fills the window: 4/4 failures
        let rate = window.record(true).unwrap();
        assert!((rate - 1.0).abs() < 1e-9);
    }
}
