//! Bounded inter-stage channels
//!
//! Stages communicate through bounded mpsc queues carrying [`Envelope`]s.
//! Backpressure is the channel bound itself: a full queue suspends the
//! producer, an empty one suspends the consumer. End-of-stream is an
//! explicit sentinel delivered once per downstream worker, enqueued after
//! every real item, so property "sentinel after all items" holds by
//! construction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A queue message: a real item or the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<T> {
    Item(T),
    Eos,
}

/// Sending half of a bounded stage queue.
pub struct StageTx<T> {
    tx: mpsc::Sender<Envelope<T>>,
}

impl<T> Clone for StageTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Receiving half, shared by all workers of the consuming stage.
///
/// tokio's mpsc receiver is single-consumer; workers take turns under an
/// async mutex. The lock is held only while accumulating one batch, which
/// only ever waits when the queue is empty, i.e. when the other workers
/// would find nothing to pull anyway.
pub struct StageRx<T> {
    rx: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>,
}

impl<T> Clone for StageRx<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// One accumulated input batch.
#[derive(Debug)]
pub struct BatchRecv<T> {
    pub items: Vec<T>,
    /// This worker consumed its end-of-stream sentinel
    pub saw_eos: bool,
    /// Cancellation fired while waiting
    pub cancelled: bool,
}

/// Create a bounded stage queue.
pub fn stage_channel<T>(capacity: usize) -> (StageTx<T>, StageRx<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StageTx { tx },
        StageRx {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl<T: Send + 'static> StageTx<T> {
    /// Enqueue one item, suspending while the queue is full.
    ///
    /// Returns `false` when every consumer is gone (the pipeline is
    /// shutting down); producers treat that as end-of-output.
    pub async fn send_item(&self, item: T) -> bool {
        self.tx.send(Envelope::Item(item)).await.is_ok()
    }

    /// Enqueue the end-of-stream sentinel, one per downstream worker.
    ///
    /// Must be called exactly once, after the last real item.
    pub async fn send_eos(&self, consumers: usize) {
        for _ in 0..consumers {
            if self.tx.send(Envelope::Eos).await.is_err() {
                return;
            }
        }
    }

    /// Blocking variant of [`StageTx::send_item`] for producers that run on
    /// the blocking pool (file readers, store scanners).
    pub fn blocking_send_item(&self, item: T) -> bool {
        self.tx.blocking_send(Envelope::Item(item)).is_ok()
    }

    /// Blocking variant of [`StageTx::send_eos`].
    pub fn blocking_send_eos(&self, consumers: usize) {
        for _ in 0..consumers {
            if self.tx.blocking_send(Envelope::Eos).is_err() {
                return;
            }
        }
    }

    /// Items currently queued (monitoring only).
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// A type-erased depth probe for the progress monitor.
    pub fn depth_probe(&self) -> Box<dyn Fn() -> usize + Send + Sync> {
        let tx = self.tx.clone();
        Box::new(move || tx.max_capacity() - tx.capacity())
    }
}

impl<T: Send> StageRx<T> {
    /// Accumulate up to `max_items`, flushing early on an idle timeout or
    /// end-of-stream. Partial batches flush; empty idle periods keep
    /// waiting (subject to cancellation).
    pub async fn recv_batch(
        &self,
        max_items: usize,
        idle: Duration,
        cancel: &CancellationToken,
    ) -> BatchRecv<T> {
        let mut items = Vec::with_capacity(max_items.min(4096));
        let mut rx = self.rx.lock().await;

        loop {
            if cancel.is_cancelled() {
                return BatchRecv {
                    items,
                    saw_eos: false,
                    cancelled: true,
                };
            }
            if items.len() >= max_items {
                return BatchRecv {
                    items,
                    saw_eos: false,
                    cancelled: false,
                };
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return BatchRecv { items, saw_eos: false, cancelled: true };
                }
                received = tokio::time::timeout(idle, rx.recv()) => received,
            };

            match next {
                // Idle timeout
                Err(_) => {
                    if !items.is_empty() {
                        return BatchRecv {
                            items,
                            saw_eos: false,
                            cancelled: false,
                        };
                    }
                    // Nothing buffered; keep waiting
                }
                // Channel closed: all producers dropped without sentinels
                // (producer-side failure); treat as end-of-stream.
                Ok(None) => {
                    return BatchRecv {
                        items,
                        saw_eos: true,
                        cancelled: false,
                    };
                }
                Ok(Some(Envelope::Eos)) => {
                    return BatchRecv {
                        items,
                        saw_eos: true,
                        cancelled: false,
                    };
                }
                Ok(Some(Envelope::Item(item))) => items.push(item),
            }
        }
    }

    /// Drain up to `bound` queued items without waiting (cancellation
    /// cleanup).
    pub async fn drain(&self, bound: usize) -> usize {
        let mut rx = self.rx.lock().await;
        let mut drained = 0usize;
        while drained < bound {
            match rx.try_recv() {
                Ok(_) => drained += 1,
                Err(_) => break,
            }
        }
        drained
    }
}
