//! The canonical enrichment pipeline
//!
//! `EntryReader → Normalizer → EmbeddingCacheLookup → EmbeddingBatcher
//! (single-device stage, unordered-ok) → EntryUpdateWriter (Kw workers)`
//!
//! The reader streams entries out of the typed store; the batcher coalesces
//! texts up to the embedding batch size (flushing on idle) and dispatches
//! them through the cached embedder, so cache lookups and device batching
//! happen in one place. Writers attach vectors back onto entries and,
//! when a vector index is attached, mirror the points into it. Embedding
//! output is unordered relative to input; writers key strictly on entry id.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use etymograph_config::PipelineConfig;
use etymograph_embed::{CacheStats, CachedEmbedder, EmbeddingProvider};
use etymograph_store::{
    Checkpoint, CheckpointStore, EntryFilter, EntryIndex, EntryPoint, EntryStore,
};

use crate::error::{PipelineError, Result};
use crate::message::{stage_channel, StageRx, StageTx};
use crate::progress::{Monitor, ProgressSnapshot, StageCounters, Watermark};
use crate::retry::RetryPolicy;
use crate::stage::{ErrorSink, ItemError};

/// Options for one enrichment run.
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    /// Restrict to one source; `None` enriches every entry
    pub source_id: Option<String>,
    pub db_path: PathBuf,
    pub pipeline: PipelineConfig,
    /// Resume from the persisted checkpoint
    pub resume: bool,
    /// Only entries still lacking an embedding
    pub missing_only: bool,
}

impl EnrichOptions {
    pub fn pipeline_name(&self) -> String {
        match &self.source_id {
            Some(source) => format!("enrich:{}", source),
            None => "enrich:all".to_string(),
        }
    }
}

/// Final accounting of an enrichment run.
#[derive(Debug, Clone, Default)]
pub struct EnrichReport {
    pub pipeline_name: String,
    pub entries_scanned: u64,
    pub embedded: u64,
    pub index_points: u64,
    pub cache: CacheStats,
    pub elapsed: Duration,
    pub checkpoint: Checkpoint,
    pub item_errors: Vec<ItemError>,
}

/// A spawned enrichment pipeline.
pub struct RunningEnrich {
    pub progress: watch::Receiver<ProgressSnapshot>,
    handle: JoinHandle<Result<EnrichReport>>,
    cancel: CancellationToken,
}

impl RunningEnrich {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<EnrichReport> {
        self.handle
            .await
            .map_err(|e| PipelineError::WorkerPanic {
                pipeline: "enrich".to_string(),
                stage: "driver".to_string(),
                message: e.to_string(),
            })?
    }
}

/// Run an enrichment to completion.
pub async fn run_enrich(
    options: EnrichOptions,
    embedder: Arc<CachedEmbedder>,
    index: Option<Arc<EntryIndex>>,
) -> Result<EnrichReport> {
    spawn_enrich(options, embedder, index).join().await
}

/// Spawn the enrichment pipeline.
pub fn spawn_enrich(
    options: EnrichOptions,
    embedder: Arc<CachedEmbedder>,
    index: Option<Arc<EntryIndex>>,
) -> RunningEnrich {
    let cancel = CancellationToken::new();
    let cancel_out = cancel.clone();
    let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot::default());
    let handle = tokio::spawn(enrich_main(options, embedder, index, cancel, progress_tx));
    RunningEnrich {
        progress: progress_rx,
        handle,
        cancel: cancel_out,
    }
}

/// One entry on its way to the embedder.
struct EmbedItem {
    entry_id: String,
    text: String,
    headword: String,
    language_code: String,
    source_id: String,
    cursor: u64,
}

/// One embedded entry on its way to the writers.
struct EmbeddedItem {
    entry_id: String,
    vector: Vec<f32>,
    headword: String,
    language_code: String,
    source_id: String,
    cursor: u64,
}

async fn enrich_main(
    options: EnrichOptions,
    embedder: Arc<CachedEmbedder>,
    index: Option<Arc<EntryIndex>>,
    cancel: CancellationToken,
    progress_forward: watch::Sender<ProgressSnapshot>,
) -> Result<EnrichReport> {
    let started = std::time::Instant::now();
    let pipeline_name = options.pipeline_name();
    let config = &options.pipeline;
    let idle = Duration::from_millis(config.batch_idle_ms);
    let writer_workers = config.writers;
    info!(pipeline = %pipeline_name, "starting enrichment");

    // Resume state
    let start_cursor = {
        let store = CheckpointStore::open(&options.db_path)?;
        if options.resume {
            store
                .load(&pipeline_name)?
                .map(|cp| cp.cursor_for(options.source_id.as_deref().unwrap_or("all")))
                .unwrap_or(0)
        } else {
            0
        }
    };

    let reader_counters = StageCounters::new("entry-reader");
    let embed_counters = StageCounters::new("embedding-batcher");
    let write_counters = StageCounters::new("entry-writer");
    let errors = ErrorSink::new(1024);
    let watermark = Watermark::new();
    let embedded_total = Arc::new(AtomicU64::new(0));
    let index_points = Arc::new(AtomicU64::new(0));

    let (q_embed_tx, q_embed_rx) = stage_channel(config.queue_capacity(config.embed_batch));
    let (q_write_tx, q_write_rx) = stage_channel(config.queue_capacity(config.write_batch));

    // Monitor
    let mut monitor = Monitor::new(&pipeline_name, Duration::from_secs(2));
    monitor.register(reader_counters.clone(), None);
    monitor.register(embed_counters.clone(), Some(q_embed_tx.depth_probe()));
    monitor.register(write_counters.clone(), Some(q_write_tx.depth_probe()));
    let (mut monitor_rx, monitor_handle) = monitor.spawn(cancel.clone());
    let forward_handle = tokio::spawn(async move {
        while monitor_rx.changed().await.is_ok() {
            let snapshot = monitor_rx.borrow().clone();
            if progress_forward.send(snapshot).is_err() {
                break;
            }
        }
    });

    // ---- Entry reader + normalizer (blocking pool) ------------------------
    let reader_handle = {
        let q_embed_tx = q_embed_tx.clone();
        let counters = reader_counters.clone();
        let watermark = watermark.clone();
        let cancel = cancel.clone();
        let db_path = options.db_path.clone();
        let filter = EntryFilter {
            source_id: options.source_id.clone(),
            language_code: None,
            missing_embedding_only: options.missing_only,
        };
        let scan_batch = config.embed_batch.max(256);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let store = EntryStore::open(&db_path)?;
            let mut cursor = start_cursor;
            'scan: loop {
                if cancel.is_cancelled() {
                    break;
                }
                let rows = store.scan_with_cursors(&filter, cursor, scan_batch)?;
                if rows.is_empty() {
                    break;
                }
                cursor = rows.last().map(|(c, _)| *c).unwrap_or(cursor);

                for (row_cursor, entry) in rows {
                    // The embedded text: the gloss, falling back to the
                    // headword for gloss-less wordlist rows.
                    let text = if entry.definition.trim().is_empty() {
                        entry.headword.clone()
                    } else {
                        entry.definition.clone()
                    };
                    counters.add_processed(1);
                    counters.add_succeeded(1);
                    watermark.register(row_cursor);
                    if !q_embed_tx.blocking_send_item(EmbedItem {
                        entry_id: entry.id,
                        text,
                        headword: entry.headword,
                        language_code: entry.language_code,
                        source_id: entry.source_id,
                        cursor: row_cursor,
                    }) {
                        break 'scan;
                    }
                }
            }
            q_embed_tx.blocking_send_eos(1);
            Ok(())
        })
    };

    // ---- Embedding batcher (single-device stage) --------------------------
    let embed_handle = {
        let q_embed_rx: StageRx<EmbedItem> = q_embed_rx;
        let q_write_tx = q_write_tx.clone();
        let counters = embed_counters.clone();
        let errors = errors.clone();
        let cancel = cancel.clone();
        let embedder = embedder.clone();
        let pipeline_name = pipeline_name.clone();
        let embed_batch = config.embed_batch;

        tokio::spawn(async move {
            loop {
                let batch = q_embed_rx.recv_batch(embed_batch, idle, &cancel).await;
                if batch.cancelled {
                    break;
                }
                let saw_eos = batch.saw_eos;

                if !batch.items.is_empty() {
                    let count = batch.items.len();
                    let texts: Vec<String> =
                        batch.items.iter().map(|i| i.text.clone()).collect();

                    match encode_with_shrink(
                        &embedder,
                        texts,
                        &pipeline_name,
                        RetryPolicy::default(),
                    )
                    .await
                    {
                        Ok(vectors) => {
                            counters.add_processed(count as u64);
                            counters.add_succeeded(count as u64);
                            for (item, vector) in batch.items.into_iter().zip(vectors) {
                                let sent = q_write_tx
                                    .send_item(EmbeddedItem {
                                        entry_id: item.entry_id,
                                        vector,
                                        headword: item.headword,
                                        language_code: item.language_code,
                                        source_id: item.source_id,
                                        cursor: item.cursor,
                                    })
                                    .await;
                                if !sent {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => {
                            errors.record("embedding-batcher", e.to_string());
                            return Err(e);
                        }
                    }
                }

                if saw_eos {
                    q_write_tx.send_eos(writer_workers).await;
                    break;
                }
            }
            Ok::<(), PipelineError>(())
        })
    };

    // ---- Entry update writers (Kw workers) --------------------------------
    let mut writer_handles = Vec::with_capacity(writer_workers);
    for worker_id in 0..writer_workers {
        let q_write_rx: StageRx<EmbeddedItem> = q_write_rx.clone();
        let counters = write_counters.clone();
        let watermark = watermark.clone();
        let cancel = cancel.clone();
        let db_path = options.db_path.clone();
        let pipeline_name = pipeline_name.clone();
        let embedded_total = embedded_total.clone();
        let index_points = index_points.clone();
        let index = index.clone();
        let write_batch = config.write_batch;

        writer_handles.push(tokio::spawn(async move {
            let result: Result<()> = async {
                let mut store = Some(EntryStore::open(&db_path)?);
                loop {
                    let batch = q_write_rx.recv_batch(write_batch, idle, &cancel).await;
                    let stop = batch.saw_eos || batch.cancelled;

                    if !batch.items.is_empty() {
                        let written = write_embeddings(
                            &mut store,
                            &index,
                            batch.items,
                            &pipeline_name,
                            &watermark,
                            RetryPolicy::default(),
                        )
                        .await?;
                        counters.add_processed(written.0);
                        counters.add_succeeded(written.0);
                        embedded_total.fetch_add(written.0, Ordering::Relaxed);
                        index_points.fetch_add(written.1, Ordering::Relaxed);
                    }
                    if stop {
                        debug!("entry writer {} done", worker_id);
                        break;
                    }
                }
                Ok(())
            }
            .await;

            // A dead sink must take the pipeline down, not leave the
            // batcher blocked on a queue nobody drains
            if result.is_err() {
                cancel.cancel();
            }
            result
        }));
    }
    // Writers hold their own receiver clones; dropping the original lets a
    // full writer exit close the channel for the batcher
    drop(q_write_rx);

    // ---- Checkpointer -----------------------------------------------------
    let checkpoint_handle = {
        let watermark = watermark.clone();
        let cancel = cancel.clone();
        let db_path = options.db_path.clone();
        let pipeline_name = pipeline_name.clone();
        let cursor_key = options
            .source_id
            .clone()
            .unwrap_or_else(|| "all".to_string());
        let reader_counters = reader_counters.clone();
        let write_counters = write_counters.clone();

        tokio::spawn(async move {
            let mut store = CheckpointStore::open(&db_path)?;
            loop {
                let finished = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => false,
                };
                let mut cp = Checkpoint::new(&pipeline_name);
                cp.at = etymograph_core::now_millis();
                cp.processed = reader_counters.processed.load(Ordering::Relaxed);
                cp.succeeded = write_counters.succeeded.load(Ordering::Relaxed);
                cp.total = cp.processed;
                cp.per_source_cursor
                    .insert(cursor_key.clone(), watermark.committed().max(start_cursor));
                store.save(&cp)?;
                if finished {
                    break;
                }
            }
            Ok::<(), PipelineError>(())
        })
    };

    drop(q_embed_tx);
    drop(q_write_tx);

    // ---- Join -------------------------------------------------------------
    let mut fatal: Option<PipelineError> = None;
    let mut note_fatal = |result: std::result::Result<Result<()>, tokio::task::JoinError>,
                          stage: &str| {
        let outcome = match result {
            Ok(inner) => inner,
            Err(join_err) => Err(PipelineError::WorkerPanic {
                pipeline: "enrich".to_string(),
                stage: stage.to_string(),
                message: join_err.to_string(),
            }),
        };
        if let Err(e) = outcome {
            warn!("stage '{}' finished with error: {}", stage, e);
            if fatal.is_none() {
                fatal = Some(e);
            }
            cancel.cancel();
        }
    };

    note_fatal(reader_handle.await, "entry-reader");
    note_fatal(embed_handle.await, "embedding-batcher");
    for handle in writer_handles {
        note_fatal(handle.await, "entry-writer");
    }

    cancel.cancel();
    note_fatal(checkpoint_handle.await, "checkpointer");
    let _ = monitor_handle.await;
    let _ = forward_handle.await;

    if let Some(e) = fatal {
        return Err(e);
    }

    let checkpoint = {
        let store = CheckpointStore::open(&options.db_path)?;
        store.load(&pipeline_name)?.unwrap_or_default()
    };
    let (item_errors, overflow) = errors.drain();
    if overflow > 0 {
        warn!("{} additional item errors were dropped from the sink", overflow);
    }

    let report = EnrichReport {
        pipeline_name,
        entries_scanned: reader_counters.processed.load(Ordering::Relaxed),
        embedded: embedded_total.load(Ordering::Relaxed),
        index_points: index_points.load(Ordering::Relaxed),
        cache: embedder.stats(),
        elapsed: started.elapsed(),
        checkpoint,
        item_errors,
    };
    info!(
        pipeline = %report.pipeline_name,
        scanned = report.entries_scanned,
        embedded = report.embedded,
        cache_hit_rate = format!("{:.3}", report.cache.hit_rate()),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "enrichment complete"
    );
    Ok(report)
}

/// Encode a batch, falling back to smaller sub-batches on transient
/// failure: full batch with backoff, then halves, then quarters; a single
/// text that still fails transiently exhausts the budget and aborts.
async fn encode_with_shrink(
    embedder: &Arc<CachedEmbedder>,
    texts: Vec<String>,
    pipeline: &str,
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    match try_encode(embedder, &texts, pipeline, policy).await {
        Ok(vectors) => Ok(vectors),
        Err(e) if texts.len() > 1 && matches!(e, PipelineError::RetriesExhausted { .. }) => {
            let half = texts.len() / 2;
            warn!(
                "embedding batch of {} kept failing; splitting into {} + {}",
                texts.len(),
                half,
                texts.len() - half
            );
            let (left, right) = texts.split_at(half);
            let mut vectors =
                Box::pin(encode_with_shrink(embedder, left.to_vec(), pipeline, policy)).await?;
            vectors.extend(
                Box::pin(encode_with_shrink(embedder, right.to_vec(), pipeline, policy)).await?,
            );
            Ok(vectors)
        }
        Err(e) => Err(e),
    }
}

async fn try_encode(
    embedder: &Arc<CachedEmbedder>,
    texts: &[String],
    pipeline: &str,
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut attempt = 0u32;
    loop {
        match embedder.encode(texts.to_vec()).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                warn!(
                    "embedding dispatch failed (attempt {}/{}): {}",
                    attempt + 1,
                    policy.attempts,
                    e
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(PipelineError::RetriesExhausted {
                    pipeline: pipeline.to_string(),
                    stage: "embedding-batcher".to_string(),
                    attempts: policy.attempts,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(PipelineError::Embed(e)),
        }
    }
}

/// Write one batch of embeddings (store update + optional index mirror)
/// with retries, then release the cursors.
async fn write_embeddings(
    store_slot: &mut Option<EntryStore>,
    index: &Option<Arc<EntryIndex>>,
    items: Vec<EmbeddedItem>,
    pipeline: &str,
    watermark: &Arc<Watermark>,
    policy: RetryPolicy,
) -> Result<(u64, u64)> {
    let updates: Vec<(String, Vec<f32>)> = items
        .iter()
        .map(|i| (i.entry_id.clone(), i.vector.clone()))
        .collect();
    let updates = Arc::new(updates);

    let mut attempt = 0u32;
    loop {
        let store = store_slot.take().expect("entry store present");
        let updates_ref = updates.clone();
        let (store, result) = tokio::task::spawn_blocking(move || {
            let mut store = store;
            let result = store.update_embeddings(&updates_ref);
            (store, result)
        })
        .await
        .map_err(|e| PipelineError::WorkerPanic {
            pipeline: pipeline.to_string(),
            stage: "entry-writer".to_string(),
            message: e.to_string(),
        })?;
        *store_slot = Some(store);

        match result {
            Ok(_) => break,
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                warn!(
                    "embedding write failed (attempt {}/{}): {}",
                    attempt + 1,
                    policy.attempts,
                    e
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(PipelineError::RetriesExhausted {
                    pipeline: pipeline.to_string(),
                    stage: "entry-writer".to_string(),
                    attempts: policy.attempts,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(PipelineError::Store(e)),
        }
    }

    // Mirror into the vector index when one is attached; index failures are
    // transient by classification and retried the same way
    let mut points_written = 0u64;
    if let Some(index) = index {
        let points: Vec<EntryPoint> = items
            .iter()
            .map(|i| EntryPoint {
                entry_id: i.entry_id.clone(),
                vector: i.vector.clone(),
                headword: i.headword.clone(),
                language_code: i.language_code.clone(),
                source_id: i.source_id.clone(),
            })
            .collect();
        points_written = points.len() as u64;
        let mut attempt = 0u32;
        loop {
            match index.upsert_points_batched(points.clone(), 512).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                    warn!("index upsert failed (attempt {}): {}", attempt + 1, e);
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(PipelineError::Store(e)),
            }
        }
    }

    for item in &items {
        watermark.mark_done(item.cursor);
    }
    Ok((items.len() as u64, points_written))
}
