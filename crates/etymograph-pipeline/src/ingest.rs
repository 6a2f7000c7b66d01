//! The canonical ingestion pipeline
//!
//! `FileReader → BulkRawWriter → RawScanner → CleanerBatch (Nc workers) →
//! ValidatorFilter → TypedBulkWriter (Kw workers)`
//!
//! The file reader streams raw records into the raw store in bulk batches;
//! the scanner side of the raw writer forwards stored rows (with their
//! cursors) into the cleaning stages; typed writers bulk-upsert entries and
//! transform logs. A committed-cursor watermark feeds periodic checkpoints,
//! and every write keys on deterministic ids, so replay after a crash
//! converges on the same final state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use etymograph_config::PipelineConfig;
use etymograph_core::{
    loader_for, CleanerPipeline, Entry, EntryDraft, ErrorKind, LoaderFormat, TransformLog,
    Validator,
};
use etymograph_store::{
    Checkpoint, CheckpointStore, EntryStore, RawStore, StoredRaw, TransformLogStore,
};

use crate::error::{PipelineError, Result};
use crate::message::{stage_channel, StageRx, StageTx};
use crate::progress::{Monitor, ProgressSnapshot, StageCounters, Watermark};
use crate::retry::RetryPolicy;
use crate::stage::{
    spawn_stage, ErrorSink, ErrorWindow, ItemError, ItemOutcome, Stage, StageConfig,
    StageContext, StageKind,
};

/// Options for one ingest run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub source_id: String,
    pub file: PathBuf,
    pub format: LoaderFormat,
    /// SQLite database holding the raw and typed stores
    pub db_path: PathBuf,
    pub pipeline: PipelineConfig,
    /// Short-circuit cleaning on the first failed validation
    pub strict: bool,
    /// Resume from the persisted checkpoint
    pub resume: bool,
    /// Monotone pipeline sequence number stamped onto entries
    pub pipeline_seq: u64,
}

impl IngestOptions {
    pub fn pipeline_name(&self) -> String {
        format!("ingest:{}", self.source_id)
    }
}

/// Final accounting of an ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub pipeline_name: String,
    pub records_read: u64,
    pub parse_errors: u64,
    pub raw_inserted: u64,
    pub raw_deduplicated: u64,
    pub entries_written: u64,
    pub invalid: u64,
    pub elapsed: Duration,
    pub checkpoint: Checkpoint,
    pub item_errors: Vec<ItemError>,
}

/// A spawned pipeline: watch progress, then join for the report.
pub struct RunningIngest {
    pub progress: watch::Receiver<ProgressSnapshot>,
    handle: JoinHandle<Result<IngestReport>>,
    cancel: CancellationToken,
}

impl RunningIngest {
    /// Cooperative cancellation: stages drain and sinks flush.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<IngestReport> {
        self.handle
            .await
            .map_err(|e| PipelineError::WorkerPanic {
                pipeline: "ingest".to_string(),
                stage: "driver".to_string(),
                message: e.to_string(),
            })?
    }
}

/// Run an ingest to completion.
pub async fn run_ingest(options: IngestOptions) -> Result<IngestReport> {
    spawn_ingest(options)?.join().await
}

/// Spawn an ingest pipeline; fatal setup errors surface immediately.
pub fn spawn_ingest(options: IngestOptions) -> Result<RunningIngest> {
    // Open the loader eagerly so a missing file fails before any task spawns
    let loader = loader_for(options.format);
    let record_iter = loader.load(&options.file, &options.source_id)?;

    let cancel = CancellationToken::new();
    let cancel_out = cancel.clone();

    let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot::default());
    let handle = tokio::spawn(ingest_main(options, record_iter, cancel, progress_tx));

    Ok(RunningIngest {
        progress: progress_rx,
        handle,
        cancel: cancel_out,
    })
}

// ============================================================================
// Stage payloads
// ============================================================================

/// Cleaner output: the cleaned draft plus its transform history.
struct CleanedDraft {
    draft: EntryDraft,
    log: TransformLog,
    /// Soft validation notes accumulated during cleaning
    soft_errors: Vec<String>,
    /// Strict mode rejected the record; log still persists
    dropped: bool,
    cursor: u64,
}

/// Validator output, ready for the typed writer.
struct TypedItem {
    /// `None` when the record was rejected; the log is still written
    entry: Option<Entry>,
    log: TransformLog,
    cursor: u64,
}

// ============================================================================
// Cleaner stage
// ============================================================================

struct CleanerStage {
    inner: Arc<CleanerCore>,
}

struct CleanerCore {
    pipeline: CleanerPipeline,
    strict: bool,
    watermark: Arc<Watermark>,
}

#[async_trait::async_trait]
impl Stage for CleanerStage {
    type In = StoredRaw;
    type Out = CleanedDraft;

    fn name(&self) -> &'static str {
        "cleaner"
    }

    fn kind(&self) -> StageKind {
        StageKind::Cpu
    }

    async fn process(&self, batch: Vec<StoredRaw>) -> Vec<ItemOutcome<CleanedDraft>> {
        let core = self.inner.clone();
        // NFC, regex and hashing are pure CPU; keep them off the reactor
        tokio::task::spawn_blocking(move || {
            batch
                .into_iter()
                .map(|stored| clean_one(&core, stored))
                .collect()
        })
        .await
        .unwrap_or_else(|e| {
            vec![ItemOutcome::Failed(format!(
                "cleaner batch panicked: {}",
                e
            ))]
        })
    }
}

fn clean_one(core: &CleanerCore, stored: StoredRaw) -> ItemOutcome<CleanedDraft> {
    let record = &stored.record;
    let draft =
        match EntryDraft::from_payload(&record.payload, &record.checksum, &record.source_id) {
            Ok(draft) => draft,
            Err(e) => {
                // Hard-invalid: nothing downstream will ever commit this
                // cursor, so release it here
                core.watermark.mark_done(stored.cursor);
                return ItemOutcome::Failed(format!("{} ({})", e, record.origin));
            }
        };

    let outcome = core.pipeline.apply(draft);
    let mut soft_errors = Vec::new();
    let mut dropped = false;
    if let Some(step) = &outcome.failed_step {
        if core.strict {
            dropped = true;
        } else {
            soft_errors.push(format!("cleaner '{}' validation failed", step));
        }
    }

    ItemOutcome::Emit(CleanedDraft {
        draft: outcome.draft,
        log: TransformLog {
            raw_ref: record.checksum.clone(),
            steps: outcome.steps,
        },
        soft_errors,
        dropped,
        cursor: stored.cursor,
    })
}

// ============================================================================
// Validator stage
// ============================================================================

struct ValidatorStage {
    validator: Validator,
    fingerprint: String,
    pipeline_seq: u64,
}

#[async_trait::async_trait]
impl Stage for ValidatorStage {
    type In = CleanedDraft;
    type Out = TypedItem;

    fn name(&self) -> &'static str {
        "validator"
    }

    async fn process(&self, batch: Vec<CleanedDraft>) -> Vec<ItemOutcome<TypedItem>> {
        batch
            .into_iter()
            .map(|cleaned| {
                if cleaned.dropped {
                    return ItemOutcome::Emit(TypedItem {
                        entry: None,
                        log: cleaned.log,
                        cursor: cleaned.cursor,
                    });
                }

                let verdict = self.validator.check(&cleaned.draft);
                // Missing required fields are hard failures; everything else
                // is recorded on the entry and kept
                let hard_invalid = !verdict.ok
                    && verdict
                        .errors
                        .iter()
                        .any(|e| e.contains("required field"));

                if hard_invalid {
                    return ItemOutcome::Emit(TypedItem {
                        entry: None,
                        log: cleaned.log,
                        cursor: cleaned.cursor,
                    });
                }

                let mut errors = cleaned.soft_errors;
                errors.extend(verdict.errors);
                let entry = Entry::from_draft(
                    cleaned.draft,
                    self.fingerprint.clone(),
                    self.pipeline_seq,
                    errors,
                );
                ItemOutcome::Emit(TypedItem {
                    entry: Some(entry),
                    log: cleaned.log,
                    cursor: cleaned.cursor,
                })
            })
            .collect()
    }
}

// ============================================================================
// Driver
// ============================================================================

async fn ingest_main(
    options: IngestOptions,
    record_iter: etymograph_core::RecordIter,
    cancel: CancellationToken,
    progress_forward: watch::Sender<ProgressSnapshot>,
) -> Result<IngestReport> {
    let started = std::time::Instant::now();
    let pipeline_name = options.pipeline_name();
    let config = &options.pipeline;
    info!(
        pipeline = %pipeline_name,
        file = %options.file.display(),
        format = %options.format,
        "starting ingest"
    );

    let cleaner_workers = config.effective_cleaner_workers();
    let writer_workers = config.writers;
    let idle = Duration::from_millis(config.batch_idle_ms);

    // Resume state
    let mut checkpoint = {
        let store = CheckpointStore::open(&options.db_path)?;
        if options.resume {
            store
                .load(&pipeline_name)?
                .unwrap_or_else(|| Checkpoint::new(&pipeline_name))
        } else {
            Checkpoint::new(&pipeline_name)
        }
    };
    let start_cursor = checkpoint.cursor_for(&options.source_id);
    if start_cursor > 0 {
        info!(
            pipeline = %pipeline_name,
            cursor = start_cursor,
            "resuming after committed cursor"
        );
    }

    // Shared accounting
    let reader_counters = StageCounters::new("file-reader");
    let raw_counters = StageCounters::new("raw-writer");
    let clean_counters = StageCounters::new("cleaner");
    let validate_counters = StageCounters::new("validator");
    let write_counters = StageCounters::new("typed-writer");
    let errors = ErrorSink::new(1024);
    let watermark = Watermark::new();
    let raw_inserted = Arc::new(AtomicU64::new(0));
    let raw_deduplicated = Arc::new(AtomicU64::new(0));
    let entries_written = Arc::new(AtomicU64::new(0));
    let invalid_dropped = Arc::new(AtomicU64::new(0));

    // Bounded channels; capacity 2× the feeding batch
    let (q_raw_tx, q_raw_rx) = stage_channel(config.queue_capacity(config.raw_write_batch));
    let (q_clean_tx, q_clean_rx) = stage_channel(config.queue_capacity(config.clean_batch));
    let (q_valid_tx, q_valid_rx) = stage_channel(config.queue_capacity(config.clean_batch));
    let (q_write_tx, q_write_rx) = stage_channel(config.queue_capacity(config.raw_write_batch));

    // Monitor
    let mut monitor = Monitor::new(&pipeline_name, Duration::from_secs(2));
    monitor.register(reader_counters.clone(), None);
    monitor.register(raw_counters.clone(), Some(q_raw_tx.depth_probe()));
    monitor.register(clean_counters.clone(), Some(q_clean_tx.depth_probe()));
    monitor.register(validate_counters.clone(), Some(q_valid_tx.depth_probe()));
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

    // ---- Stage 1: file reader (blocking pool) -----------------------------
    let reader_handle = {
        let q_raw_tx = q_raw_tx.clone();
        let counters = reader_counters.clone();
        let errors = errors.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for item in record_iter {
                if cancel.is_cancelled() {
                    break;
                }
                match item {
                    Ok(record) => {
                        counters.add_processed(1);
                        counters.add_succeeded(1);
                        if !q_raw_tx.blocking_send_item(record) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Fatal => {
                        return Err(PipelineError::Core(e));
                    }
                    Err(e) => {
                        counters.add_processed(1);
                        counters.add_failed(1);
                        errors.record("file-reader", e.to_string());
                    }
                }
            }
            q_raw_tx.blocking_send_eos(1);
            Ok(())
        })
    };

    // ---- Stage 2: bulk raw writer + scanner (1 worker) --------------------
    let raw_handle = {
        let q_raw_rx: StageRx<etymograph_core::RawRecord> = q_raw_rx;
        let q_clean_tx = q_clean_tx.clone();
        let counters = raw_counters.clone();
        let watermark = watermark.clone();
        let cancel = cancel.clone();
        let db_path = options.db_path.clone();
        let source_id = options.source_id.clone();
        let pipeline_name = pipeline_name.clone();
        let raw_inserted = raw_inserted.clone();
        let raw_deduplicated = raw_deduplicated.clone();
        let raw_write_batch = config.raw_write_batch;
        let clean_workers = cleaner_workers;

        tokio::spawn(async move {
            let mut store = Some(RawStore::open(&db_path)?);
            let mut scan_cursor = start_cursor;

            loop {
                let batch = q_raw_rx.recv_batch(raw_write_batch, idle, &cancel).await;
                if batch.cancelled {
                    break;
                }
                let saw_eos = batch.saw_eos;

                if !batch.items.is_empty() {
                    let count = batch.items.len();
                    let stats = write_raw_batch(
                        &mut store,
                        batch.items,
                        &pipeline_name,
                        RetryPolicy::default(),
                    )
                    .await?;
                    counters.add_processed(count as u64);
                    counters.add_succeeded(stats.inserted as u64);
                    counters.add_skipped(stats.deduplicated as u64);
                    raw_inserted.fetch_add(stats.inserted as u64, Ordering::Relaxed);
                    raw_deduplicated.fetch_add(stats.deduplicated as u64, Ordering::Relaxed);
                }

                // Forward everything newly visible past the cursor
                scan_cursor = forward_scanned(
                    &mut store,
                    &source_id,
                    scan_cursor,
                    raw_write_batch,
                    &watermark,
                    &q_clean_tx,
                )
                .await?;

                if saw_eos {
                    // Final sweep then end-of-stream to every cleaner
                    scan_cursor = forward_scanned(
                        &mut store,
                        &source_id,
                        scan_cursor,
                        raw_write_batch,
                        &watermark,
                        &q_clean_tx,
                    )
                    .await?;
                    debug!("raw scanner done at cursor {}", scan_cursor);
                    q_clean_tx.send_eos(clean_workers).await;
                    break;
                }
            }
            Ok::<(), PipelineError>(())
        })
    };

    // ---- Stage 3: cleaner batch (Nc workers) ------------------------------
    let cleaner_pipeline = CleanerPipeline::standard(options.pipeline_seq)
        .with_strict(options.strict);
    let fingerprint = cleaner_pipeline.fingerprint();

    let clean_context = Arc::new(StageContext {
        pipeline: pipeline_name.clone(),
        counters: clean_counters.clone(),
        errors: errors.clone(),
        error_window: Arc::new(ErrorWindow::new(1000, config.max_error_rate)),
        cancel: cancel.clone(),
    });
    let clean_handles = spawn_stage(
        Arc::new(CleanerStage {
            inner: Arc::new(CleanerCore {
                pipeline: cleaner_pipeline,
                strict: options.strict,
                watermark: watermark.clone(),
            }),
        }),
        StageConfig {
            workers: cleaner_workers,
            batch_size: config.clean_batch,
            idle_flush: idle,
            downstream_consumers: 1,
        },
        q_clean_rx,
        q_valid_tx.clone(),
        clean_context,
    );

    // ---- Stage 4: validator filter (1 worker) -----------------------------
    let validate_context = Arc::new(StageContext {
        pipeline: pipeline_name.clone(),
        counters: validate_counters.clone(),
        errors: errors.clone(),
        error_window: Arc::new(ErrorWindow::new(1000, config.max_error_rate)),
        cancel: cancel.clone(),
    });
    let validate_handles = spawn_stage(
        Arc::new(ValidatorStage {
            validator: Validator::standard(),
            fingerprint,
            pipeline_seq: options.pipeline_seq,
        }),
        StageConfig {
            workers: 1,
            batch_size: config.clean_batch,
            idle_flush: idle,
            downstream_consumers: writer_workers,
        },
        q_valid_rx,
        q_write_tx.clone(),
        validate_context,
    );

    // ---- Stage 5: typed bulk writers (Kw workers) -------------------------
    let mut writer_handles = Vec::with_capacity(writer_workers);
    for worker_id in 0..writer_workers {
        let q_write_rx: StageRx<TypedItem> = q_write_rx.clone();
        let counters = write_counters.clone();
        let watermark = watermark.clone();
        let cancel = cancel.clone();
        let db_path = options.db_path.clone();
        let pipeline_name = pipeline_name.clone();
        let entries_written = entries_written.clone();
        let invalid_dropped = invalid_dropped.clone();
        let write_batch = config.write_batch;

        writer_handles.push(tokio::spawn(async move {
            let result: Result<()> = async {
                let mut entry_store = Some(EntryStore::open(&db_path)?);
                let mut log_store = Some(TransformLogStore::open(&db_path)?);

                loop {
                    let batch = q_write_rx.recv_batch(write_batch, idle, &cancel).await;
                    // In-flight batches flush even on cancellation
                    let stop = batch.saw_eos || batch.cancelled;

                    if !batch.items.is_empty() {
                        let written = write_typed_batch(
                            &mut entry_store,
                            &mut log_store,
                            batch.items,
                            &pipeline_name,
                            &counters,
                            &watermark,
                            RetryPolicy::default(),
                        )
                        .await?;
                        entries_written.fetch_add(written.0, Ordering::Relaxed);
                        invalid_dropped.fetch_add(written.1, Ordering::Relaxed);
                    }
                    if stop {
                        debug!("typed writer {} draining done", worker_id);
                        break;
                    }
                }
                Ok(())
            }
            .await;

            // A dead sink must take the pipeline down, not leave the
            // upstream blocked on a queue nobody drains
            if result.is_err() {
                cancel.cancel();
            }
            result
        }));
    }
    // Writers hold their own receiver clones; dropping the original lets a
    // full writer exit close the channel for the validator
    drop(q_write_rx);

    // ---- Checkpointer -----------------------------------------------------
    let checkpoint_handle = {
        let watermark = watermark.clone();
        let cancel = cancel.clone();
        let db_path = options.db_path.clone();
        let pipeline_name = pipeline_name.clone();
        let source_id = options.source_id.clone();
        let clean_counters = clean_counters.clone();
        let write_counters = write_counters.clone();
        let interval = Duration::from_millis(500);
        let min_advance = config.checkpoint_interval as u64;

        tokio::spawn(async move {
            let mut store = CheckpointStore::open(&db_path)?;
            let mut last_saved_cursor = start_cursor;
            loop {
                let finished = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(interval) => false,
                };
                let committed = watermark.committed().max(start_cursor);
                if finished || committed >= last_saved_cursor + min_advance.max(1) {
                    let cp = checkpoint_from_counters(
                        &pipeline_name,
                        &source_id,
                        committed,
                        &clean_counters,
                        &write_counters,
                    );
                    store.save(&cp)?;
                    last_saved_cursor = committed;
                    debug!(cursor = committed, "checkpoint saved");
                }
                if finished {
                    break;
                }
            }
            Ok::<(), PipelineError>(())
        })
    };

    // Drop the driver's own sender clones so consumers see channel close on
    // producer failure rather than hanging
    drop(q_raw_tx);
    drop(q_clean_tx);
    drop(q_valid_tx);
    drop(q_write_tx);

    // ---- Join everything --------------------------------------------------
    let mut fatal: Option<PipelineError> = None;
    let mut note_fatal = |result: std::result::Result<Result<()>, tokio::task::JoinError>,
                          stage: &str| {
        let outcome = match result {
            Ok(inner) => inner,
            Err(join_err) => Err(PipelineError::WorkerPanic {
                pipeline: "ingest".to_string(),
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

    note_fatal(reader_handle.await, "file-reader");
    note_fatal(raw_handle.await, "raw-writer");
    for handle in clean_handles {
        note_fatal(handle.await, "cleaner");
    }
    for handle in validate_handles {
        note_fatal(handle.await, "validator");
    }
    for handle in writer_handles {
        note_fatal(handle.await, "typed-writer");
    }

    // Stop monitor and checkpointer; both write a final state on the way out
    cancel.cancel();
    note_fatal(checkpoint_handle.await, "checkpointer");
    let _ = monitor_handle.await;
    let _ = forward_handle.await;

    if let Some(e) = fatal {
        // A final checkpoint was written above; surface the abort
        return Err(e);
    }

    // Final checkpoint reflects the completed run
    checkpoint = checkpoint_from_counters(
        &pipeline_name,
        &options.source_id,
        watermark.committed().max(start_cursor),
        &clean_counters,
        &write_counters,
    );
    {
        let mut store = CheckpointStore::open(&options.db_path)?;
        store.save(&checkpoint)?;
    }

    let (item_errors, overflow) = errors.drain();
    if overflow > 0 {
        warn!("{} additional item errors were dropped from the sink", overflow);
    }

    let report = IngestReport {
        pipeline_name,
        records_read: reader_counters.processed.load(Ordering::Relaxed),
        parse_errors: reader_counters.failed.load(Ordering::Relaxed),
        raw_inserted: raw_inserted.load(Ordering::Relaxed),
        raw_deduplicated: raw_deduplicated.load(Ordering::Relaxed),
        entries_written: entries_written.load(Ordering::Relaxed),
        invalid: clean_counters.failed.load(Ordering::Relaxed)
            + invalid_dropped.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
        checkpoint,
        item_errors,
    };
    info!(
        pipeline = %report.pipeline_name,
        read = report.records_read,
        written = report.entries_written,
        dedup = report.raw_deduplicated,
        invalid = report.invalid,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "ingest complete"
    );
    Ok(report)
}

/// Bulk-insert one raw batch with retries; the store shuttles through the
/// blocking pool so the reactor never blocks on SQLite.
async fn write_raw_batch(
    store_slot: &mut Option<RawStore>,
    records: Vec<etymograph_core::RawRecord>,
    pipeline: &str,
    policy: RetryPolicy,
) -> Result<etymograph_store::InsertStats> {
    let records = Arc::new(records);
    for attempt in 0..policy.attempts {
        let store = store_slot.take().expect("raw store present");
        let records_ref = records.clone();
        let (store, result) = tokio::task::spawn_blocking(move || {
            let mut store = store;
            let result = store.bulk_insert(&records_ref);
            (store, result)
        })
        .await
        .map_err(|e| PipelineError::WorkerPanic {
            pipeline: pipeline.to_string(),
            stage: "raw-writer".to_string(),
            message: e.to_string(),
        })?;
        *store_slot = Some(store);

        match result {
            Ok(stats) => return Ok(stats),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                warn!(
                    "raw batch write failed (attempt {}/{}): {}",
                    attempt + 1,
                    policy.attempts,
                    e
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) if e.is_transient() => {
                return Err(PipelineError::RetriesExhausted {
                    pipeline: pipeline.to_string(),
                    stage: "raw-writer".to_string(),
                    attempts: policy.attempts,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(PipelineError::Store(e)),
        }
    }
    Err(PipelineError::RetriesExhausted {
        pipeline: pipeline.to_string(),
        stage: "raw-writer".to_string(),
        attempts: policy.attempts,
        message: "raw batch write kept failing".to_string(),
    })
}

/// Scan past `cursor` and forward rows to the cleaners, registering each
/// cursor with the watermark before it enters the queue.
async fn forward_scanned(
    store_slot: &mut Option<RawStore>,
    source_id: &str,
    mut cursor: u64,
    batch: usize,
    watermark: &Arc<Watermark>,
    q_clean_tx: &StageTx<StoredRaw>,
) -> Result<u64> {
    loop {
        let store = store_slot.take().expect("raw store present");
        let source = source_id.to_string();
        let (store, result) = tokio::task::spawn_blocking(move || {
            let result = store.scan(Some(&source), cursor, batch);
            (store, result)
        })
        .await
        .map_err(|e| PipelineError::WorkerPanic {
            pipeline: "ingest".to_string(),
            stage: "raw-scanner".to_string(),
            message: e.to_string(),
        })?;
        *store_slot = Some(store);

        let (rows, next_cursor) = result?;
        if rows.is_empty() {
            return Ok(cursor);
        }
        cursor = next_cursor;
        for row in rows {
            watermark.register(row.cursor);
            if !q_clean_tx.send_item(row).await {
                return Ok(cursor);
            }
        }
    }
}

/// Upsert a typed batch (entries + transform logs) with retries, then mark
/// every cursor committed.
async fn write_typed_batch(
    entry_slot: &mut Option<EntryStore>,
    log_slot: &mut Option<TransformLogStore>,
    items: Vec<TypedItem>,
    pipeline: &str,
    counters: &Arc<StageCounters>,
    watermark: &Arc<Watermark>,
    policy: RetryPolicy,
) -> Result<(u64, u64)> {
    let mut entries = Vec::with_capacity(items.len());
    let mut logs = Vec::with_capacity(items.len());
    let mut cursors = Vec::with_capacity(items.len());
    let mut dropped = 0u64;

    for item in items {
        if !item.log.steps.is_empty() {
            logs.push(item.log);
        }
        cursors.push(item.cursor);
        match item.entry {
            Some(entry) => entries.push(entry),
            None => dropped += 1,
        }
    }
    let written = entries.len() as u64;
    let entries = Arc::new(entries);
    let logs = Arc::new(logs);

    let mut attempt = 0u32;
    loop {
        let entry_store = entry_slot.take().expect("entry store present");
        let log_store = log_slot.take().expect("log store present");
        let entries_ref = entries.clone();
        let logs_ref = logs.clone();

        let (entry_store, log_store, result) = tokio::task::spawn_blocking(move || {
            let mut entry_store = entry_store;
            let mut log_store = log_store;
            let result = entry_store
                .bulk_upsert(&entries_ref)
                .and_then(|stats| log_store.append_many(&logs_ref).map(|_| stats));
            (entry_store, log_store, result)
        })
        .await
        .map_err(|e| PipelineError::WorkerPanic {
            pipeline: pipeline.to_string(),
            stage: "typed-writer".to_string(),
            message: e.to_string(),
        })?;
        *entry_slot = Some(entry_store);
        *log_slot = Some(log_store);

        match result {
            Ok(_) => break,
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                warn!(
                    "typed batch write failed (attempt {}/{}): {}",
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
                    stage: "typed-writer".to_string(),
                    attempts: policy.attempts,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(PipelineError::Store(e)),
        }
    }

    // Only after the transaction commits do these cursors count as done
    for cursor in cursors {
        watermark.mark_done(cursor);
    }
    counters.add_processed(written + dropped);
    counters.add_succeeded(written);
    counters.add_skipped(dropped);
    Ok((written, dropped))
}

fn checkpoint_from_counters(
    pipeline_name: &str,
    source_id: &str,
    committed_cursor: u64,
    clean_counters: &Arc<StageCounters>,
    write_counters: &Arc<StageCounters>,
) -> Checkpoint {
    let mut cp = Checkpoint::new(pipeline_name);
    cp.at = etymograph_core::now_millis();
    cp.processed = clean_counters.processed.load(Ordering::Relaxed);
    cp.succeeded = write_counters.succeeded.load(Ordering::Relaxed);
    cp.failed = clean_counters.failed.load(Ordering::Relaxed);
    cp.skipped = write_counters.skipped.load(Ordering::Relaxed);
    cp.total = cp.processed;
    cp.per_source_cursor
        .insert(source_id.to_string(), committed_cursor);
    cp
}
