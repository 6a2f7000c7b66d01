//! `etymograph ingest` - run the ingestion pipeline over one source file

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use etymograph_config::EtymographConfig;
use etymograph_core::LoaderFormat;
use etymograph_pipeline::{spawn_ingest, IngestOptions};

use crate::progress;

/// Arguments for the ingest command
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Source file to ingest
    #[arg(long, short = 'f')]
    pub file: PathBuf,

    /// Logical source id (e.g. "wikt-en")
    #[arg(long, short = 's')]
    pub source: String,

    /// Source format
    #[arg(long, value_parser = ["json", "cldf", "starling", "tei", "csv"])]
    pub format: String,

    /// Cleaner workers (0 = CPU cores)
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Records per file-read batch
    #[arg(long)]
    pub load_batch: Option<usize>,

    /// Drafts per cleaning batch
    #[arg(long)]
    pub clean_batch: Option<usize>,

    /// Entries per typed-store write batch
    #[arg(long)]
    pub write_batch: Option<usize>,

    /// Short-circuit cleaning on the first failed validation
    #[arg(long)]
    pub strict: bool,

    /// Resume from the last committed checkpoint
    #[arg(long)]
    pub resume: bool,

    /// Pipeline sequence number (bump to force overwrites)
    #[arg(long, default_value_t = 1)]
    pub pipeline_seq: u64,
}

pub async fn run(args: IngestArgs, config: &EtymographConfig, quiet: bool) -> Result<()> {
    let format = LoaderFormat::detect(&args.format)?;

    std::fs::create_dir_all(&config.storage.data_dir)?;

    let mut pipeline = config.pipeline.clone();
    if args.workers > 0 {
        pipeline.cleaner_workers = args.workers;
    }
    if let Some(batch) = args.load_batch {
        pipeline.load_batch = batch;
    }
    if let Some(batch) = args.clean_batch {
        pipeline.clean_batch = batch;
    }
    if let Some(batch) = args.write_batch {
        pipeline.write_batch = batch;
    }
    pipeline.validate()?;

    let options = IngestOptions {
        source_id: args.source.clone(),
        file: args.file,
        format,
        db_path: config.storage.database_path(),
        pipeline,
        strict: args.strict,
        resume: args.resume,
        pipeline_seq: args.pipeline_seq,
    };

    let pb = progress::spinner(&format!("ingesting {}", args.source), quiet);
    let running = spawn_ingest(options)?;
    let mut progress_rx = running.progress.clone();
    let watcher = tokio::spawn({
        let pb = pb.clone();
        async move {
            while progress_rx.changed().await.is_ok() {
                let snapshot = progress_rx.borrow().clone();
                progress::update_from_snapshot(&pb, &snapshot);
            }
        }
    });

    let report = running.join().await?;
    watcher.abort();

    progress::finish_spinner(
        pb,
        &format!(
            "{}: {} read, {} entries written, {} duplicates, {} invalid in {:.1}s",
            report.pipeline_name,
            report.records_read,
            report.entries_written,
            report.raw_deduplicated,
            report.invalid,
            report.elapsed.as_secs_f64()
        ),
    );

    if !quiet && !report.item_errors.is_empty() {
        eprintln!("first {} item errors:", report.item_errors.len().min(10));
        for item in report.item_errors.iter().take(10) {
            eprintln!("  [{}] {}", item.stage, item.message);
        }
    }
    Ok(())
}
