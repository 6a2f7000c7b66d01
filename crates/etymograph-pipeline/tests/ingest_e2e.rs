//! End-to-end ingest pipeline tests
//!
//! These run the full canonical pipeline (file → raw store → cleaners →
//! validator → typed store) against real SQLite files in a temp dir.

use std::io::Write;
use std::path::{Path, PathBuf};

use etymograph_config::PipelineConfig;
use etymograph_core::LoaderFormat;
use etymograph_pipeline::{run_ingest, spawn_ingest, IngestOptions};
use etymograph_store::{EntryFilter, EntryStore, RawStore, TransformLogStore};

/// Small batches so multi-batch paths get exercised even on tiny files.
fn test_config(workers: usize) -> PipelineConfig {
    PipelineConfig {
        load_batch: 50,
        raw_write_batch: 40,
        clean_batch: 16,
        write_batch: 32,
        cleaner_workers: workers,
        embed_batch: 8,
        writers: 2,
        checkpoint_interval: 10,
        batch_idle_ms: 20,
        max_error_rate: 0.9,
    }
}

fn options(file: &Path, db: &Path, workers: usize) -> IngestOptions {
    IngestOptions {
        source_id: "test-src".to_string(),
        file: file.to_path_buf(),
        format: LoaderFormat::Json,
        db_path: db.to_path_buf(),
        pipeline: test_config(workers),
        strict: false,
        resume: false,
        pipeline_seq: 1,
    }
}

fn write_tiny_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("tiny.jsonl");
    let mut f = std::fs::File::create(&path).unwrap();
    let lines = [
        r#"{"word":"father","lang_code":"en","senses":[{"glosses":["male parent"]}]}"#,
        r#"{"word":"vater","lang_code":"de","senses":[{"glosses":["male parent"]}]}"#,
        r#"{"word":"pater","lang_code":"la","senses":[{"glosses":["male parent"]}]}"#,
        // Exact duplicate of the first line
        r#"{"word":"father","lang_code":"en","senses":[{"glosses":["male parent"]}]}"#,
        // Invalid: empty headword
        r#"{"word":"","lang_code":"en","senses":[{"glosses":["nothing"]}]}"#,
    ];
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
    path
}

fn write_bulk_fixture(dir: &Path, lines: usize) -> PathBuf {
    let path = dir.join("bulk.jsonl");
    let mut f = std::fs::File::create(&path).unwrap();
    for i in 0..lines {
        writeln!(
            f,
            r#"{{"word":"word{i}","lang_code":"en","pos":"noun","senses":[{{"glosses":["gloss number {i}"]}}]}}"#,
        )
        .unwrap();
    }
    path
}

fn entry_keys(db: &Path) -> Vec<(String, String, String)> {
    let store = EntryStore::open(db).unwrap();
    let (entries, _) = store.scan(&EntryFilter::default(), 0, 100_000).unwrap();
    let mut keys: Vec<(String, String, String)> = entries
        .into_iter()
        .map(|e| (e.id, e.headword, e.language_code))
        .collect();
    keys.sort();
    keys
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tiny_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_tiny_fixture(dir.path());
    let db = dir.path().join("etymograph.db");

    let report = run_ingest(options(&file, &db, 2)).await.unwrap();

    assert_eq!(report.records_read, 5);
    assert_eq!(report.raw_deduplicated, 1);
    assert_eq!(report.raw_inserted, 4);
    assert_eq!(report.entries_written, 3);
    assert_eq!(report.invalid, 1);

    let store = EntryStore::open(&db).unwrap();
    assert_eq!(store.count(Some("test-src")).unwrap(), 3);

    let keys = entry_keys(&db);
    let langs: Vec<&str> = keys.iter().map(|(_, _, l)| l.as_str()).collect();
    assert!(langs.contains(&"en"));
    assert!(langs.contains(&"de"));
    assert!(langs.contains(&"la"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transform_log_written() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_tiny_fixture(dir.path());
    let db = dir.path().join("etymograph.db");

    run_ingest(options(&file, &db, 1)).await.unwrap();

    // Each surviving raw record has one step per standard cleaner
    let raw = RawStore::open(&db).unwrap();
    let (rows, _) = raw.scan(Some("test-src"), 0, 100).unwrap();
    let logs = TransformLogStore::open(&db).unwrap();
    let first = logs.fetch(&rows[0].record.checksum).unwrap();
    assert_eq!(first.steps.len(), 5);
    assert_eq!(first.steps[0].step_name, "headword-stripper");
    assert_eq!(first.steps.last().unwrap().step_name, "definition-cleaner");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_determinism() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_bulk_fixture(dir.path(), 400);

    let db_serial = dir.path().join("serial.db");
    let report = run_ingest(options(&file, &db_serial, 1)).await.unwrap();
    assert_eq!(report.entries_written, 400);

    let db_parallel = dir.path().join("parallel.db");
    let report = run_ingest(options(&file, &db_parallel, 8)).await.unwrap();
    assert_eq!(report.entries_written, 400);

    // The final set of (id, headword, language) tuples is identical
    assert_eq!(entry_keys(&db_serial), entry_keys(&db_parallel));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_bulk_fixture(dir.path(), 120);
    let db = dir.path().join("etymograph.db");

    run_ingest(options(&file, &db, 4)).await.unwrap();
    let first = entry_keys(&db);

    // Second run over the same source: all raw records dedup, all entries
    // upsert onto the same ids
    let report = run_ingest(options(&file, &db, 4)).await.unwrap();
    assert_eq!(report.raw_inserted, 0);
    assert_eq!(report.raw_deduplicated, 120);

    let second = entry_keys(&db);
    assert_eq!(first, second);
    let store = EntryStore::open(&db).unwrap();
    assert_eq!(store.count(None).unwrap(), 120);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoint_resume_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_bulk_fixture(dir.path(), 600);

    // Reference: a run that never stops
    let db_clean = dir.path().join("clean.db");
    run_ingest(options(&file, &db_clean, 4)).await.unwrap();
    let expected = entry_keys(&db_clean);
    assert_eq!(expected.len(), 600);

    // Interrupted run: cancel mid-flight, then resume
    let db_resume = dir.path().join("resume.db");
    let running = spawn_ingest(options(&file, &db_resume, 4)).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    running.cancel();
    let partial = running.join().await.unwrap();
    // Whatever committed before cancellation stays committed
    let committed_before = entry_keys(&db_resume).len();
    assert!(committed_before <= 600);
    assert!(partial.checkpoint.per_source_cursor.contains_key("test-src"));

    let mut resume_options = options(&file, &db_resume, 4);
    resume_options.resume = true;
    run_ingest(resume_options).await.unwrap();

    // Final state equals the uninterrupted run, id for id
    assert_eq!(entry_keys(&db_resume), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_file_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("etymograph.db");
    let bad = options(&dir.path().join("nope.jsonl"), &db, 1);
    let err = spawn_ingest(bad).err().unwrap();
    assert_eq!(err.exit_code(), 65);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reprocess_higher_seq_overwrites_without_losing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_bulk_fixture(dir.path(), 50);
    let db = dir.path().join("etymograph.db");

    run_ingest(options(&file, &db, 2)).await.unwrap();
    let before = entry_keys(&db);

    let mut later = options(&file, &db, 2);
    later.pipeline_seq = 2;
    run_ingest(later).await.unwrap();

    let after = entry_keys(&db);
    assert_eq!(before, after, "reprocessing must not lose entries");

    let store = EntryStore::open(&db).unwrap();
    let (entries, _) = store.scan(&EntryFilter::default(), 0, 100).unwrap();
    assert!(entries.iter().all(|e| e.pipeline_seq == 2));
}
