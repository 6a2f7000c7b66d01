//! End-to-end enrichment pipeline tests
//!
//! Ingests a small source, then runs enrichment with the deterministic
//! hash embedder behind the two-level cache, exercising batching, cache
//! hits and the write-back path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use etymograph_config::PipelineConfig;
use etymograph_core::LoaderFormat;
use etymograph_embed::{CachedEmbedder, HashEmbedder};
use etymograph_pipeline::{run_enrich, run_ingest, EnrichOptions, IngestOptions};
use etymograph_store::{EntryFilter, EntryStore};

fn test_config() -> PipelineConfig {
    PipelineConfig {
        load_batch: 100,
        raw_write_batch: 100,
        clean_batch: 32,
        write_batch: 32,
        cleaner_workers: 2,
        embed_batch: 16,
        writers: 2,
        checkpoint_interval: 50,
        batch_idle_ms: 20,
        max_error_rate: 0.9,
    }
}

fn write_fixture(dir: &Path, lines: usize) -> PathBuf {
    let path = dir.join("entries.jsonl");
    let mut f = std::fs::File::create(&path).unwrap();
    for i in 0..lines {
        writeln!(
            f,
            r#"{{"word":"word{i}","lang_code":"en","senses":[{{"glosses":["meaning {i}"]}}]}}"#,
        )
        .unwrap();
    }
    path
}

async fn ingest_fixture(dir: &Path, lines: usize) -> PathBuf {
    let file = write_fixture(dir, lines);
    let db = dir.join("etymograph.db");
    run_ingest(IngestOptions {
        source_id: "test-src".to_string(),
        file,
        format: LoaderFormat::Json,
        db_path: db.clone(),
        pipeline: test_config(),
        strict: false,
        resume: false,
        pipeline_seq: 1,
    })
    .await
    .unwrap();
    db
}

fn enrich_options(db: &Path) -> EnrichOptions {
    EnrichOptions {
        source_id: Some("test-src".to_string()),
        db_path: db.to_path_buf(),
        pipeline: test_config(),
        resume: false,
        missing_only: false,
    }
}

fn cached_hash_embedder(shared: Option<&Path>) -> (Arc<HashEmbedder>, Arc<CachedEmbedder>) {
    let provider = Arc::new(HashEmbedder::new(64));
    let cached = Arc::new(CachedEmbedder::new(provider.clone(), 10_000, shared));
    (provider, cached)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enrichment_fills_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let db = ingest_fixture(dir.path(), 80).await;

    let (_, embedder) = cached_hash_embedder(None);
    let report = run_enrich(enrich_options(&db), embedder, None).await.unwrap();

    assert_eq!(report.entries_scanned, 80);
    assert_eq!(report.embedded, 80);

    let store = EntryStore::open(&db).unwrap();
    assert_eq!(store.count_embedded(Some("test-src")).unwrap(), 80);
    let (entries, _) = store.scan(&EntryFilter::default(), 0, 100).unwrap();
    for entry in entries {
        let embedding = entry.embedding.expect("embedding present");
        assert_eq!(embedding.len(), 64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_run_is_nearly_all_cache_hits() {
    let dir = tempfile::tempdir().unwrap();
    let db = ingest_fixture(dir.path(), 100).await;
    let cache_path = dir.path().join("embedding-cache.db");

    // First run populates both cache levels
    let (provider, embedder) = cached_hash_embedder(Some(&cache_path));
    run_enrich(enrich_options(&db), embedder, None).await.unwrap();
    let first_calls = provider.calls();
    assert!(first_calls > 0);

    // Second run, fresh process (fresh LRU), same shared cache
    let (provider, embedder) = cached_hash_embedder(Some(&cache_path));
    let report = run_enrich(enrich_options(&db), embedder, None).await.unwrap();

    assert_eq!(report.embedded, 100);
    assert!(
        report.cache.hit_rate() >= 0.99,
        "second run hit rate was {}",
        report.cache.hit_rate()
    );
    assert_eq!(provider.calls(), 0, "encoder must be skipped on cache hits");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_only_skips_embedded_entries() {
    let dir = tempfile::tempdir().unwrap();
    let db = ingest_fixture(dir.path(), 40).await;

    let (_, embedder) = cached_hash_embedder(None);
    run_enrich(enrich_options(&db), embedder, None).await.unwrap();

    let (_, embedder) = cached_hash_embedder(None);
    let mut options = enrich_options(&db);
    options.missing_only = true;
    let report = run_enrich(options, embedder, None).await.unwrap();
    assert_eq!(report.entries_scanned, 0);
    assert_eq!(report.embedded, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_embeddings_survive_reingest() {
    let dir = tempfile::tempdir().unwrap();
    let db = ingest_fixture(dir.path(), 30).await;

    let (_, embedder) = cached_hash_embedder(None);
    run_enrich(enrich_options(&db), embedder, None).await.unwrap();

    // Re-run the cleaner pipeline at a later seq; embeddings must survive
    let file = dir.path().join("entries.jsonl");
    run_ingest(IngestOptions {
        source_id: "test-src".to_string(),
        file,
        format: LoaderFormat::Json,
        db_path: db.clone(),
        pipeline: test_config(),
        strict: false,
        resume: false,
        pipeline_seq: 2,
    })
    .await
    .unwrap();

    let store = EntryStore::open(&db).unwrap();
    assert_eq!(store.count_embedded(Some("test-src")).unwrap(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enrich_report_checkpoint_cursor_advances() {
    let dir = tempfile::tempdir().unwrap();
    let db = ingest_fixture(dir.path(), 25).await;

    let (_, embedder) = cached_hash_embedder(None);
    let report = run_enrich(enrich_options(&db), embedder, None).await.unwrap();
    let cursor = report
        .checkpoint
        .per_source_cursor
        .get("test-src")
        .copied()
        .unwrap_or(0);
    assert!(cursor > 0, "committed cursor must advance");
}
