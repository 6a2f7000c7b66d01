//! `etymograph process` - run the enrichment pipeline

use anyhow::Result;
use clap::Args;
use tracing::warn;

use etymograph_config::{EmbeddingProviderType, EtymographConfig};
use etymograph_embed::{create_embedder, EmbedServiceConfig, ProviderKind, RemoteConfig};
use etymograph_pipeline::{spawn_enrich, EnrichOptions};
use etymograph_store::{EntryIndex, VectorIndexConfig};

use crate::progress;

/// Arguments for the process command
#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Restrict to one source id; omit to process everything
    #[arg(long, short = 's')]
    pub source: Option<String>,

    /// Texts per embedding batch
    #[arg(long)]
    pub embed_batch: Option<usize>,

    /// Writer workers
    #[arg(long)]
    pub writers: Option<usize>,

    /// Resume from the last committed checkpoint
    #[arg(long)]
    pub resume: bool,

    /// Only entries still lacking an embedding
    #[arg(long)]
    pub missing_only: bool,

    /// Skip the vector index mirror even if Qdrant is configured
    #[arg(long)]
    pub no_index: bool,
}

pub async fn run(args: ProcessArgs, config: &EtymographConfig, quiet: bool) -> Result<()> {
    std::fs::create_dir_all(&config.storage.data_dir)?;

    let mut pipeline = config.pipeline.clone();
    if let Some(batch) = args.embed_batch {
        pipeline.embed_batch = batch;
    }
    if let Some(writers) = args.writers {
        pipeline.writers = writers;
    }
    pipeline.validate()?;

    // Build the embedder behind its two-level cache
    let embed_config = EmbedServiceConfig {
        kind: match config.embedding.provider {
            EmbeddingProviderType::Local => ProviderKind::Local,
            EmbeddingProviderType::Remote => ProviderKind::Remote,
        },
        remote: config.embedding.remote.as_ref().map(|settings| RemoteConfig {
            base_url: settings.url.clone(),
            api_key: settings
                .api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok()),
            model: settings.model.clone(),
            timeout_secs: settings.timeout_secs,
            max_retries: settings.max_retries,
        }),
        lru_capacity: config.embedding.lru_capacity,
        shared_cache_path: config
            .embedding
            .shared_cache
            .then(|| config.storage.embedding_cache_path()),
    };
    let embedder = create_embedder(&embed_config)?;

    // The vector index is mirror-only; an unreachable Qdrant degrades to
    // store-only enrichment
    let index = if args.no_index {
        None
    } else {
        let index_config = VectorIndexConfig {
            url: config.storage.qdrant.url.clone(),
            api_key: config.storage.qdrant.api_key.clone(),
            timeout_secs: config.storage.qdrant.timeout_secs,
        };
        let pb = progress::spinner("connecting to vector index", quiet);
        match connect_index(index_config).await {
            Ok(index) => {
                progress::finish_spinner(pb, "vector index ready");
                Some(std::sync::Arc::new(index))
            }
            Err(e) => {
                warn!("vector index unavailable, continuing without: {}", e);
                progress::finish_spinner_warn(
                    pb,
                    "vector index unavailable; embeddings stay store-only",
                );
                None
            }
        }
    };

    let options = EnrichOptions {
        source_id: args.source.clone(),
        db_path: config.storage.database_path(),
        pipeline,
        resume: args.resume,
        missing_only: args.missing_only,
    };

    let label = args.source.as_deref().unwrap_or("all sources");
    let pb = progress::spinner(&format!("embedding {}", label), quiet);
    let running = spawn_enrich(options, embedder, index);
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
            "{}: {} embedded, cache hit rate {:.1}%, {} index points in {:.1}s",
            report.pipeline_name,
            report.embedded,
            report.cache.hit_rate() * 100.0,
            report.index_points,
            report.elapsed.as_secs_f64()
        ),
    );
    Ok(())
}

/// Connect to Qdrant and make sure the entry collection exists.
async fn connect_index(
    config: VectorIndexConfig,
) -> Result<EntryIndex, etymograph_store::StoreError> {
    let index = EntryIndex::connect(config).await?;
    index.ensure_collection().await?;
    Ok(index)
}
