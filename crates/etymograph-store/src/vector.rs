//! Qdrant vector index over entry embeddings
//!
//! Provides the nearest-neighbor side of the typed store: entries with
//! embeddings are mirrored into one Qdrant collection (cosine distance)
//! with payload indexes on `language_code` and `source_id` for filtered
//! kNN.

use qdrant_client::qdrant::{
    vectors_config::Config, Condition, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, FieldType, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParams, VectorsConfig,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use tracing::{debug, info};

use etymograph_core::EMBEDDING_DIM;

use crate::error::{Result, StoreError};

/// Collection name for entry embeddings
pub const ENTRIES_COLLECTION: &str = "entry_semantic";

/// Payload field names for indexed filtering
pub mod fields {
    /// Deterministic entry id
    pub const ENTRY_ID: &str = "entry_id";
    /// ISO-639 language code
    pub const LANGUAGE_CODE: &str = "language_code";
    /// Ingest source id
    pub const SOURCE_ID: &str = "source_id";
    /// Headword text
    pub const HEADWORD: &str = "headword";
}

/// Configuration for connecting to Qdrant
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Qdrant server URL (e.g., "http://localhost:6334")
    pub url: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// A point to upsert into the entry collection
#[derive(Debug, Clone)]
pub struct EntryPoint {
    /// Entry id (hashed to the numeric point id)
    pub entry_id: String,
    pub vector: Vec<f32>,
    pub headword: String,
    pub language_code: String,
    pub source_id: String,
}

impl EntryPoint {
    /// Numeric point id derived from the entry id.
    pub fn point_id(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.entry_id.hash(&mut hasher);
        hasher.finish()
    }
}

/// Filter for kNN queries
#[derive(Debug, Clone, Default)]
pub struct KnnFilter {
    pub language_code: Option<String>,
    pub source_id: Option<String>,
}

/// A kNN search result
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub entry_id: String,
    /// Cosine similarity score
    pub score: f32,
    pub headword: String,
    pub language_code: String,
}

/// Qdrant-backed nearest-neighbor index over entry embeddings.
pub struct EntryIndex {
    client: Qdrant,
}

impl EntryIndex {
    /// Connect to Qdrant and verify the server responds.
    pub async fn connect(config: VectorIndexConfig) -> Result<Self> {
        info!("Connecting to Qdrant at {}", config.url);

        let mut builder = Qdrant::from_url(&config.url);
        if let Some(api_key) = config.api_key {
            builder = builder.api_key(api_key);
        }
        let client = builder.build().map_err(|e| {
            StoreError::Connection(format!("Failed to build Qdrant client: {}", e))
        })?;

        // Test connection by listing collections
        client
            .list_collections()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Qdrant: {}", e)))?;

        Ok(Self { client })
    }

    /// Create the entry collection and its payload indexes if missing.
    pub async fn ensure_collection(&self) -> Result<()> {
        if self.client.collection_exists(ENTRIES_COLLECTION).await? {
            debug!("Collection '{}' already exists", ENTRIES_COLLECTION);
            return Ok(());
        }

        info!(
            "Creating collection '{}' (dim={}, distance=Cosine)",
            ENTRIES_COLLECTION, EMBEDDING_DIM
        );

        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: EMBEDDING_DIM as u64,
                distance: qdrant_client::qdrant::Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        self.client
            .create_collection(
                CreateCollectionBuilder::new(ENTRIES_COLLECTION).vectors_config(vectors_config),
            )
            .await?;

        for field in [fields::LANGUAGE_CODE, fields::SOURCE_ID, fields::ENTRY_ID] {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    ENTRIES_COLLECTION,
                    field,
                    FieldType::Keyword,
                ))
                .await?;
        }

        Ok(())
    }

    /// Upsert points in batches to avoid request timeouts.
    pub async fn upsert_points_batched(
        &self,
        points: Vec<EntryPoint>,
        batch_size: usize,
    ) -> Result<()> {
        let total = points.len();
        if total == 0 {
            return Ok(());
        }

        debug!(
            "Upserting {} points to '{}' in batches of {}",
            total, ENTRIES_COLLECTION, batch_size
        );

        for batch in points.chunks(batch_size.max(1)) {
            let qdrant_points: Vec<PointStruct> = batch
                .iter()
                .map(|p| {
                    let payload = Payload::try_from(json!({
                        fields::ENTRY_ID: p.entry_id,
                        fields::HEADWORD: p.headword,
                        fields::LANGUAGE_CODE: p.language_code,
                        fields::SOURCE_ID: p.source_id,
                    }))
                    .expect("payload construction is infallible for this shape");
                    PointStruct::new(p.point_id(), p.vector.clone(), payload)
                })
                .collect();

            self.client
                .upsert_points(
                    UpsertPointsBuilder::new(ENTRIES_COLLECTION, qdrant_points).wait(true),
                )
                .await?;
        }

        Ok(())
    }

    /// k-nearest-neighbor search with optional payload filters.
    pub async fn knn(
        &self,
        query_vector: Vec<f32>,
        k: u64,
        filter: &KnnFilter,
    ) -> Result<Vec<VectorHit>> {
        let mut conditions = Vec::new();
        if let Some(ref lang) = filter.language_code {
            conditions.push(Condition::matches(fields::LANGUAGE_CODE, lang.clone()));
        }
        if let Some(ref source) = filter.source_id {
            conditions.push(Condition::matches(fields::SOURCE_ID, source.clone()));
        }

        let mut search = SearchPointsBuilder::new(ENTRIES_COLLECTION, query_vector, k)
            .with_payload(true);
        if !conditions.is_empty() {
            search = search.filter(Filter::must(conditions));
        }

        let response = self.client.search_points(search).await?;

        let hits = response
            .result
            .into_iter()
            .map(|point| {
                let payload = point.payload;
                let get_string = |key: &str| -> String {
                    payload
                        .get(key)
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_default()
                };
                VectorHit {
                    entry_id: get_string(fields::ENTRY_ID),
                    score: point.score,
                    headword: get_string(fields::HEADWORD),
                    language_code: get_string(fields::LANGUAGE_CODE),
                }
            })
            .collect();

        Ok(hits)
    }

    /// Delete all points belonging to one source.
    pub async fn delete_source_points(&self, source_id: &str) -> Result<()> {
        info!(
            "Deleting points for source '{}' from '{}'",
            source_id, ENTRIES_COLLECTION
        );

        let filter = Filter::must([Condition::matches(
            fields::SOURCE_ID,
            source_id.to_string(),
        )]);

        self.client
            .delete_points(
                DeletePointsBuilder::new(ENTRIES_COLLECTION)
                    .points(filter)
                    .wait(true),
            )
            .await?;

        Ok(())
    }
}
