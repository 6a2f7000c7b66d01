//! Etymograph Core - Lexical data model and cleaning pipeline
//!
//! This crate provides the data layer of the ingestion system:
//! - Raw record model with canonical content checksums
//! - Source loaders for JSONL, CLDF, Starling, TEI XML and CSV wordlists
//! - The typed entry model with deterministic ids
//! - The versioned cleaner pipeline (the schemaless → typed boundary)
//! - Pure rule-based validation

pub mod clean;
pub mod entry;
pub mod error;
pub mod loaders;
pub mod record;
pub mod validate;

// Re-exports for convenience
pub use entry::{
    entry_id, now_millis, CognateCluster, Concept, Entry, EntryDraft, SimilarityEdge,
    TransformLog, TransformStep, EMBEDDING_DIM,
};
pub use error::{CoreError, ErrorKind, Result};
pub use record::{canonical_bytes, hex_encode, payload_checksum, Origin, RawRecord};

// Loader re-exports
pub use loaders::{
    loader_for, CldfLoader, CsvWordlistLoader, JsonlLoader, Loader, LoaderFormat, RecordIter,
    StarlingLoader, TeiLoader,
};

// Cleaner re-exports
pub use clean::{
    CleanOutcome, Cleaner, CleanerPipeline, DefinitionCleaner, HeadwordStripper, IpaNormalizer,
    LanguageCanonicalizer, TextNormalizer,
};

// Validation re-exports
pub use validate::{is_iso639_shaped, is_valid_ipa, Field, Rule, Validator, Verdict};
