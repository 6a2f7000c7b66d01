//! Etymograph Analysis - similarity kernels and derived views
//!
//! This crate provides the compute kernels of the system:
//! - Phonetic distance: feature-weighted DTW over IPA sequences, batched
//!   with rayon
//! - Cognate graph: thresholded similarity graph, connected components,
//!   community detection, PageRank
//! - Concept alignment: seeded projection + density clustering of entry
//!   embeddings into cross-lingual concepts
//! - Similarity composition: weighted combination of the semantic,
//!   phonetic and phylogenetic channels
//!
//! Every kernel is deterministic given its inputs; rebuilding a derived
//! view with the same parameters yields identical output.

pub mod concepts;
pub mod error;
pub mod graph;
pub mod phonetic;
pub mod phylo;
pub mod similarity;

// Re-exports for convenience
pub use concepts::{cosine, AlignInput, Alignment, AlignerConfig, ConceptAligner};
pub use error::{AnalysisError, Result};
pub use graph::{CognateGraph, DEFAULT_DAMPING, DEFAULT_MAX_ITER};
pub use phonetic::{distance, parse_ipa, similarity, similarity_batch, DtwConfig, Phone};
pub use phylo::{PhyloPair, PhyloTable};
pub use similarity::{PairSide, SimilarityComposer, WeightPreset};
