//! Typed lexical model
//!
//! This module defines the typed side of the schemaless→typed boundary:
//! [`EntryDraft`] is what the cleaner pipeline operates on, [`Entry`] is what
//! the typed store persists. Derived views ([`Concept`], [`SimilarityEdge`],
//! [`CognateCluster`]) reference entries by stable id only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::record::hex_encode;

/// Embedding dimension used across the system.
pub const EMBEDDING_DIM: usize = 768;

/// Separator byte for deterministic id hashing.
const ID_SEP: &str = "\x1f";

/// Compute the deterministic entry id.
///
/// Hash of `(headword, language_code, primary_gloss)` truncated to 32 hex
/// chars. The gloss participates so homographs with distinct senses stay
/// distinct entries.
pub fn entry_id(headword: &str, language_code: &str, primary_gloss: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(headword.as_bytes());
    hasher.update(ID_SEP.as_bytes());
    hasher.update(language_code.as_bytes());
    hasher.update(ID_SEP.as_bytes());
    hasher.update(primary_gloss.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest)[..32].to_string()
}

/// Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Draft (cleaner pipeline currency)
// ============================================================================

/// Mutable working form of an entry while it moves through the cleaners.
///
/// Drafts are extracted from raw payloads by [`EntryDraft::from_payload`],
/// which is the only place schemaless data becomes typed. Cleaners are pure
/// `EntryDraft → EntryDraft` functions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryDraft {
    pub headword: String,
    pub ipa: Option<String>,
    pub language_code: String,
    pub definition: String,
    pub etymology: Option<String>,
    pub pos_tag: Option<String>,
    /// Checksum of the raw record this draft came from
    pub raw_ref: String,
    pub source_id: String,
}

impl EntryDraft {
    /// Probe a raw payload for the canonical key set and build a draft.
    ///
    /// Missing `word` or `lang_code` is an invalid record, not a panic:
    /// loaders do not guarantee any schema.
    pub fn from_payload(
        payload: &Value,
        raw_ref: impl Into<String>,
        source_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let headword = payload
            .get("word")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .ok_or_else(|| crate::CoreError::InvalidRecord("missing or empty 'word'".into()))?;

        let language_code = payload
            .get("lang_code")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| crate::CoreError::InvalidRecord("missing or empty 'lang_code'".into()))?;

        let definition = first_gloss(payload).unwrap_or_default();
        let ipa = payload
            .get("sounds")
            .and_then(Value::as_array)
            .and_then(|sounds| {
                sounds
                    .iter()
                    .find_map(|s| s.get("ipa").and_then(Value::as_str))
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            headword: headword.to_string(),
            ipa,
            language_code: language_code.to_string(),
            definition,
            etymology: payload
                .get("etymology_text")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            pos_tag: payload
                .get("pos")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            raw_ref: raw_ref.into(),
            source_id: source_id.into(),
        })
    }

    /// First gloss of the first sense, used as the identity gloss.
    pub fn primary_gloss(&self) -> &str {
        &self.definition
    }

    /// Deterministic id for the entry this draft will become.
    pub fn id(&self) -> String {
        entry_id(&self.headword, &self.language_code, self.primary_gloss())
    }

    /// Field-completeness quality score in [0, 1].
    pub fn quality(&self) -> f32 {
        // Required fields count double; optional fields fill in the rest.
        let mut score = 0.0f32;
        if !self.headword.is_empty() {
            score += 0.3;
        }
        if !self.language_code.is_empty() {
            score += 0.2;
        }
        if !self.definition.is_empty() {
            score += 0.2;
        }
        if self.ipa.is_some() {
            score += 0.15;
        }
        if self.etymology.is_some() {
            score += 0.1;
        }
        if self.pos_tag.is_some() {
            score += 0.05;
        }
        score.min(1.0)
    }
}

fn first_gloss(payload: &Value) -> Option<String> {
    payload
        .get("senses")
        .and_then(Value::as_array)
        .and_then(|senses| {
            senses.iter().find_map(|sense| {
                sense
                    .get("glosses")
                    .and_then(Value::as_array)
                    .and_then(|glosses| glosses.iter().find_map(Value::as_str))
            })
        })
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
}

// ============================================================================
// Entry (persisted)
// ============================================================================

/// A cleaned, validated lexical entry as stored in the typed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Deterministic id, see [`entry_id`]
    pub id: String,
    pub headword: String,
    pub ipa: Option<String>,
    /// ISO-639 code, at most 3 chars
    pub language_code: String,
    pub definition: String,
    pub etymology: Option<String>,
    pub pos_tag: Option<String>,
    /// Dense semantic vector, absent until enrichment fills it
    pub embedding: Option<Vec<f32>>,
    /// Checksum of the raw record this entry was cleaned from
    pub raw_ref: String,
    pub source_id: String,
    /// Identity of the cleaner composition that produced this entry
    pub pipeline_fingerprint: String,
    /// Monotone ordering for upsert overwrites
    pub pipeline_seq: u64,
    /// Completeness/cleanliness score in [0, 1]
    pub quality: f32,
    pub validation_errors: Vec<String>,
    /// Unix millis
    pub created_at: u64,
}

impl Entry {
    /// Promote a cleaned draft into a persistable entry.
    pub fn from_draft(
        draft: EntryDraft,
        pipeline_fingerprint: impl Into<String>,
        pipeline_seq: u64,
        validation_errors: Vec<String>,
    ) -> Self {
        let id = draft.id();
        let quality = draft.quality();
        Self {
            id,
            headword: draft.headword,
            ipa: draft.ipa,
            language_code: draft.language_code,
            definition: draft.definition,
            etymology: draft.etymology,
            pos_tag: draft.pos_tag,
            embedding: None,
            raw_ref: draft.raw_ref,
            source_id: draft.source_id,
            pipeline_fingerprint: pipeline_fingerprint.into(),
            pipeline_seq,
            quality,
            validation_errors,
            created_at: now_millis(),
        }
    }
}

// ============================================================================
// Derived views
// ============================================================================

/// A cross-lingual semantic cluster discovered from entry embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: String,
    /// Mean of member embeddings at discovery time
    pub centroid_vector: Vec<f32>,
    pub member_count: usize,
    pub languages_present: Vec<String>,
    /// Fraction of members that are density-core points
    pub confidence: f32,
}

/// A scored relation between two entries, canonicalized `entry_a < entry_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub entry_a: String,
    pub entry_b: String,
    pub semantic: f32,
    pub phonetic: f32,
    pub etymological: f32,
    pub combined: f32,
    /// (alpha, beta, gamma) actually applied, post-renormalization
    pub weights: (f32, f32, f32),
    pub phylo_distance: Option<u32>,
    /// Concept ids of the endpoints, when aligned
    pub concepts: Option<(String, String)>,
}

impl SimilarityEdge {
    /// Order the endpoint ids lexicographically.
    ///
    /// The canonical ordering doubles as the deduplication key for edge
    /// writes, so it must be applied before an edge leaves the composer.
    pub fn canonicalize(mut self) -> Self {
        if self.entry_a > self.entry_b {
            std::mem::swap(&mut self.entry_a, &mut self.entry_b);
            if let Some((ca, cb)) = self.concepts.take() {
                self.concepts = Some((cb, ca));
            }
        }
        self
    }
}

/// A set of entries judged to descend from a common ancestor form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognateCluster {
    pub cluster_id: String,
    pub concept_id: Option<String>,
    pub members: Vec<String>,
    pub languages: Vec<String>,
    /// Highest-PageRank member, the cluster's exemplar
    pub representative: String,
    pub confidence: f32,
    pub size: usize,
}

// ============================================================================
// Transform log
// ============================================================================

/// One cleaner application recorded against a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStep {
    pub step_name: String,
    pub step_version: u32,
    /// Cleaner parameters as JSON, `null` when parameterless
    pub parameters: Value,
    /// Unix millis
    pub at: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Ordered, append-only history of transformations applied to a raw record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformLog {
    /// Checksum of the raw record
    pub raw_ref: String,
    pub steps: Vec<TransformStep>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "word": "father",
            "lang_code": "en",
            "pos": "noun",
            "senses": [{"glosses": ["male parent"]}],
            "sounds": [{"ipa": "/ˈfɑːðə/"}],
            "etymology_text": "From Middle English fader."
        })
    }

    #[test]
    fn test_entry_id_deterministic() {
        let a = entry_id("father", "en", "male parent");
        let b = entry_id("father", "en", "male parent");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_entry_id_gloss_sensitive() {
        let noun = entry_id("bank", "en", "financial institution");
        let shore = entry_id("bank", "en", "edge of a river");
        assert_ne!(noun, shore);
    }

    #[test]
    fn test_draft_from_payload() {
        let draft = EntryDraft::from_payload(&payload(), "abc", "wikt-en").unwrap();
        assert_eq!(draft.headword, "father");
        assert_eq!(draft.language_code, "en");
        assert_eq!(draft.definition, "male parent");
        assert_eq!(draft.ipa.as_deref(), Some("/ˈfɑːðə/"));
        assert_eq!(draft.pos_tag.as_deref(), Some("noun"));
    }

    #[test]
    fn test_draft_missing_word_is_invalid() {
        let p = json!({"lang_code": "en"});
        assert!(EntryDraft::from_payload(&p, "x", "s").is_err());
        let p = json!({"word": "  ", "lang_code": "en"});
        assert!(EntryDraft::from_payload(&p, "x", "s").is_err());
    }

    #[test]
    fn test_draft_quality_range() {
        let full = EntryDraft::from_payload(&payload(), "x", "s").unwrap();
        assert!(full.quality() > 0.9);
        let sparse = EntryDraft {
            headword: "a".into(),
            language_code: "en".into(),
            ..Default::default()
        };
        let q = sparse.quality();
        assert!(q > 0.0 && q < 0.7);
    }

    #[test]
    fn test_edge_canonicalize_swaps() {
        let edge = SimilarityEdge {
            entry_a: "zzz".into(),
            entry_b: "aaa".into(),
            semantic: 0.5,
            phonetic: 0.5,
            etymological: 0.0,
            combined: 0.4,
            weights: (0.4, 0.4, 0.2),
            phylo_distance: None,
            concepts: Some(("cz".into(), "ca".into())),
        };
        let edge = edge.canonicalize();
        assert_eq!(edge.entry_a, "aaa");
        assert_eq!(edge.entry_b, "zzz");
        assert_eq!(edge.concepts, Some(("ca".into(), "cz".into())));
    }
}
