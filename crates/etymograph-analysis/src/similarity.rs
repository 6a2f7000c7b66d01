//! Similarity composition
//!
//! Combines the three similarity channels into one score per entry pair:
//! semantic (embedding cosine), phonetic (DTW similarity over IPA), and
//! etymological (phylogenetic prior). Weights come from a fixed set of
//! named presets keyed to query intent; a missing phylogenetic distance
//! zeroes that channel and renormalizes the rest.

use std::str::FromStr;

use etymograph_core::SimilarityEdge;

use crate::concepts::cosine;
use crate::error::AnalysisError;
use crate::phonetic;
use crate::phylo::PhyloTable;

/// Named weight presets `(semantic, phonetic, etymological)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightPreset {
    /// General-purpose mix
    #[default]
    Balanced,
    /// Cognate hunting: phonetics dominates
    Cognate,
    /// Meaning-first search
    Semantic,
    /// Historical-linguistics intent: the tree matters most
    Historical,
}

impl WeightPreset {
    /// The preset's `(alpha, beta, gamma)`; each sums to 1.
    pub fn weights(&self) -> (f32, f32, f32) {
        match self {
            WeightPreset::Balanced => (0.4, 0.4, 0.2),
            WeightPreset::Cognate => (0.3, 0.6, 0.1),
            WeightPreset::Semantic => (0.7, 0.2, 0.1),
            WeightPreset::Historical => (0.1, 0.4, 0.5),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightPreset::Balanced => "balanced",
            WeightPreset::Cognate => "cognate",
            WeightPreset::Semantic => "semantic",
            WeightPreset::Historical => "historical",
        }
    }
}

impl FromStr for WeightPreset {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(WeightPreset::Balanced),
            "cognate" => Ok(WeightPreset::Cognate),
            "semantic" => Ok(WeightPreset::Semantic),
            "historical" => Ok(WeightPreset::Historical),
            other => Err(AnalysisError::UnknownPreset(other.to_string())),
        }
    }
}

/// The slice of an entry the composer needs.
#[derive(Debug, Clone)]
pub struct PairSide<'a> {
    pub entry_id: &'a str,
    pub language_code: &'a str,
    pub ipa: Option<&'a str>,
    pub embedding: Option<&'a [f32]>,
    pub concept_id: Option<&'a str>,
}

/// Combines per-channel similarities under a weight preset.
#[derive(Debug, Clone, Default)]
pub struct SimilarityComposer {
    phylo: Option<PhyloTable>,
}

impl SimilarityComposer {
    pub fn new() -> Self {
        Self { phylo: None }
    }

    /// Attach the precomputed phylogenetic table.
    pub fn with_phylo(mut self, table: PhyloTable) -> Self {
        self.phylo = Some(table);
        self
    }

    /// Compose one canonical similarity edge.
    ///
    /// Channels without data contribute zero; when the phylogenetic
    /// distance is unknown, gamma redistributes onto the other weights so
    /// the applied weights still sum to 1.
    pub fn compose(&self, a: &PairSide<'_>, b: &PairSide<'_>, preset: WeightPreset) -> SimilarityEdge {
        let semantic = match (a.embedding, b.embedding) {
            (Some(ea), Some(eb)) => cosine(ea, eb),
            _ => 0.0,
        };
        let phonetic = match (a.ipa, b.ipa) {
            (Some(ia), Some(ib)) => phonetic::similarity(ia, ib),
            _ => 0.0,
        };

        let phylo_pair = self
            .phylo
            .as_ref()
            .and_then(|table| table.lookup(a.language_code, b.language_code));

        let (alpha, beta, gamma) = preset.weights();
        let (alpha, beta, gamma, etymological) = match phylo_pair {
            Some(pair) => (alpha, beta, gamma, pair.prior),
            None => {
                // Renormalize the remaining channels
                let rest = alpha + beta;
                (alpha / rest, beta / rest, 0.0, 0.0)
            }
        };

        let combined =
            (alpha * semantic + beta * phonetic + gamma * etymological).clamp(0.0, 1.0);

        SimilarityEdge {
            entry_a: a.entry_id.to_string(),
            entry_b: b.entry_id.to_string(),
            semantic,
            phonetic,
            etymological,
            combined,
            weights: (alpha, beta, gamma),
            phylo_distance: phylo_pair.map(|p| p.tree_distance),
            concepts: match (a.concept_id, b.concept_id) {
                (Some(ca), Some(cb)) => Some((ca.to_string(), cb.to_string())),
                _ => None,
            },
        }
        .canonicalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side<'a>(
        id: &'a str,
        lang: &'a str,
        ipa: Option<&'a str>,
        embedding: Option<&'a [f32]>,
    ) -> PairSide<'a> {
        PairSide {
            entry_id: id,
            language_code: lang,
            ipa,
            embedding,
            concept_id: None,
        }
    }

    #[test]
    fn test_presets_sum_to_one() {
        for preset in [
            WeightPreset::Balanced,
            WeightPreset::Cognate,
            WeightPreset::Semantic,
            WeightPreset::Historical,
        ] {
            let (a, b, c) = preset.weights();
            assert!((a + b + c - 1.0).abs() < 1e-6, "{:?}", preset);
        }
    }

    #[test]
    fn test_preset_round_trip() {
        for name in ["balanced", "cognate", "semantic", "historical"] {
            let preset: WeightPreset = name.parse().unwrap();
            assert_eq!(preset.as_str(), name);
        }
        assert!("phonic".parse::<WeightPreset>().is_err());
    }

    #[test]
    fn test_compose_with_phylo() {
        let composer = SimilarityComposer::new()
            .with_phylo(PhyloTable::from_rows(&[("de", "en", 2, 0.8)]));
        let emb_a = [1.0f32, 0.0, 0.0];
        let emb_b = [0.9f32, 0.1, 0.0];

        let edge = composer.compose(
            &side("b_father", "en", Some("ˈfɑːðə"), Some(&emb_a)),
            &side("a_vater", "de", Some("ˈfaːtɐ"), Some(&emb_b)),
            WeightPreset::Balanced,
        );

        // Canonical ordering swapped the endpoints
        assert_eq!(edge.entry_a, "a_vater");
        assert_eq!(edge.entry_b, "b_father");
        assert_eq!(edge.phylo_distance, Some(2));
        assert!((edge.etymological - 0.8).abs() < 1e-6);
        assert!(edge.combined > 0.0 && edge.combined <= 1.0);
        let (a, b, c) = edge.weights;
        assert!((a + b + c - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_phylo_renormalizes() {
        let composer = SimilarityComposer::new();
        let emb = [1.0f32, 0.0];

        let edge = composer.compose(
            &side("a", "en", Some("pater"), Some(&emb)),
            &side("b", "xx", Some("pater"), Some(&emb)),
            WeightPreset::Balanced,
        );

        let (alpha, beta, gamma) = edge.weights;
        assert_eq!(gamma, 0.0);
        assert!((alpha - 0.5).abs() < 1e-6);
        assert!((beta - 0.5).abs() < 1e-6);
        assert_eq!(edge.etymological, 0.0);
        // Identical embeddings and IPA: combined is 1 under renormalized weights
        assert!((edge.combined - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_missing_channels_contribute_zero() {
        let composer = SimilarityComposer::new();
        let edge = composer.compose(
            &side("a", "en", None, None),
            &side("b", "de", None, None),
            WeightPreset::Cognate,
        );
        assert_eq!(edge.semantic, 0.0);
        assert_eq!(edge.phonetic, 0.0);
        assert_eq!(edge.combined, 0.0);
    }

    #[test]
    fn test_combined_in_unit_interval() {
        let composer = SimilarityComposer::new()
            .with_phylo(PhyloTable::from_rows(&[("de", "en", 1, 1.0)]));
        let emb = [1.0f32, 0.0];
        for preset in [
            WeightPreset::Balanced,
            WeightPreset::Cognate,
            WeightPreset::Semantic,
            WeightPreset::Historical,
        ] {
            let edge = composer.compose(
                &side("a", "en", Some("pater"), Some(&emb)),
                &side("b", "de", Some("pater"), Some(&emb)),
                preset,
            );
            assert!(edge.combined >= 0.0 && edge.combined <= 1.0);
        }
    }
}
