//! Phonetic distance kernel
//!
//! Dynamic time warping over IPA phone sequences. Local cost is a weighted
//! L1 over the articulatory feature delta; insertions and deletions pay a
//! fixed gap cost. The kernel is deterministic, symmetric, and zero on
//! identical inputs; the batch API parallelizes with rayon.

pub mod features;

pub use features::{parse_ipa, Phone, FEATURE_DIM, FEATURE_WEIGHTS};

use rayon::prelude::*;

/// DTW parameters.
#[derive(Debug, Clone, Copy)]
pub struct DtwConfig {
    /// Cost of inserting or deleting one phone
    pub gap_cost: f32,
    /// Substitution cost whenever a wildcard phone is involved
    pub wildcard_cost: f32,
    /// Per-feature weights for the local cost
    pub weights: [f32; FEATURE_DIM],
}

impl Default for DtwConfig {
    fn default() -> Self {
        Self {
            gap_cost: 3.0,
            wildcard_cost: 1.5,
            weights: FEATURE_WEIGHTS,
        }
    }
}

impl DtwConfig {
    /// Local substitution cost between two phones.
    fn local_cost(&self, a: &Phone, b: &Phone) -> f32 {
        match (a, b) {
            (Phone::Known(fa), Phone::Known(fb)) => fa
                .iter()
                .zip(fb.iter())
                .zip(self.weights.iter())
                .map(|((x, y), w)| (x - y).abs() * w)
                .sum(),
            // Wildcards match anything at a fixed penalty
            _ => self.wildcard_cost,
        }
    }

    /// Upper bound on the alignment cost of two sequences: the all-gap
    /// path. Used to normalize distance into a similarity.
    fn max_cost(&self, len_a: usize, len_b: usize) -> f32 {
        (len_a + len_b) as f32 * self.gap_cost
    }
}

/// DTW alignment cost between two IPA strings.
pub fn distance(a: &str, b: &str) -> f32 {
    distance_with(&DtwConfig::default(), a, b)
}

/// DTW alignment cost with explicit parameters.
pub fn distance_with(config: &DtwConfig, a: &str, b: &str) -> f32 {
    let pa = parse_ipa(a);
    let pb = parse_ipa(b);
    dtw_cost(config, &pa, &pb)
}

/// Normalized similarity in [0, 1]: `1 − cost / max_cost(|a|, |b|)`.
pub fn similarity(a: &str, b: &str) -> f32 {
    similarity_with(&DtwConfig::default(), a, b)
}

/// Normalized similarity with explicit parameters.
pub fn similarity_with(config: &DtwConfig, a: &str, b: &str) -> f32 {
    let pa = parse_ipa(a);
    let pb = parse_ipa(b);
    if pa.is_empty() && pb.is_empty() {
        return 1.0;
    }
    let cost = dtw_cost(config, &pa, &pb);
    let max_cost = config.max_cost(pa.len(), pb.len());
    (1.0 - cost / max_cost).clamp(0.0, 1.0)
}

/// Batch similarity over N pairs, data-parallel.
pub fn similarity_batch(pairs: &[(String, String)]) -> Vec<f32> {
    let config = DtwConfig::default();
    pairs
        .par_iter()
        .map(|(a, b)| similarity_with(&config, a, b))
        .collect()
}

/// The DP core. Two rolling rows; no per-call allocation beyond them.
fn dtw_cost(config: &DtwConfig, a: &[Phone], b: &[Phone]) -> f32 {
    if a.is_empty() {
        return b.len() as f32 * config.gap_cost;
    }
    if b.is_empty() {
        return a.len() as f32 * config.gap_cost;
    }

    let cols = b.len() + 1;
    let mut prev: Vec<f32> = (0..cols).map(|j| j as f32 * config.gap_cost).collect();
    let mut curr: Vec<f32> = vec![0.0; cols];

    for (i, pa) in a.iter().enumerate() {
        curr[0] = (i + 1) as f32 * config.gap_cost;
        for (j, pb) in b.iter().enumerate() {
            let substitute = prev[j] + config.local_cost(pa, pb);
            let delete = prev[j + 1] + config.gap_cost;
            let insert = curr[j] + config.gap_cost;
            curr[j + 1] = substitute.min(delete).min(insert);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[cols - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_zero() {
        assert_eq!(distance("pater", "pater"), 0.0);
        assert_eq!(similarity("pater", "pater"), 1.0);
    }

    #[test]
    fn test_symmetry() {
        let ab = distance("pater", "vater");
        let ba = distance("vater", "pater");
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn test_related_forms_are_similar() {
        // The classic Latin/Sanskrit pair
        let sim = similarity("pater", "pitar");
        assert!(sim > 0.6, "pater/pitar similarity {} too low", sim);
    }

    #[test]
    fn test_unrelated_forms_are_less_similar() {
        let related = similarity("pater", "vater");
        let unrelated = similarity("pater", "muter");
        assert!(related > unrelated);
    }

    #[test]
    fn test_gap_cost_applies_to_length_difference() {
        let d = distance("a", "aa");
        let config = DtwConfig::default();
        assert!((d - config.gap_cost).abs() < 1e-6);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(similarity("", ""), 1.0);
        let d = distance("", "ab");
        assert!((d - 2.0 * DtwConfig::default().gap_cost).abs() < 1e-6);
    }

    #[test]
    fn test_wildcard_penalty_bounded() {
        // "5" is not IPA; it matches at the wildcard penalty instead of
        // blowing up the distance
        let sim = similarity("pa5er", "pater");
        assert!(sim > 0.5);
    }

    #[test]
    fn test_batch_matches_single() {
        let pairs = vec![
            ("pater".to_string(), "vater".to_string()),
            ("mater".to_string(), "muter".to_string()),
        ];
        let batch = similarity_batch(&pairs);
        assert_eq!(batch.len(), 2);
        assert!((batch[0] - similarity("pater", "vater")).abs() < 1e-6);
        assert!((batch[1] - similarity("mater", "muter")).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic_across_runs() {
        let a = similarity_batch(&[("ˈfɑːðə".to_string(), "ˈfaːtɐ".to_string())]);
        let b = similarity_batch(&[("ˈfɑːðə".to_string(), "ˈfaːtɐ".to_string())]);
        assert_eq!(a, b);
    }
}
