//! Concept alignment
//!
//! Clusters entry embeddings into cross-lingual concepts:
//!
//! 1. Seeded Gaussian random projection down to ~10 dimensions. The seed is
//!    fixed per run, so the projection (and everything downstream) is fully
//!    deterministic.
//! 2. DBSCAN over the projected space with `min_samples` density and a
//!    `min_cluster_size` floor; label −1 is unclustered noise.
//! 3. Per cluster: centroid = mean of member embeddings in the full space,
//!    languages covered, and confidence = fraction of core points.
//!
//! After discovery, [`ConceptAligner::assign`] places new embeddings by
//! nearest-centroid cosine with a minimum similarity threshold.

use std::collections::{BTreeMap, HashMap};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use etymograph_core::{hex_encode, Concept};

use crate::error::{AnalysisError, Result};

/// Noise label used by DBSCAN
const NOISE: i64 = -1;

/// Parameters for concept discovery.
#[derive(Debug, Clone)]
pub struct AlignerConfig {
    /// Target dimensionality of the projection
    pub projection_dim: usize,
    /// Projection seed; fixed for reproducible clustering
    pub seed: u64,
    /// DBSCAN neighborhood radius in the projected space
    pub eps: f32,
    /// DBSCAN core-point density
    pub min_samples: usize,
    /// Clusters smaller than this dissolve into noise
    pub min_cluster_size: usize,
    /// Minimum cosine similarity for `assign`
    pub min_assign_similarity: f32,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            projection_dim: 10,
            seed: 0x45_74_79_6d,
            eps: 0.45,
            min_samples: 3,
            min_cluster_size: 3,
            min_assign_similarity: 0.5,
        }
    }
}

/// An entry participating in alignment.
#[derive(Debug, Clone)]
pub struct AlignInput {
    pub entry_id: String,
    pub language_code: String,
    pub embedding: Vec<f32>,
}

/// Outcome of a discovery run.
#[derive(Debug, Clone, Default)]
pub struct Alignment {
    pub concepts: Vec<Concept>,
    /// entry id → (concept id, confidence); unclustered entries absent
    pub assignments: HashMap<String, (String, f32)>,
}

/// Cross-lingual concept discovery and assignment.
pub struct ConceptAligner {
    config: AlignerConfig,
    /// Discovered concepts, in deterministic order
    concepts: Vec<Concept>,
}

impl ConceptAligner {
    pub fn new(config: AlignerConfig) -> Self {
        Self {
            config,
            concepts: Vec::new(),
        }
    }

    /// Discovered concepts (empty before `discover`).
    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    /// Run discovery over a set of embedded entries.
    pub fn discover(&mut self, inputs: &[AlignInput]) -> Result<Alignment> {
        if inputs.is_empty() {
            self.concepts.clear();
            return Ok(Alignment::default());
        }
        let dim = inputs[0].embedding.len();
        for input in inputs {
            if input.embedding.len() != dim {
                return Err(AnalysisError::DimensionMismatch {
                    a: dim,
                    b: input.embedding.len(),
                });
            }
        }

        // Deterministic input order: sort by entry id before anything else
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        order.sort_by(|&a, &b| inputs[a].entry_id.cmp(&inputs[b].entry_id));

        let projected = self.project(&order, inputs, dim);
        let labels = self.dbscan(&projected);

        // Collect members per cluster label
        let mut members: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (pos, &label) in labels.iter().enumerate() {
            if label != NOISE {
                members.entry(label).or_default().push(pos);
            }
        }

        let core = self.core_points(&projected);
        let mut alignment = Alignment::default();

        for positions in members.values() {
            if positions.len() < self.config.min_cluster_size {
                continue;
            }

            // Centroid in the full embedding space
            let mut centroid = vec![0.0f32; dim];
            for &pos in positions {
                let emb = &inputs[order[pos]].embedding;
                for (c, v) in centroid.iter_mut().zip(emb.iter()) {
                    *c += v;
                }
            }
            for c in centroid.iter_mut() {
                *c /= positions.len() as f32;
            }

            let mut languages: Vec<String> = positions
                .iter()
                .map(|&pos| inputs[order[pos]].language_code.clone())
                .collect();
            languages.sort();
            languages.dedup();

            let core_count = positions.iter().filter(|&&pos| core[pos]).count();
            let confidence = core_count as f32 / positions.len() as f32;

            // Concept id hashes the sorted member set: identical parameters
            // and inputs rebuild identical ids
            let mut hasher = Sha256::new();
            for &pos in positions {
                hasher.update(inputs[order[pos]].entry_id.as_bytes());
                hasher.update(b"\n");
            }
            let concept_id = format!("c{}", &hex_encode(&hasher.finalize())[..16]);

            for &pos in positions {
                alignment.assignments.insert(
                    inputs[order[pos]].entry_id.clone(),
                    (concept_id.clone(), confidence),
                );
            }

            alignment.concepts.push(Concept {
                concept_id,
                centroid_vector: centroid,
                member_count: positions.len(),
                languages_present: languages,
                confidence,
            });
        }

        info!(
            "concept discovery: {} concepts from {} entries ({} unclustered)",
            alignment.concepts.len(),
            inputs.len(),
            inputs.len() - alignment.assignments.len()
        );
        self.concepts = alignment.concepts.clone();
        Ok(alignment)
    }

    /// Nearest-centroid assignment for a new embedding.
    ///
    /// Returns `None` when no centroid clears the similarity threshold.
    pub fn assign(&self, embedding: &[f32]) -> Option<(String, f32)> {
        let mut best: Option<(&Concept, f32)> = None;
        for concept in &self.concepts {
            let sim = cosine(embedding, &concept.centroid_vector);
            match best {
                Some((_, best_sim)) if sim <= best_sim => {}
                _ => best = Some((concept, sim)),
            }
        }
        best.and_then(|(concept, sim)| {
            (sim >= self.config.min_assign_similarity)
                .then(|| (concept.concept_id.clone(), sim))
        })
    }

    /// Seeded Gaussian random projection, rows follow `order`.
    fn project(&self, order: &[usize], inputs: &[AlignInput], dim: usize) -> Vec<Vec<f32>> {
        let target = self.config.projection_dim.min(dim);
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        // Projection matrix: dim × target, Box-Muller gaussians
        let scale = 1.0 / (target as f32).sqrt();
        let mut matrix = vec![vec![0.0f32; target]; dim];
        for row in matrix.iter_mut() {
            for cell in row.iter_mut() {
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen_range(0.0..1.0);
                *cell = scale
                    * (-2.0 * u1.ln()).sqrt()
                    * (2.0 * std::f32::consts::PI * u2).cos();
            }
        }

        debug!(
            "projecting {} embeddings {} → {} dims (seed {})",
            order.len(),
            dim,
            target,
            self.config.seed
        );

        order
            .iter()
            .map(|&idx| {
                let emb = &inputs[idx].embedding;
                let mut out = vec![0.0f32; target];
                for (value, row) in emb.iter().zip(matrix.iter()) {
                    for (o, m) in out.iter_mut().zip(row.iter()) {
                        *o += value * m;
                    }
                }
                out
            })
            .collect()
    }

    /// Which points have at least `min_samples` neighbors within `eps`.
    fn core_points(&self, points: &[Vec<f32>]) -> Vec<bool> {
        let eps2 = self.config.eps * self.config.eps;
        (0..points.len())
            .map(|i| {
                let neighbors = (0..points.len())
                    .filter(|&j| j != i && sq_dist(&points[i], &points[j]) <= eps2)
                    .count();
                neighbors + 1 >= self.config.min_samples
            })
            .collect()
    }

    /// Plain DBSCAN; expansion order is index order, so labels are
    /// deterministic for a fixed input order.
    fn dbscan(&self, points: &[Vec<f32>]) -> Vec<i64> {
        let n = points.len();
        let eps2 = self.config.eps * self.config.eps;
        let core = self.core_points(points);

        let mut labels = vec![NOISE; n];
        let mut next_label = 0i64;

        for start in 0..n {
            if labels[start] != NOISE || !core[start] {
                continue;
            }
            // Grow a new cluster from this core point
            let label = next_label;
            next_label += 1;
            labels[start] = label;
            let mut frontier = vec![start];

            while let Some(current) = frontier.pop() {
                if !core[current] {
                    continue;
                }
                for other in 0..n {
                    if labels[other] == NOISE
                        && sq_dist(&points[current], &points[other]) <= eps2
                    {
                        labels[other] = label;
                        frontier.push(other);
                    }
                }
            }
        }
        labels
    }
}

/// Cosine similarity clamped to [0, 1].
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well-separated blobs in 32 dims plus one outlier.
    fn blob_inputs() -> Vec<AlignInput> {
        let mut inputs = Vec::new();
        for i in 0..5 {
            let mut emb = vec![0.0f32; 32];
            emb[0] = 10.0 + i as f32 * 0.01;
            emb[1] = 10.0;
            inputs.push(AlignInput {
                entry_id: format!("kin_{}", i),
                language_code: if i % 2 == 0 { "en" } else { "de" }.to_string(),
                embedding: emb,
            });
        }
        for i in 0..5 {
            let mut emb = vec![0.0f32; 32];
            emb[2] = -10.0 - i as f32 * 0.01;
            emb[3] = 8.0;
            inputs.push(AlignInput {
                entry_id: format!("water_{}", i),
                language_code: if i % 2 == 0 { "la" } else { "grc" }.to_string(),
                embedding: emb,
            });
        }
        let mut outlier = vec![0.0f32; 32];
        outlier[4] = 3.0;
        outlier[5] = -7.0;
        inputs.push(AlignInput {
            entry_id: "stray".to_string(),
            language_code: "eu".to_string(),
            embedding: outlier,
        });
        inputs
    }

    fn config() -> AlignerConfig {
        AlignerConfig {
            eps: 2.0,
            min_samples: 3,
            min_cluster_size: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_discovers_two_concepts() {
        let mut aligner = ConceptAligner::new(config());
        let alignment = aligner.discover(&blob_inputs()).unwrap();

        assert_eq!(alignment.concepts.len(), 2);
        assert!(!alignment.assignments.contains_key("stray"));

        let kin_concept = &alignment.assignments["kin_0"].0;
        for i in 1..5 {
            assert_eq!(&alignment.assignments[&format!("kin_{}", i)].0, kin_concept);
        }
        assert_ne!(kin_concept, &alignment.assignments["water_0"].0);
    }

    #[test]
    fn test_concept_metadata() {
        let mut aligner = ConceptAligner::new(config());
        let alignment = aligner.discover(&blob_inputs()).unwrap();
        let kin_id = &alignment.assignments["kin_0"].0;
        let kin = alignment
            .concepts
            .iter()
            .find(|c| &c.concept_id == kin_id)
            .unwrap();

        assert_eq!(kin.member_count, 5);
        assert_eq!(kin.languages_present, vec!["de", "en"]);
        assert!(kin.confidence > 0.0 && kin.confidence <= 1.0);
        // Centroid is the member mean in the full space
        assert!((kin.centroid_vector[0] - 10.02).abs() < 0.01);
        assert!((kin.centroid_vector[1] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_discovery_deterministic_under_permutation() {
        let mut aligner = ConceptAligner::new(config());
        let forward = aligner.discover(&blob_inputs()).unwrap();

        let mut reversed_inputs = blob_inputs();
        reversed_inputs.reverse();
        let mut aligner2 = ConceptAligner::new(config());
        let backward = aligner2.discover(&reversed_inputs).unwrap();

        let ids_a: Vec<&String> = forward.concepts.iter().map(|c| &c.concept_id).collect();
        let ids_b: Vec<&String> = backward.concepts.iter().map(|c| &c.concept_id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_assign_nearest_centroid() {
        let mut aligner = ConceptAligner::new(config());
        let alignment = aligner.discover(&blob_inputs()).unwrap();
        let kin_id = alignment.assignments["kin_0"].0.clone();

        let mut probe = vec![0.0f32; 32];
        probe[0] = 9.5;
        probe[1] = 10.5;
        let (assigned, sim) = aligner.assign(&probe).unwrap();
        assert_eq!(assigned, kin_id);
        assert!(sim > 0.9);

        // Orthogonal probe falls below the threshold
        let mut stranger = vec![0.0f32; 32];
        stranger[30] = 1.0;
        assert!(aligner.assign(&stranger).is_none());
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let mut aligner = ConceptAligner::new(config());
        let inputs = vec![
            AlignInput {
                entry_id: "a".into(),
                language_code: "en".into(),
                embedding: vec![0.0; 8],
            },
            AlignInput {
                entry_id: "b".into(),
                language_code: "en".into(),
                embedding: vec![0.0; 9],
            },
        ];
        assert!(matches!(
            aligner.discover(&inputs),
            Err(AnalysisError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_cosine_bounds() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine(&[1.0, 0.0], &[-1.0, 0.0]), 0.0); // clamped
        assert_eq!(cosine(&[], &[]), 0.0);
    }
}
