//! Phylogenetic prior table
//!
//! The external phylogenetic service produces, offline, a table of
//! pairwise tree distances between languages and a derived prior on
//! relatedness. The at-rest format is CSV rows
//! `(lang_a, lang_b, tree_distance, prior)` with `lang_a < lang_b`;
//! this module only reads it.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::{AnalysisError, Result};

/// One row of the precomputed table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhyloPair {
    /// Integer distance in the language-family tree
    pub tree_distance: u32,
    /// Relatedness prior in [0, 1]
    pub prior: f32,
}

/// In-memory lookup over the precomputed distance table.
#[derive(Debug, Clone, Default)]
pub struct PhyloTable {
    pairs: HashMap<(String, String), PhyloPair>,
}

impl PhyloTable {
    /// Load the table from its CSV at-rest format.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader =
            csv::Reader::from_path(path).map_err(|e| AnalysisError::PhyloTable {
                path: path.display().to_string(),
                message: format!("cannot open: {}", e),
            })?;

        let mut pairs = HashMap::new();
        for (idx, row) in reader.records().enumerate() {
            let row = row.map_err(|e| AnalysisError::PhyloTable {
                path: path.display().to_string(),
                message: format!("row {}: {}", idx + 2, e),
            })?;
            let field = |i: usize| row.get(i).map(str::trim).unwrap_or("");
            let lang_a = field(0).to_lowercase();
            let lang_b = field(1).to_lowercase();
            if lang_a.is_empty() || lang_b.is_empty() {
                continue;
            }
            let tree_distance: u32 =
                field(2).parse().map_err(|_| AnalysisError::PhyloTable {
                    path: path.display().to_string(),
                    message: format!("row {}: bad tree_distance '{}'", idx + 2, field(2)),
                })?;
            let prior: f32 = field(3).parse().map_err(|_| AnalysisError::PhyloTable {
                path: path.display().to_string(),
                message: format!("row {}: bad prior '{}'", idx + 2, field(3)),
            })?;

            pairs.insert(
                canonical_pair(&lang_a, &lang_b),
                PhyloPair {
                    tree_distance,
                    prior: prior.clamp(0.0, 1.0),
                },
            );
        }

        info!("phylo table loaded: {} language pairs", pairs.len());
        Ok(Self { pairs })
    }

    /// Build from in-memory rows (tests, fixtures).
    pub fn from_rows(rows: &[(&str, &str, u32, f32)]) -> Self {
        let pairs = rows
            .iter()
            .map(|(a, b, distance, prior)| {
                (
                    canonical_pair(a, b),
                    PhyloPair {
                        tree_distance: *distance,
                        prior: prior.clamp(0.0, 1.0),
                    },
                )
            })
            .collect();
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Look up a pair; order of arguments does not matter. The distance of
    /// a language to itself is 0 with prior 1.
    pub fn lookup(&self, lang_a: &str, lang_b: &str) -> Option<PhyloPair> {
        if lang_a.eq_ignore_ascii_case(lang_b) {
            return Some(PhyloPair {
                tree_distance: 0,
                prior: 1.0,
            });
        }
        self.pairs
            .get(&canonical_pair(&lang_a.to_lowercase(), &lang_b.to_lowercase()))
            .copied()
    }
}

fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lookup_symmetric() {
        let table = PhyloTable::from_rows(&[("de", "en", 2, 0.8), ("en", "la", 5, 0.4)]);
        assert_eq!(table.lookup("en", "de"), table.lookup("de", "en"));
        assert_eq!(table.lookup("en", "de").unwrap().tree_distance, 2);
        assert!(table.lookup("en", "zu").is_none());
    }

    #[test]
    fn test_self_distance_zero() {
        let table = PhyloTable::default();
        let own = table.lookup("en", "EN").unwrap();
        assert_eq!(own.tree_distance, 0);
        assert_eq!(own.prior, 1.0);
    }

    #[test]
    fn test_load_csv() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "lang_a,lang_b,tree_distance,prior").unwrap();
        writeln!(f, "de,en,2,0.8").unwrap();
        writeln!(f, "en,la,5,0.4").unwrap();
        let table = PhyloTable::load_csv(f.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("la", "en").unwrap().tree_distance, 5);
    }

    #[test]
    fn test_bad_row_is_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "lang_a,lang_b,tree_distance,prior").unwrap();
        writeln!(f, "de,en,not-a-number,0.8").unwrap();
        assert!(PhyloTable::load_csv(f.path()).is_err());
    }
}
