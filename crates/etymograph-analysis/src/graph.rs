//! Cognate graph kernel
//!
//! Builds an undirected similarity graph from weighted entry-pair edges and
//! runs the derived-view algorithms: connected components (cognate sets),
//! greedy modularity community detection, and PageRank.
//!
//! Everything here is deterministic: node insertion is sorted, component
//! ids canonicalize by smallest member id, and community ties break toward
//! the lower node id, so labels are invariant under edge permutations.

use std::collections::{BTreeMap, HashMap};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use sha2::{Digest, Sha256};
use tracing::debug;

use etymograph_core::{hex_encode, CognateCluster};

/// Default PageRank damping factor
pub const DEFAULT_DAMPING: f64 = 0.85;

/// Default PageRank iteration cap
pub const DEFAULT_MAX_ITER: usize = 100;

/// An undirected similarity graph over entry ids.
pub struct CognateGraph {
    graph: UnGraph<String, f64>,
    /// Entry id → node index, sorted insertion for determinism
    index: BTreeMap<String, NodeIndex>,
}

impl CognateGraph {
    /// Build from weighted edges, keeping only `weight >= threshold`.
    ///
    /// Self-loops are dropped; parallel edges keep the higher weight.
    pub fn from_edges(edges: &[(String, String, f64)], threshold: f64) -> Self {
        let mut kept: BTreeMap<(String, String), f64> = BTreeMap::new();
        for (u, v, w) in edges {
            if *w < threshold || u == v {
                continue;
            }
            // Canonical endpoint order doubles as the dedup key
            let key = if u < v {
                (u.clone(), v.clone())
            } else {
                (v.clone(), u.clone())
            };
            let entry = kept.entry(key).or_insert(*w);
            if *w > *entry {
                *entry = *w;
            }
        }

        let mut graph = UnGraph::new_undirected();
        let mut index = BTreeMap::new();
        // Insert nodes in sorted id order regardless of edge order
        for (u, v) in kept.keys() {
            for id in [u, v] {
                if !index.contains_key(id) {
                    let node = graph.add_node(id.clone());
                    index.insert(id.clone(), node);
                }
            }
        }
        for ((u, v), w) in &kept {
            graph.add_edge(index[u], index[v], *w);
        }

        debug!(
            "cognate graph: {} nodes, {} edges at threshold {}",
            graph.node_count(),
            graph.edge_count(),
            threshold
        );
        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Connected components with canonical labels.
    ///
    /// Components are numbered in ascending order of their smallest member
    /// id, so the labeling does not depend on input order.
    pub fn connected_components(&self) -> HashMap<String, usize> {
        let mut union = petgraph::unionfind::UnionFind::new(self.graph.node_count());
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                union.union(a.index(), b.index());
            }
        }

        // Group ids by their union-find root
        let mut members: BTreeMap<usize, Vec<&String>> = BTreeMap::new();
        for (id, node) in &self.index {
            members.entry(union.find(node.index())).or_default().push(id);
        }

        // Canonical order: sort components by their smallest member id
        let mut components: Vec<Vec<&String>> = members.into_values().collect();
        components.sort_by(|a, b| a[0].cmp(b[0]));

        let mut labels = HashMap::with_capacity(self.graph.node_count());
        for (label, component) in components.iter().enumerate() {
            for id in component {
                labels.insert((*id).clone(), label);
            }
        }
        labels
    }

    /// Greedy modularity community detection.
    ///
    /// Local-moving over nodes in sorted id order until no move improves
    /// modularity; gain ties break toward the community containing the
    /// lowest node id. Final labels canonicalize like components.
    pub fn detect_communities(&self) -> HashMap<String, usize> {
        let n = self.graph.node_count();
        if n == 0 {
            return HashMap::new();
        }

        let total_weight: f64 = self
            .graph
            .edge_indices()
            .map(|e| self.graph[e])
            .sum::<f64>()
            .max(f64::MIN_POSITIVE);

        // Weighted degree per node
        let mut degree = vec![0.0f64; n];
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                let w = self.graph[edge];
                degree[a.index()] += w;
                degree[b.index()] += w;
            }
        }

        // Start with one community per node
        let mut community: Vec<usize> = (0..n).collect();
        let mut community_degree = degree.clone();

        // Sorted iteration order: node indices follow sorted-id insertion
        let order: Vec<NodeIndex> = self.index.values().copied().collect();

        let mut improved = true;
        let mut rounds = 0usize;
        while improved && rounds < 50 {
            improved = false;
            rounds += 1;

            for &node in &order {
                let ni = node.index();
                let current = community[ni];

                // Weight from this node into each neighboring community
                let mut neighbor_weight: BTreeMap<usize, f64> = BTreeMap::new();
                for edge in self.graph.edges(node) {
                    let other = if edge.source() == node {
                        edge.target()
                    } else {
                        edge.source()
                    };
                    *neighbor_weight
                        .entry(community[other.index()])
                        .or_insert(0.0) += *edge.weight();
                }

                community_degree[current] -= degree[ni];

                // Modularity gain of joining each candidate community;
                // BTreeMap iteration makes tie-breaking deterministic
                // (lowest community id wins on equal gain).
                let mut best_community = current;
                let mut best_gain = neighbor_weight.get(&current).copied().unwrap_or(0.0)
                    - degree[ni] * community_degree[current] / (2.0 * total_weight);
                for (&cand, &weight_in) in &neighbor_weight {
                    let gain =
                        weight_in - degree[ni] * community_degree[cand] / (2.0 * total_weight);
                    if gain > best_gain + 1e-12 {
                        best_gain = gain;
                        best_community = cand;
                    }
                }

                community_degree[best_community] += degree[ni];
                if best_community != current {
                    community[ni] = best_community;
                    improved = true;
                }
            }
        }

        // Canonicalize: collect members per community, sort by smallest id
        let mut members: BTreeMap<usize, Vec<&String>> = BTreeMap::new();
        for (id, node) in &self.index {
            members.entry(community[node.index()]).or_default().push(id);
        }
        let mut groups: Vec<Vec<&String>> = members.into_values().collect();
        groups.sort_by(|a, b| a[0].cmp(b[0]));

        let mut labels = HashMap::with_capacity(n);
        for (label, group) in groups.iter().enumerate() {
            for id in group {
                labels.insert((*id).clone(), label);
            }
        }
        labels
    }

    /// PageRank with uniform teleport.
    pub fn pagerank(&self, damping: f64, max_iter: usize, tol: f64) -> HashMap<String, f64> {
        let n = self.graph.node_count();
        if n == 0 {
            return HashMap::new();
        }

        let mut degree = vec![0.0f64; n];
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                let w = self.graph[edge];
                degree[a.index()] += w;
                degree[b.index()] += w;
            }
        }

        let uniform = 1.0 / n as f64;
        let mut rank = vec![uniform; n];

        for _ in 0..max_iter {
            let mut next = vec![(1.0 - damping) * uniform; n];
            let mut dangling = 0.0f64;

            for node in self.graph.node_indices() {
                let ni = node.index();
                if degree[ni] <= 0.0 {
                    dangling += rank[ni];
                    continue;
                }
                for edge in self.graph.edges(node) {
                    let other = if edge.source() == node {
                        edge.target()
                    } else {
                        edge.source()
                    };
                    next[other.index()] += damping * rank[ni] * edge.weight() / degree[ni];
                }
            }

            // Dangling mass redistributes uniformly
            let dangling_share = damping * dangling * uniform;
            for value in next.iter_mut() {
                *value += dangling_share;
            }

            let delta: f64 = next
                .iter()
                .zip(rank.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            rank = next;
            if delta < tol {
                break;
            }
        }

        self.index
            .iter()
            .map(|(id, node)| (id.clone(), rank[node.index()]))
            .collect()
    }

    /// Assemble cognate clusters from connected components.
    ///
    /// `languages` maps entry ids to their language codes; the
    /// representative is the member with the highest PageRank (ties to the
    /// lower id), and confidence is the mean weight of intra-cluster edges.
    pub fn clusters(&self, languages: &HashMap<String, String>) -> Vec<CognateCluster> {
        let components = self.connected_components();
        let rank = self.pagerank(DEFAULT_DAMPING, DEFAULT_MAX_ITER, 1e-9);

        let mut by_label: BTreeMap<usize, Vec<&String>> = BTreeMap::new();
        for id in self.index.keys() {
            by_label.entry(components[id]).or_default().push(id);
        }

        let mut clusters = Vec::with_capacity(by_label.len());
        for (label, members) in by_label {
            let mut member_ids: Vec<String> = members.iter().map(|s| (*s).clone()).collect();
            member_ids.sort();

            let representative = member_ids
                .iter()
                .max_by(|a, b| {
                    let ra = rank.get(*a).copied().unwrap_or(0.0);
                    let rb = rank.get(*b).copied().unwrap_or(0.0);
                    ra.partial_cmp(&rb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.cmp(a))
                })
                .cloned()
                .unwrap_or_default();

            let mut langs: Vec<String> = member_ids
                .iter()
                .filter_map(|id| languages.get(id).cloned())
                .collect();
            langs.sort();
            langs.dedup();

            // Mean intra-cluster edge weight
            let mut weight_sum = 0.0f64;
            let mut weight_count = 0usize;
            for edge in self.graph.edge_indices() {
                if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                    if components[&self.graph[a]] == label && components[&self.graph[b]] == label {
                        weight_sum += self.graph[edge];
                        weight_count += 1;
                    }
                }
            }
            let confidence = if weight_count == 0 {
                0.0
            } else {
                (weight_sum / weight_count as f64) as f32
            };

            let mut hasher = Sha256::new();
            for id in &member_ids {
                hasher.update(id.as_bytes());
                hasher.update(b"\n");
            }
            let cluster_id = hex_encode(&hasher.finalize())[..16].to_string();

            clusters.push(CognateCluster {
                cluster_id,
                concept_id: None,
                size: member_ids.len(),
                representative,
                languages: langs,
                confidence,
                members: member_ids,
            });
        }
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges() -> Vec<(String, String, f64)> {
        vec![
            ("eng_father".into(), "deu_vater".into(), 0.85),
            ("eng_father".into(), "lat_pater".into(), 0.82),
            ("deu_vater".into(), "lat_pater".into(), 0.79),
            ("eng_mother".into(), "deu_mutter".into(), 0.88),
        ]
    }

    #[test]
    fn test_threshold_filters_edges() {
        let graph = CognateGraph::from_edges(&edges(), 0.8);
        assert_eq!(graph.edge_count(), 3);
        let graph = CognateGraph::from_edges(&edges(), 0.7);
        assert_eq!(graph.edge_count(), 4);
    }

    #[test]
    fn test_components_match_expected_cognate_sets() {
        let graph = CognateGraph::from_edges(&edges(), 0.7);
        let labels = graph.connected_components();

        assert_eq!(labels["eng_father"], labels["deu_vater"]);
        assert_eq!(labels["eng_father"], labels["lat_pater"]);
        assert_eq!(labels["eng_mother"], labels["deu_mutter"]);
        assert_ne!(labels["eng_father"], labels["eng_mother"]);
    }

    #[test]
    fn test_component_labels_invariant_under_permutation() {
        let forward = CognateGraph::from_edges(&edges(), 0.7).connected_components();
        let mut shuffled = edges();
        shuffled.reverse();
        let backward = CognateGraph::from_edges(&shuffled, 0.7).connected_components();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_community_labels_invariant_under_permutation() {
        let forward = CognateGraph::from_edges(&edges(), 0.7).detect_communities();
        let mut shuffled = edges();
        shuffled.swap(0, 3);
        shuffled.swap(1, 2);
        let backward = CognateGraph::from_edges(&shuffled, 0.7).detect_communities();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_communities_separate_father_and_mother() {
        let graph = CognateGraph::from_edges(&edges(), 0.7);
        let labels = graph.detect_communities();
        assert_eq!(labels["eng_father"], labels["deu_vater"]);
        assert_ne!(labels["eng_father"], labels["eng_mother"]);
    }

    #[test]
    fn test_pagerank_sums_to_one() {
        let graph = CognateGraph::from_edges(&edges(), 0.7);
        let rank = graph.pagerank(DEFAULT_DAMPING, DEFAULT_MAX_ITER, 1e-9);
        let total: f64 = rank.values().sum();
        assert!((total - 1.0).abs() < 1e-6, "rank sum {}", total);
        // The best-connected node outranks a leaf
        assert!(rank["eng_father"] > rank["eng_mother"] * 0.5);
    }

    #[test]
    fn test_clusters_assembled() {
        let graph = CognateGraph::from_edges(&edges(), 0.7);
        let languages: HashMap<String, String> = [
            ("eng_father", "en"),
            ("deu_vater", "de"),
            ("lat_pater", "la"),
            ("eng_mother", "en"),
            ("deu_mutter", "de"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let clusters = graph.clusters(&languages);
        assert_eq!(clusters.len(), 2);

        let father = clusters.iter().find(|c| c.size == 3).unwrap();
        assert_eq!(father.languages, vec!["de", "en", "la"]);
        assert!(father.confidence > 0.7);
        assert!(father.members.contains(&"lat_pater".to_string()));

        // Cluster ids are deterministic across rebuilds
        let again = CognateGraph::from_edges(&edges(), 0.7).clusters(&languages);
        let father_again = again.iter().find(|c| c.size == 3).unwrap();
        assert_eq!(father.cluster_id, father_again.cluster_id);
    }

    #[test]
    fn test_self_loops_dropped() {
        let graph = CognateGraph::from_edges(
            &[("a".into(), "a".into(), 0.9), ("a".into(), "b".into(), 0.9)],
            0.5,
        );
        assert_eq!(graph.edge_count(), 1);
    }
}
