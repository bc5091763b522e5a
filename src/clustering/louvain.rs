//! Louvain modularity optimization with a resolution parameter.
//!
//! Each level runs the local moving phase until no node moves in a full pass, then
//! collapses communities into super-nodes (self-loops hold the internal weight) and
//! repeats. Several seeded starts may run in parallel; the partition with the highest
//! modularity on the original graph wins, ties going to the lowest start.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::clustering::ClusterAssignment;
use crate::config::{LouvainConfig, NodeOrder};
use crate::error::{PipelineError, Result};
use crate::graph::NeighborGraphData;

const GAIN_EPSILON: f64 = 1e-12;

/// One level of the coarsening hierarchy.
#[derive(Debug, Clone)]
struct Level {
    adj: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    degree: Vec<f64>,
}

impl Level {
    fn from_graph(graph: &NeighborGraphData) -> Self {
        let adj: Vec<Vec<(usize, f64)>> = (0..graph.n_nodes())
            .map(|i| {
                let (nbrs, ws) = graph.neighbors(i);
                nbrs.iter().copied().zip(ws.iter().copied()).collect()
            })
            .collect();
        let degree = adj.iter().map(|row| row.iter().map(|e| e.1).sum()).collect();
        Self {
            self_loops: vec![0.0; adj.len()],
            adj,
            degree,
        }
    }

    fn len(&self) -> usize {
        self.adj.len()
    }

    fn total_weight(&self) -> f64 {
        self.degree.iter().sum()
    }

    fn aggregate(&self, community: &[usize], n_communities: usize) -> Level {
        let mut self_loops = vec![0.0; n_communities];
        let mut rows: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n_communities];
        for (i, row) in self.adj.iter().enumerate() {
            let ci = community[i];
            self_loops[ci] += self.self_loops[i];
            for &(j, w) in row {
                let cj = community[j];
                if ci == cj {
                    self_loops[ci] += w;
                } else {
                    *rows[ci].entry(cj).or_insert(0.0) += w;
                }
            }
        }
        let adj: Vec<Vec<(usize, f64)>> = rows
            .into_iter()
            .map(|row| row.into_iter().collect())
            .collect();
        let degree = adj
            .iter()
            .zip(&self_loops)
            .map(|(row, sl)| row.iter().map(|e| e.1).sum::<f64>() + sl)
            .collect();
        Level {
            adj,
            self_loops,
            degree,
        }
    }
}

struct MoveOutcome {
    community: Vec<usize>,
    moved: bool,
    converged: bool,
}

/// Greedy node moves until a full pass changes nothing or `max_passes` is reached.
fn local_moving(level: &Level, resolution: f64, order: &[usize], max_passes: usize) -> MoveOutcome {
    let n = level.len();
    let mut community: Vec<usize> = (0..n).collect();
    let m2 = level.total_weight();
    if m2 <= 0.0 {
        return MoveOutcome {
            community,
            moved: false,
            converged: true,
        };
    }

    let mut tot = level.degree.clone();
    let mut link = vec![0.0; n];
    let mut seen = vec![false; n];
    let mut touched: Vec<usize> = Vec::new();
    let mut moved = false;
    let mut converged = false;

    for pass in 0..max_passes {
        let mut moves = 0usize;
        for &i in order {
            let home = community[i];
            let ki = level.degree[i];

            touched.clear();
            for &(j, w) in &level.adj[i] {
                let c = community[j];
                if !seen[c] {
                    seen[c] = true;
                    touched.push(c);
                }
                link[c] += w;
            }

            tot[home] -= ki;
            let gain = |c: usize| link[c] - resolution * tot[c] * ki / m2;
            let mut best = home;
            let mut best_gain = gain(home);
            for &c in &touched {
                let g = gain(c);
                if g > best_gain + GAIN_EPSILON {
                    best = c;
                    best_gain = g;
                }
            }
            tot[best] += ki;
            community[i] = best;
            if best != home {
                moves += 1;
            }

            for &c in &touched {
                link[c] = 0.0;
                seen[c] = false;
            }
        }
        debug!("local moving pass {pass}: {moves} moves");
        if moves == 0 {
            converged = true;
            break;
        }
        moved = true;
    }

    MoveOutcome {
        community,
        moved,
        converged,
    }
}

/// Relabel to `0..k` in order of first appearance.
fn compact(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut map: Vec<Option<usize>> = vec![None; labels.iter().max().map_or(0, |m| m + 1)];
    let mut next = 0;
    let compacted = labels
        .iter()
        .map(|&l| {
            *map[l].get_or_insert_with(|| {
                next += 1;
                next - 1
            })
        })
        .collect();
    (compacted, next)
}

fn level_modularity(level: &Level, labels: &[usize], resolution: f64) -> f64 {
    let m2 = level.total_weight();
    if m2 <= 0.0 {
        return 0.0;
    }
    let k = labels.iter().max().map_or(0, |m| m + 1);
    let mut internal = vec![0.0; k];
    let mut totals = vec![0.0; k];
    for (i, row) in level.adj.iter().enumerate() {
        let c = labels[i];
        totals[c] += level.degree[i];
        internal[c] += level.self_loops[i];
        for &(j, w) in row {
            if labels[j] == c {
                internal[c] += w;
            }
        }
    }
    internal
        .iter()
        .zip(&totals)
        .map(|(&inside, &tot)| inside / m2 - resolution * (tot / m2) * (tot / m2))
        .sum()
}

/// Modularity of a partition of `graph` at the given resolution.
pub fn modularity(graph: &NeighborGraphData, labels: &[usize], resolution: f64) -> Result<f64> {
    if labels.len() != graph.n_nodes() {
        return Err(PipelineError::integrity(format!(
            "{} labels for a graph of {} nodes",
            labels.len(),
            graph.n_nodes()
        )));
    }
    Ok(level_modularity(&Level::from_graph(graph), labels, resolution))
}

fn run_once(base: &Level, config: &LouvainConfig, mut rng: Option<StdRng>) -> (Vec<usize>, bool) {
    let mut level = base.clone();
    let mut membership: Vec<usize> = (0..base.len()).collect();
    let mut converged = true;
    let mut settled = false;

    for depth in 0..config.max_levels {
        let mut order: Vec<usize> = (0..level.len()).collect();
        if let Some(rng) = rng.as_mut() {
            order.shuffle(rng);
        }
        let outcome = local_moving(&level, config.resolution, &order, config.max_passes);
        converged &= outcome.converged;

        let (community, n_communities) = compact(&outcome.community);
        if !outcome.moved || n_communities == level.len() {
            settled = true;
            break;
        }
        membership = membership.iter().map(|&m| community[m]).collect();
        debug!("level {depth}: {} -> {n_communities} nodes", level.len());
        level = level.aggregate(&community, n_communities);
    }

    (membership, converged && settled)
}

pub fn louvain(graph: &NeighborGraphData, config: &LouvainConfig) -> Result<ClusterAssignment> {
    if graph.n_nodes() == 0 {
        return Err(PipelineError::insufficient("cannot cluster an empty graph"));
    }
    if !(config.resolution.is_finite() && config.resolution > 0.0) {
        return Err(PipelineError::configuration(format!(
            "resolution must be positive, got {}",
            config.resolution
        )));
    }
    if config.n_starts == 0 || config.max_levels == 0 || config.max_passes == 0 {
        return Err(PipelineError::configuration(
            "n_starts, max_levels and max_passes must be at least 1",
        ));
    }

    let base = Level::from_graph(graph);
    let starts = match config.node_order {
        NodeOrder::Sequential => 1,
        NodeOrder::Random => config.n_starts,
    };

    let mut runs: Vec<(Vec<usize>, bool, f64)> = (0..starts)
        .into_par_iter()
        .map(|start| {
            let rng = match config.node_order {
                NodeOrder::Sequential => None,
                NodeOrder::Random => Some(StdRng::seed_from_u64(config.seed.wrapping_add(start as u64))),
            };
            let (labels, converged) = run_once(&base, config, rng);
            let q = level_modularity(&base, &labels, config.resolution);
            (labels, converged, q)
        })
        .collect();

    let mut best = 0;
    for (s, run) in runs.iter().enumerate().skip(1) {
        if run.2 > runs[best].2 {
            best = s;
        }
    }
    let (labels, converged, q) = runs.swap_remove(best);
    if !converged {
        warn!(
            "Louvain did not converge within {} levels / {} passes; returning best-effort partition",
            config.max_levels, config.max_passes
        );
    }

    let assignment = ClusterAssignment::from_raw_labels(
        graph.cell_ids().to_vec(),
        &labels,
        config.resolution,
        q,
        converged,
    )?;
    info!(
        "Louvain: {} clusters at resolution {} (modularity {q:.4}, {starts} starts)",
        assignment.n_clusters(),
        config.resolution
    );
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::graph_from_edges;
    use approx::assert_relative_eq;

    /// `count` cliques of `size` nodes, consecutive cliques joined by one edge in a ring.
    fn ring_of_cliques(count: usize, size: usize) -> NeighborGraphData {
        let mut edges = Vec::new();
        for c in 0..count {
            let base = c * size;
            for a in 0..size {
                for b in (a + 1)..size {
                    edges.push((base + a, base + b, 1.0));
                }
            }
            let next = ((c + 1) % count) * size;
            edges.push((base + size - 1, next, 1.0));
        }
        graph_from_edges(count * size, &edges)
    }

    fn sequential(resolution: f64) -> LouvainConfig {
        LouvainConfig {
            resolution,
            node_order: NodeOrder::Sequential,
            ..Default::default()
        }
    }

    #[test]
    fn recovers_cliques() {
        let graph = ring_of_cliques(6, 5);
        let result = louvain(&graph, &sequential(1.0)).unwrap();
        assert_eq!(result.n_clusters(), 6);
        assert!(result.converged());
        for c in 0..6 {
            let first = result.labels()[c * 5];
            assert!((0..5).all(|k| result.labels()[c * 5 + k] == first));
        }
    }

    #[test]
    fn level_limit_returns_unconverged_partition() {
        let graph = ring_of_cliques(6, 5);
        let config = LouvainConfig {
            max_levels: 1,
            ..sequential(1.0)
        };
        let result = louvain(&graph, &config).unwrap();
        assert!(!result.converged());
        assert!(result.modularity() > 0.0);
        assert!(result.n_clusters() < 30);
        for c in 0..6 {
            let first = result.labels()[c * 5];
            assert!((0..5).all(|k| result.labels()[c * 5 + k] == first));
        }
    }

    #[test]
    fn disconnected_components_never_merge() {
        let graph = graph_from_edges(4, &[(0, 1, 1.0), (2, 3, 1.0)]);
        let result = louvain(&graph, &sequential(0.01)).unwrap();
        assert_eq!(result.n_clusters(), 2);
        assert_eq!(result.labels()[0], result.labels()[1]);
        assert_ne!(result.labels()[1], result.labels()[2]);
    }

    #[test]
    fn resolution_does_not_reduce_cluster_count() {
        let graph = ring_of_cliques(6, 5);
        let counts: Vec<usize> = [0.05, 1.0, 3.0]
            .iter()
            .map(|&r| louvain(&graph, &sequential(r)).unwrap().n_clusters())
            .collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
        assert!(counts[0] < counts[2]);
    }

    #[test]
    fn seeded_random_order_is_reproducible() {
        let graph = ring_of_cliques(4, 6);
        let config = LouvainConfig {
            resolution: 1.0,
            n_starts: 4,
            seed: 9,
            ..Default::default()
        };
        let a = louvain(&graph, &config).unwrap();
        let b = louvain(&graph, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.n_clusters(), 4);
    }

    #[test]
    fn isolated_nodes_stay_singletons() {
        let graph = graph_from_edges(3, &[]);
        let result = louvain(&graph, &sequential(1.0)).unwrap();
        assert_eq!(result.n_clusters(), 3);
        assert_eq!(result.modularity(), 0.0);
    }

    #[test]
    fn modularity_of_two_cliques() {
        let graph = graph_from_edges(4, &[(0, 1, 1.0), (2, 3, 1.0)]);
        let q = modularity(&graph, &[0, 0, 1, 1], 1.0).unwrap();
        assert_relative_eq!(q, 0.5, epsilon = 1e-12);
        assert!(modularity(&graph, &[0, 0, 1], 1.0).is_err());
    }

    #[test]
    fn aggregation_preserves_total_weight() {
        let graph = ring_of_cliques(3, 4);
        let level = Level::from_graph(&graph);
        let labels: Vec<usize> = (0..12).map(|i| i / 4).collect();
        let coarse = level.aggregate(&labels, 3);
        assert_relative_eq!(coarse.total_weight(), level.total_weight(), epsilon = 1e-12);
        assert_relative_eq!(
            level_modularity(&coarse, &[0, 1, 2], 1.0),
            level_modularity(&level, &labels, 1.0),
            epsilon = 1e-12
        );
    }
}
