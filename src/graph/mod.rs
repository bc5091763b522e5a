//! Cell-cell neighbor graph built in PCA space.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{NeighborConfig, NeighborSearch};
use crate::error::{PipelineError, Result};
use crate::reduction::Embedding;

pub mod knn;
pub mod snn;

pub use knn::{KnnResult, approximate_knn, exact_knn};

/// Undirected weighted graph over cells in compressed row form. Every edge is stored in
/// both directions with the same weight; there are no self-loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphRecord")]
pub struct NeighborGraphData {
    cell_ids: Vec<String>,
    offsets: Vec<usize>,
    neighbors: Vec<usize>,
    weights: Vec<f64>,
    knn: Option<KnnResult>,
}

/// Serialized form of [`NeighborGraphData`], checked before it becomes a graph.
#[derive(Deserialize)]
struct GraphRecord {
    cell_ids: Vec<String>,
    offsets: Vec<usize>,
    neighbors: Vec<usize>,
    weights: Vec<f64>,
    knn: Option<KnnResult>,
}

impl TryFrom<GraphRecord> for NeighborGraphData {
    type Error = PipelineError;

    fn try_from(record: GraphRecord) -> Result<Self> {
        let graph = Self {
            cell_ids: record.cell_ids,
            offsets: record.offsets,
            neighbors: record.neighbors,
            weights: record.weights,
            knn: record.knn,
        };
        graph.check_layout()?;
        graph.validate()?;
        Ok(graph)
    }
}

impl NeighborGraphData {
    /// Build from adjacency rows, checking symmetry, bounds and the absence of self-loops.
    pub fn from_adjacency(cell_ids: Vec<String>, rows: Vec<Vec<(usize, f64)>>) -> Result<Self> {
        if cell_ids.len() != rows.len() {
            return Err(PipelineError::integrity(format!(
                "{} adjacency rows for {} cells",
                rows.len(),
                cell_ids.len()
            )));
        }
        let graph = Self::from_rows_unchecked(cell_ids, rows);
        graph.validate()?;
        Ok(graph)
    }

    fn from_rows_unchecked(cell_ids: Vec<String>, rows: Vec<Vec<(usize, f64)>>) -> Self {
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut neighbors = Vec::new();
        let mut weights = Vec::new();
        offsets.push(0);
        for mut row in rows {
            row.sort_by_key(|&(j, _)| j);
            for (j, w) in row {
                neighbors.push(j);
                weights.push(w);
            }
            offsets.push(neighbors.len());
        }
        Self {
            cell_ids,
            offsets,
            neighbors,
            weights,
            knn: None,
        }
    }

    /// Offsets, row order and lengths of a graph that did not come from adjacency rows.
    fn check_layout(&self) -> Result<()> {
        if self.offsets.first() != Some(&0) {
            return Err(PipelineError::integrity("graph offsets must start at 0"));
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(PipelineError::integrity("graph offsets must be non-decreasing"));
        }
        if self.offsets.last() != Some(&self.neighbors.len()) || self.weights.len() != self.neighbors.len() {
            return Err(PipelineError::integrity(format!(
                "offsets cover {} edges but {} neighbors and {} weights are stored",
                self.offsets.last().copied().unwrap_or(0),
                self.neighbors.len(),
                self.weights.len()
            )));
        }
        let n = self.n_nodes();
        if self.cell_ids.len() != n {
            return Err(PipelineError::integrity(format!(
                "{} cell ids for {n} nodes",
                self.cell_ids.len()
            )));
        }
        if let Some(i) = (0..n).find(|&i| self.neighbors(i).0.windows(2).any(|w| w[0] >= w[1])) {
            return Err(PipelineError::integrity(format!(
                "neighbors of node {i} are not strictly increasing"
            )));
        }
        if let Some(knn) = &self.knn {
            if knn.n_cells() != n || knn.distances.len() != n {
                return Err(PipelineError::integrity(format!(
                    "k-NN lists cover {} cells, graph has {n}",
                    knn.n_cells()
                )));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let n = self.n_nodes();
        for i in 0..n {
            let (nbrs, ws) = self.neighbors(i);
            for (&j, &w) in nbrs.iter().zip(ws) {
                if j >= n {
                    return Err(PipelineError::integrity(format!("edge ({i}, {j}) leaves the graph")));
                }
                if j == i {
                    return Err(PipelineError::integrity(format!("self-loop on node {i}")));
                }
                if !(w.is_finite() && w > 0.0) {
                    return Err(PipelineError::integrity(format!("edge ({i}, {j}) has weight {w}")));
                }
                if self.edge_weight(j, i) != Some(w) {
                    return Err(PipelineError::integrity(format!("edge ({i}, {j}) is not symmetric")));
                }
            }
        }
        Ok(())
    }

    pub fn n_nodes(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Number of undirected edges.
    pub fn n_edges(&self) -> usize {
        self.neighbors.len() / 2
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Raw k-NN lists the graph was refined from, when built from an embedding.
    pub fn knn(&self) -> Option<&KnnResult> {
        self.knn.as_ref()
    }

    pub fn neighbors(&self, node: usize) -> (&[usize], &[f64]) {
        let range = self.offsets[node]..self.offsets[node + 1];
        (&self.neighbors[range.clone()], &self.weights[range])
    }

    pub fn degree(&self, node: usize) -> usize {
        self.offsets[node + 1] - self.offsets[node]
    }

    pub fn weighted_degree(&self, node: usize) -> f64 {
        self.neighbors(node).1.iter().sum()
    }

    pub fn edge_weight(&self, a: usize, b: usize) -> Option<f64> {
        let (nbrs, ws) = self.neighbors(a);
        nbrs.binary_search(&b).ok().map(|pos| ws[pos])
    }

    pub fn is_symmetric(&self) -> bool {
        (0..self.n_nodes()).all(|i| {
            let (nbrs, ws) = self.neighbors(i);
            nbrs.iter()
                .zip(ws)
                .all(|(&j, &w)| self.edge_weight(j, i) == Some(w))
        })
    }
}

/// k-NN search over the leading components followed by Jaccard refinement.
pub fn build_neighbor_graph(embedding: &Embedding, config: &NeighborConfig) -> Result<NeighborGraphData> {
    let n = embedding.cell_ids().len();
    if n < 2 {
        return Err(PipelineError::insufficient(format!(
            "a neighbor graph needs at least 2 cells, got {n}"
        )));
    }
    if config.k == 0 {
        return Err(PipelineError::configuration("neighbor_k must be at least 1"));
    }
    let dims = config.dims.min(embedding.n_components());
    if dims < config.dims {
        warn!(
            "requested {} dimensions for the neighbor search, embedding has {dims}",
            config.dims
        );
    }
    if config.k > n - 1 {
        warn!("neighbor_k = {} exceeds the {} other cells; clamping", config.k, n - 1);
    }

    let points = embedding.leading(dims);
    let knn = match config.search {
        NeighborSearch::Exact => exact_knn(points, config.k),
        NeighborSearch::Hnsw => approximate_knn(points, config.k, config.seed),
    };
    let rows = snn::jaccard_rows(&knn, config.prune_snn);

    let mut graph = NeighborGraphData::from_rows_unchecked(embedding.cell_ids().to_vec(), rows);
    graph.knn = Some(knn);
    info!(
        "SNN graph: {} cells, {} edges (k = {}, {dims} dims)",
        graph.n_nodes(),
        graph.n_edges(),
        config.k.min(n - 1)
    );
    Ok(graph)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn graph_from_edges(n: usize, edges: &[(usize, usize, f64)]) -> NeighborGraphData {
        let mut rows = vec![Vec::new(); n];
        for &(a, b, w) in edges {
            rows[a].push((b, w));
            rows[b].push((a, w));
        }
        let ids = (0..n).map(|i| format!("cell{i}")).collect();
        NeighborGraphData::from_adjacency(ids, rows).unwrap()
    }

    #[test]
    fn adjacency_is_validated() {
        let ids: Vec<String> = vec!["a".into(), "b".into()];
        let asymmetric = vec![vec![(1, 1.0)], vec![]];
        assert!(NeighborGraphData::from_adjacency(ids.clone(), asymmetric).is_err());
        let self_loop = vec![vec![(0, 1.0)], vec![]];
        assert!(NeighborGraphData::from_adjacency(ids.clone(), self_loop).is_err());

        let g = NeighborGraphData::from_adjacency(ids, vec![vec![(1, 0.5)], vec![(0, 0.5)]]).unwrap();
        assert_eq!(g.n_edges(), 1);
        assert_eq!(g.edge_weight(1, 0), Some(0.5));
        assert_eq!(g.edge_weight(0, 0), None);
        assert!(g.is_symmetric());
    }

    #[test]
    fn json_round_trip_is_exact() {
        let g = graph_from_edges(3, &[(0, 1, 1.0 / 3.0), (1, 2, 0.1 + 0.2)]);
        let json = serde_json::to_string(&g).unwrap();
        let back: NeighborGraphData = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let cases = [
            // one-directional edge
            r#"{"cell_ids":["a","b"],"offsets":[0,1,1],"neighbors":[1],"weights":[0.5],"knn":null}"#,
            // no offsets at all
            r#"{"cell_ids":[],"offsets":[],"neighbors":[],"weights":[],"knn":null}"#,
            // self-loop
            r#"{"cell_ids":["a"],"offsets":[0,1],"neighbors":[0],"weights":[1.0],"knn":null}"#,
            // neighbor out of range
            r#"{"cell_ids":["a","b"],"offsets":[0,1,2],"neighbors":[1,4],"weights":[1.0,1.0],"knn":null}"#,
            // offsets past the stored edges
            r#"{"cell_ids":["a","b"],"offsets":[0,1,3],"neighbors":[1,0],"weights":[1.0,1.0],"knn":null}"#,
            // weights missing
            r#"{"cell_ids":["a","b"],"offsets":[0,1,2],"neighbors":[1,0],"weights":[1.0],"knn":null}"#,
            // ids do not match the node count
            r#"{"cell_ids":["a"],"offsets":[0,1,2],"neighbors":[1,0],"weights":[1.0,1.0],"knn":null}"#,
        ];
        for json in cases {
            let parsed: std::result::Result<NeighborGraphData, _> = serde_json::from_str(json);
            assert!(parsed.is_err(), "accepted {json}");
        }

        let ok = r#"{"cell_ids":["a","b"],"offsets":[0,1,2],"neighbors":[1,0],"weights":[0.5,0.5],"knn":null}"#;
        let g: NeighborGraphData = serde_json::from_str(ok).unwrap();
        assert!(g.is_symmetric());
        assert_eq!(g.n_nodes(), 2);
    }
}
