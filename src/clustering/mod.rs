//! Community detection over the neighbor graph and the resulting cell partitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub mod louvain;

pub use louvain::{louvain, modularity};

/// Numeric cluster id for every cell. Ids run `0..n_clusters` with cluster 0 the largest;
/// equal-sized clusters are ordered by their lowest member cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AssignmentRecord")]
pub struct ClusterAssignment {
    cell_ids: Vec<String>,
    labels: Vec<usize>,
    n_clusters: usize,
    resolution: f64,
    modularity: f64,
    converged: bool,
}

#[derive(Deserialize)]
struct AssignmentRecord {
    cell_ids: Vec<String>,
    labels: Vec<usize>,
    n_clusters: usize,
    resolution: f64,
    modularity: f64,
    converged: bool,
}

impl TryFrom<AssignmentRecord> for ClusterAssignment {
    type Error = PipelineError;

    /// Stored labels must already be dense: one per cell, each below `n_clusters`, and
    /// every cluster id in use.
    fn try_from(record: AssignmentRecord) -> Result<Self> {
        if record.labels.len() != record.cell_ids.len() {
            return Err(PipelineError::integrity(format!(
                "{} labels for {} cells",
                record.labels.len(),
                record.cell_ids.len()
            )));
        }
        let mut used = vec![false; record.n_clusters];
        for (cell, &label) in record.labels.iter().enumerate() {
            let slot = used.get_mut(label).ok_or_else(|| {
                PipelineError::integrity(format!(
                    "cell {cell} has cluster {label} but only {} clusters exist",
                    record.n_clusters
                ))
            })?;
            *slot = true;
        }
        if let Some(empty) = used.iter().position(|&u| !u) {
            return Err(PipelineError::integrity(format!("cluster {empty} has no cells")));
        }
        Ok(Self {
            cell_ids: record.cell_ids,
            labels: record.labels,
            n_clusters: record.n_clusters,
            resolution: record.resolution,
            modularity: record.modularity,
            converged: record.converged,
        })
    }
}

impl ClusterAssignment {
    /// Build from arbitrary community labels, renumbering them by decreasing size.
    pub fn from_raw_labels(
        cell_ids: Vec<String>,
        raw: &[usize],
        resolution: f64,
        modularity: f64,
        converged: bool,
    ) -> Result<Self> {
        if cell_ids.len() != raw.len() {
            return Err(PipelineError::integrity(format!(
                "{} labels for {} cells",
                raw.len(),
                cell_ids.len()
            )));
        }

        // (size, first member) per raw label
        let mut groups: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for (cell, &label) in raw.iter().enumerate() {
            groups.entry(label).or_insert((0, cell)).0 += 1;
        }
        let mut order: Vec<(usize, usize, usize)> =
            groups.into_iter().map(|(label, (size, first))| (label, size, first)).collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        let remap: BTreeMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(new, &(label, _, _))| (label, new))
            .collect();

        Ok(Self {
            labels: raw.iter().map(|l| remap[l]).collect(),
            n_clusters: order.len(),
            cell_ids,
            resolution,
            modularity,
            converged,
        })
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn modularity(&self) -> f64 {
        self.modularity
    }

    /// False when the optimizer hit its level or pass limit before settling.
    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn cluster_of(&self, cell_id: &str) -> Option<usize> {
        self.cell_ids
            .iter()
            .position(|id| id == cell_id)
            .map(|i| self.labels[i])
    }

    /// Row indices of the cells in `cluster`, ascending.
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l == cluster).then_some(i))
            .collect()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }

    /// Map numeric ids to external names. Returns a new labeled copy; every cluster id
    /// present must have a name.
    pub fn rename_clusters(&self, names: &BTreeMap<usize, String>) -> Result<LabeledAssignment> {
        if let Some(missing) = (0..self.n_clusters).find(|c| !names.contains_key(c)) {
            return Err(PipelineError::configuration(format!(
                "no label given for cluster {missing}"
            )));
        }
        Ok(LabeledAssignment {
            cell_ids: self.cell_ids.clone(),
            labels: self.labels.iter().map(|l| names[l].clone()).collect(),
        })
    }
}

/// Cluster assignment after mapping numeric ids to names (e.g. cell types).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledAssignment {
    cell_ids: Vec<String>,
    labels: Vec<String>,
}

impl LabeledAssignment {
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label_of(&self, cell_id: &str) -> Option<&str> {
        self.cell_ids
            .iter()
            .position(|id| id == cell_id)
            .map(|i| self.labels[i].as_str())
    }
}
