//! Differential expression between cell groups (marker genes).
//!
//! Genes are prefiltered on detection rate and fold change, then tested; the multiple
//! testing correction runs over the genes that were actually tested.

use std::cmp::Ordering;

use log::{debug, info};
use nalgebra_sparse::CscMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::clustering::ClusterAssignment;
use crate::config::MarkerConfig;
use crate::error::{PipelineError, Result};
use crate::preprocessing::NormalizedMatrix;
use crate::testing::effect::{detection_rates, log2_fold_change, roc_power};
use crate::testing::inference::MatrixStatTests;
use crate::testing::utils::GroupMembership;
use crate::testing::TestMethod;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerResult {
    pub gene_index: usize,
    pub gene_id: String,
    pub avg_log2fc: f64,
    /// Fraction of group cells expressing the gene.
    pub pct_in: f64,
    /// Fraction of reference cells expressing the gene.
    pub pct_out: f64,
    pub p_value: f64,
    pub p_value_adj: f64,
    /// Area under the ROC curve for rank-based tests.
    pub auc: Option<f64>,
}

impl MarkerResult {
    pub fn power(&self) -> Option<f64> {
        self.auc.map(roc_power)
    }
}

/// Ranked markers of one group against its reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerTable {
    pub cluster: Option<usize>,
    pub group_size: usize,
    pub reference_size: usize,
    pub method: TestMethod,
    results: Vec<MarkerResult>,
}

impl MarkerTable {
    pub fn results(&self) -> &[MarkerResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn top(&self, n: usize) -> &[MarkerResult] {
        &self.results[..n.min(self.results.len())]
    }

    pub fn get(&self, gene_id: &str) -> Option<&MarkerResult> {
        self.results.iter().find(|r| r.gene_id == gene_id)
    }
}

fn validate(config: &MarkerConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&config.min_pct) {
        return Err(PipelineError::configuration(format!(
            "min_pct must lie in [0, 1], got {}",
            config.min_pct
        )));
    }
    if !(config.logfc_threshold >= 0.0) {
        return Err(PipelineError::configuration(format!(
            "logfc_threshold must be non-negative, got {}",
            config.logfc_threshold
        )));
    }
    if !(config.pseudocount.is_finite() && config.pseudocount > 0.0) {
        return Err(PipelineError::configuration(format!(
            "pseudocount must be positive, got {}",
            config.pseudocount
        )));
    }
    Ok(())
}

fn check_group(name: &str, cells: &[usize], n_cells: usize) -> Result<()> {
    if cells.is_empty() {
        return Err(PipelineError::insufficient(format!("{name} group has no cells")));
    }
    if let Some(&bad) = cells.iter().find(|&&c| c >= n_cells) {
        return Err(PipelineError::integrity(format!(
            "{name} group names cell {bad}, matrix has {n_cells}"
        )));
    }
    Ok(())
}

fn rank(results: &mut [MarkerResult], method: TestMethod) {
    results.sort_by(|a, b| {
        let primary = match method {
            TestMethod::Roc => b.power().unwrap_or(0.0).total_cmp(&a.power().unwrap_or(0.0)),
            _ => a
                .p_value_adj
                .total_cmp(&b.p_value_adj)
                .then(b.avg_log2fc.abs().total_cmp(&a.avg_log2fc.abs())),
        };
        match primary {
            Ordering::Equal => a.gene_index.cmp(&b.gene_index),
            other => other,
        }
    });
}

fn markers_on(
    csc: &CscMatrix<f64>,
    gene_ids: &[String],
    group: &[usize],
    reference: &[usize],
    config: &MarkerConfig,
) -> Result<MarkerTable> {
    let membership = GroupMembership::new(csc.nrows(), group, reference)?;

    // (gene, log2fc, pct_in, pct_out) of genes passing the prefilters
    let candidates: Vec<(usize, f64, f64, f64)> = (0..csc.ncols())
        .into_par_iter()
        .filter_map(|gene| {
            let split = membership.split_column(csc, gene);
            let (pct_in, pct_out) = detection_rates(&split);
            if pct_in.max(pct_out) < config.min_pct {
                return None;
            }
            let lfc = log2_fold_change(&split, config.pseudocount);
            if lfc.abs() < config.logfc_threshold || (config.only_pos && lfc <= 0.0) {
                return None;
            }
            Some((gene, lfc, pct_in, pct_out))
        })
        .collect();
    debug!(
        "{} of {} genes pass the detection and fold-change filters",
        candidates.len(),
        csc.ncols()
    );

    let genes: Vec<usize> = candidates.iter().map(|c| c.0).collect();
    let tests =
        csc.differential_expression(&genes, group, reference, config.test_method, config.correction)?;

    let mut results: Vec<MarkerResult> = candidates
        .iter()
        .enumerate()
        .map(|(i, &(gene, lfc, pct_in, pct_out))| MarkerResult {
            gene_index: gene,
            gene_id: gene_ids[gene].clone(),
            avg_log2fc: lfc,
            pct_in,
            pct_out,
            p_value: tests.p_values[i],
            p_value_adj: tests.adjusted_p_values[i],
            auc: match config.test_method {
                TestMethod::TTest(_) => None,
                TestMethod::MannWhitney | TestMethod::Roc => tests.effect_sizes[i],
            },
        })
        .collect();
    rank(&mut results, config.test_method);

    Ok(MarkerTable {
        cluster: None,
        group_size: membership.n1(),
        reference_size: membership.n2(),
        method: config.test_method,
        results,
    })
}

/// Markers of `group` (row indices of `normalized`) against `reference`, or against all
/// other cells when no reference is given. The two sets must be disjoint.
pub fn find_markers(
    normalized: &NormalizedMatrix,
    group: &[usize],
    reference: Option<&[usize]>,
    config: &MarkerConfig,
) -> Result<MarkerTable> {
    validate(config)?;
    let n = normalized.n_cells();
    check_group("test", group, n)?;

    let mut in_group = vec![false; n];
    for &c in group {
        in_group[c] = true;
    }
    let reference: Vec<usize> = match reference {
        Some(cells) => {
            check_group("reference", cells, n)?;
            if let Some(&shared) = cells.iter().find(|&&c| in_group[c]) {
                return Err(PipelineError::configuration(format!(
                    "cell {shared} is in both the test and the reference group"
                )));
            }
            cells.to_vec()
        }
        None => (0..n).filter(|&c| !in_group[c]).collect(),
    };
    check_group("reference", &reference, n)?;

    markers_on(&normalized.to_csc(), normalized.gene_ids(), group, &reference, config)
}

/// One marker table per cluster, each cluster against all other cells, in cluster order.
///
/// Cancellation is checked before each cluster; nothing is returned on cancellation.
pub fn find_all_markers(
    normalized: &NormalizedMatrix,
    assignment: &ClusterAssignment,
    config: &MarkerConfig,
    cancel: &CancellationToken,
) -> Result<Vec<MarkerTable>> {
    validate(config)?;
    if assignment.cell_ids() != normalized.cell_ids() {
        return Err(PipelineError::integrity(
            "cluster assignment and normalized matrix name different cells",
        ));
    }
    if assignment.n_clusters() < 2 {
        return Err(PipelineError::insufficient(
            "marker search needs at least two clusters",
        ));
    }

    let csc = normalized.to_csc();
    let mut tables = Vec::with_capacity(assignment.n_clusters());
    for cluster in 0..assignment.n_clusters() {
        cancel.check("find_all_markers")?;
        let group = assignment.members(cluster);
        let reference: Vec<usize> = assignment
            .labels()
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l != cluster).then_some(i))
            .collect();
        let mut table = markers_on(&csc, normalized.gene_ids(), &group, &reference, config)?;
        table.cluster = Some(cluster);
        debug!("cluster {cluster}: {} markers", table.len());
        tables.push(table);
    }

    info!(
        "marker search: {} clusters, {} markers in total",
        tables.len(),
        tables.iter().map(MarkerTable::len).sum::<usize>()
    );
    Ok(tables)
}
