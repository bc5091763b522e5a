//! Variable feature selection with the variance-stabilizing ("vst") method.
//!
//! A loess trend of log10(variance) on log10(mean) is fitted over the raw counts. Each
//! gene is standardized with its expected variance, values are clipped from above, and
//! genes are ranked by the variance of the standardized values.

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::VstConfig;
use crate::error::{PipelineError, Result};
use crate::matrix::CountMatrix;
use crate::preprocessing::loess::loess_fit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneVariance {
    pub gene_index: usize,
    pub gene_id: String,
    pub mean: f64,
    pub variance: f64,
    pub variance_expected: f64,
    pub variance_standardized: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedFeature {
    /// 1 for the most variable gene.
    pub rank: usize,
    pub stats: GeneVariance,
}

/// Ranked selection of variable genes. A new run yields a new set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    features: Vec<SelectedFeature>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[SelectedFeature] {
        &self.features
    }

    /// Column indices into the count matrix, in rank order.
    pub fn gene_indices(&self) -> Vec<usize> {
        self.features.iter().map(|f| f.stats.gene_index).collect()
    }

    pub fn gene_ids(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.stats.gene_id.as_str()).collect()
    }

    pub fn top(&self, n: usize) -> &[SelectedFeature] {
        &self.features[..n.min(self.features.len())]
    }
}

/// Mean, variance and standardized variance of every gene.
pub fn gene_variance_stats(counts: &CountMatrix, config: &VstConfig) -> Result<Vec<GeneVariance>> {
    let n_cells = counts.n_cells();
    if n_cells < 2 {
        return Err(PipelineError::insufficient(format!(
            "variable feature selection needs at least 2 cells, got {n_cells}"
        )));
    }
    let n = n_cells as f64;
    let csc = counts.to_csc();

    let moments: Vec<(f64, f64)> = (0..counts.n_genes())
        .into_par_iter()
        .map(|g| {
            let col = csc.col(g);
            let (mut sum, mut sum_sq) = (0.0, 0.0);
            for &v in col.values() {
                let v = v as f64;
                sum += v;
                sum_sq += v * v;
            }
            let mean = sum / n;
            let variance = ((sum_sq - n * mean * mean) / (n - 1.0)).max(0.0);
            (mean, variance)
        })
        .collect();

    let varying: Vec<usize> = (0..moments.len()).filter(|&g| moments[g].1 > 0.0).collect();
    if varying.is_empty() {
        return Err(PipelineError::insufficient(
            "no gene has nonzero variance across the retained cells",
        ));
    }

    let log_mean: Vec<f64> = varying.iter().map(|&g| moments[g].0.log10()).collect();
    let log_var: Vec<f64> = varying.iter().map(|&g| moments[g].1.log10()).collect();
    let trend = loess_fit(&log_mean, &log_var, config.span);

    let mut expected = vec![0.0; moments.len()];
    for (k, &g) in varying.iter().enumerate() {
        expected[g] = 10f64.powf(trend[k]);
    }

    let clip = config.clip_max.unwrap_or_else(|| n.sqrt());
    debug!("vst: {} varying genes, clip at {clip}", varying.len());

    let stats = (0..counts.n_genes())
        .into_par_iter()
        .map(|g| {
            let (mean, variance) = moments[g];
            let variance_expected = expected[g];
            let variance_standardized = if variance_expected > 0.0 {
                let sd = variance_expected.sqrt();
                let col = csc.col(g);
                let mut acc = 0.0;
                for &v in col.values() {
                    let z = ((v as f64 - mean) / sd).min(clip);
                    acc += z * z;
                }
                let n_zero = (n_cells - col.nnz()) as f64;
                // zeros sit below the mean, so the upper clip never applies to them
                let z0 = mean / sd;
                acc += n_zero * z0 * z0;
                acc / (n - 1.0)
            } else {
                0.0
            };
            GeneVariance {
                gene_index: g,
                gene_id: counts.gene_ids()[g].clone(),
                mean,
                variance,
                variance_expected,
                variance_standardized,
            }
        })
        .collect();
    Ok(stats)
}

/// Top `n_features` genes by standardized variance; ties keep the lower gene index first.
///
/// When fewer genes are available than requested, all of them are returned.
pub fn find_variable_features(counts: &CountMatrix, config: &VstConfig) -> Result<FeatureSet> {
    let mut stats = gene_variance_stats(counts, config)?;
    stats.sort_by(|a, b| {
        b.variance_standardized
            .total_cmp(&a.variance_standardized)
            .then(a.gene_index.cmp(&b.gene_index))
    });

    let n_select = config.n_features.min(stats.len());
    if n_select < config.n_features {
        warn!(
            "requested {} variable features but only {} genes are available",
            config.n_features,
            stats.len()
        );
    }

    let features = stats
        .into_iter()
        .take(n_select)
        .enumerate()
        .map(|(i, stats)| SelectedFeature { rank: i + 1, stats })
        .collect();
    Ok(FeatureSet { features })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::ids;

    // gene0 bursts in a few cells, the others are flat-ish
    fn bursty_matrix() -> CountMatrix {
        let mut triplets = Vec::new();
        for cell in 0..30 {
            triplets.push((cell, 1, 5 + (cell % 3) as u32));
            triplets.push((cell, 2, 4 + (cell % 2) as u32));
            triplets.push((cell, 3, 1 + (cell % 4) as u32));
            if cell % 10 == 0 {
                triplets.push((cell, 0, 60));
            }
            if cell % 2 == 0 {
                triplets.push((cell, 4, 2));
            }
        }
        triplets.push((0, 5, 3));
        triplets.push((1, 5, 3));
        CountMatrix::from_triplets(&triplets, ids("cell", 30), ids("gene", 6)).unwrap()
    }

    #[test]
    fn selects_the_requested_number() {
        let config = VstConfig {
            n_features: 3,
            ..Default::default()
        };
        let set = find_variable_features(&bursty_matrix(), &config).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.features()[0].rank, 1);
        assert_eq!(set.gene_ids()[0], "gene0");
        let ranks: Vec<usize> = set.features().iter().map(|f| f.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn clamps_to_available_genes_and_is_deterministic() {
        let config = VstConfig::default();
        let a = find_variable_features(&bursty_matrix(), &config).unwrap();
        let b = find_variable_features(&bursty_matrix(), &config).unwrap();
        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
        for pair in a.features().windows(2) {
            assert!(pair[0].stats.variance_standardized >= pair[1].stats.variance_standardized);
        }
    }

    #[test]
    fn standardized_variance_respects_clip() {
        let config = VstConfig {
            clip_max: Some(1.0),
            ..Default::default()
        };
        let stats = gene_variance_stats(&bursty_matrix(), &config).unwrap();
        for s in &stats {
            // every squared standardized value is at most max(1, (mean/sd)^2)
            let bound = if s.variance_expected > 0.0 {
                1f64.max(s.mean * s.mean / s.variance_expected)
            } else {
                0.0
            };
            assert!(s.variance_standardized <= bound * 30.0 / 29.0 + 1e-9);
        }
    }

    #[test]
    fn single_cell_is_insufficient() {
        let m = CountMatrix::from_triplets(&[(0, 0, 1)], ids("c", 1), ids("g", 1)).unwrap();
        assert!(matches!(
            find_variable_features(&m, &VstConfig::default()),
            Err(PipelineError::InsufficientData(_))
        ));
    }
}
