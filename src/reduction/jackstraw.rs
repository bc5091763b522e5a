//! JackStraw resampling test for principal component significance.
//!
//! Each replicate permutes a small random subset of features across cells and recomputes
//! the decomposition; the permuted features' absolute loadings form the null distribution
//! for every component.

use log::info;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::config::{JackStrawConfig, PcaConfig};
use crate::error::{PipelineError, Result};
use crate::preprocessing::ScaledMatrix;
use crate::reduction::pca::{Embedding, centered_matrix, truncated_svd};
use crate::testing::inference::discrete::proportion_test;

#[derive(Debug, Clone, PartialEq)]
pub struct JackStrawResult {
    /// Features x components empirical p-values of the observed loadings.
    pub empirical_p_values: Array2<f64>,
    /// Significance of each component: proportion test of features with
    /// p <= `score_thresh` against the uniform expectation.
    pub component_p_values: Vec<f64>,
    pub replicates: usize,
}

impl JackStrawResult {
    pub fn n_components(&self) -> usize {
        self.component_p_values.len()
    }

    /// Components whose score is below `alpha`, in component order.
    pub fn significant_components(&self, alpha: f64) -> Vec<usize> {
        self.component_p_values
            .iter()
            .enumerate()
            .filter_map(|(k, &p)| (p < alpha).then_some(k))
            .collect()
    }
}

/// Absolute loadings of the permuted features for one replicate, per component.
fn replicate_null(
    scaled: &Array2<f64>,
    dims: usize,
    n_permuted: usize,
    pca: &PcaConfig,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let p = scaled.ncols();
    let mut features: Vec<usize> = (0..p).collect();
    features.shuffle(&mut rng);
    features.truncate(n_permuted);
    features.sort_unstable();

    let mut permuted = scaled.clone();
    for &f in &features {
        let mut column: Vec<f64> = permuted.column(f).to_vec();
        column.shuffle(&mut rng);
        for (i, v) in column.into_iter().enumerate() {
            permuted[[i, f]] = v;
        }
    }

    let svd = truncated_svd(&centered_matrix(&permuted), dims, pca.max_iter, pca.tolerance, pca.seed)?;
    Ok((0..dims)
        .map(|k| {
            features
                .iter()
                .map(|&f| if k < svd.v.ncols() { svd.v[(f, k)].abs() } else { 0.0 })
                .collect()
        })
        .collect())
}

pub fn jackstraw(
    scaled: &ScaledMatrix,
    embedding: &Embedding,
    dims: usize,
    pca: &PcaConfig,
    config: &JackStrawConfig,
    cancel: &CancellationToken,
) -> Result<JackStrawResult> {
    config.validate()?;
    cancel.check("jackstraw")?;
    if embedding.feature_ids() != scaled.feature_ids() || embedding.cell_ids() != scaled.cell_ids() {
        return Err(PipelineError::integrity(
            "embedding was not computed from this scaled matrix",
        ));
    }
    if dims == 0 || dims > embedding.n_components() {
        return Err(PipelineError::configuration(format!(
            "JackStraw dims must lie in 1..={}, got {dims}",
            embedding.n_components()
        )));
    }

    let p = scaled.n_features();
    let n_permuted = ((p as f64 * config.prop_freq).round() as usize).max(3).min(p);

    let nulls: Vec<Vec<Vec<f64>>> = (0..config.replicates)
        .into_par_iter()
        .map(|r| {
            cancel.check("jackstraw")?;
            replicate_null(
                scaled.data(),
                dims,
                n_permuted,
                pca,
                config.seed.wrapping_add(r as u64 + 1),
            )
        })
        .collect::<Result<_>>()?;

    let mut empirical_p_values = Array2::<f64>::zeros((p, dims));
    let mut component_p_values = Vec::with_capacity(dims);
    for k in 0..dims {
        let mut null: Vec<f64> = nulls.iter().flat_map(|rep| rep[k].iter().copied()).collect();
        null.sort_by(|a, b| a.total_cmp(b));
        let total = null.len() as f64;

        let mut n_significant = 0usize;
        for f in 0..p {
            let observed = embedding.loadings()[[f, k]].abs();
            let greater = null.len() - null.partition_point(|&v| v <= observed);
            let pval = greater as f64 / total;
            empirical_p_values[[f, k]] = pval;
            if pval <= config.score_thresh {
                n_significant += 1;
            }
        }

        let expected = (p as f64 * config.score_thresh).floor() as usize;
        let test = proportion_test(n_significant, p, expected, p);
        component_p_values.push(test.p_value);
    }

    info!(
        "JackStraw: {} replicates over {dims} components, {n_permuted} permuted features each",
        config.replicates
    );
    Ok(JackStrawResult {
        empirical_p_values,
        component_p_values,
        replicates: config.replicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScaleConfig, VstConfig};
    use crate::matrix::CountMatrix;
    use crate::matrix::metadata::CellMetadata;
    use crate::matrix::tests::ids;
    use crate::preprocessing::{cell_stats, find_variable_features, log_normalize, scale_data};
    use crate::reduction::pca::run_pca;

    fn two_block_scaled() -> ScaledMatrix {
        let mut triplets = Vec::new();
        for cell in 0..40usize {
            let block = cell / 20;
            for gene in 0..30usize {
                let in_block = gene < 10 && block == 0 || (10..20).contains(&gene) && block == 1;
                let count = if in_block {
                    15 + ((cell * 7 + gene * 3) % 9) as u32
                } else {
                    ((cell * 13 + gene * 5) % 4 == 0) as u32
                };
                if count > 0 {
                    triplets.push((cell, gene, count));
                }
            }
        }
        let counts = CountMatrix::from_triplets(&triplets, ids("cell", 40), ids("gene", 30)).unwrap();
        let metadata = CellMetadata::from_records(cell_stats(&counts, "MT-"));
        let normalized = log_normalize(&counts, 1e4).unwrap();
        let features = find_variable_features(&counts, &VstConfig::default()).unwrap();
        scale_data(&normalized, &features, &metadata, &ScaleConfig::default()).unwrap()
    }

    #[test]
    fn first_component_is_significant() {
        let scaled = two_block_scaled();
        let pca = PcaConfig {
            n_components: 5,
            ..Default::default()
        };
        let embedding = run_pca(&scaled, &pca).unwrap();
        let config = JackStrawConfig {
            replicates: 20,
            prop_freq: 0.1,
            score_thresh: 0.05,
            seed: 11,
        };
        let result = jackstraw(&scaled, &embedding, 3, &pca, &config, &CancellationToken::new()).unwrap();
        assert_eq!(result.n_components(), 3);
        assert_eq!(result.empirical_p_values.dim(), (scaled.n_features(), 3));
        assert!(result.empirical_p_values.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert!(result.component_p_values[0] < 1e-3);
        assert!(result.significant_components(0.01).contains(&0));
    }

    #[test]
    fn cancelled_token_aborts() {
        let scaled = two_block_scaled();
        let pca = PcaConfig {
            n_components: 3,
            ..Default::default()
        };
        let embedding = run_pca(&scaled, &pca).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = jackstraw(&scaled, &embedding, 2, &pca, &JackStrawConfig::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let scaled = two_block_scaled();
        let pca = PcaConfig {
            n_components: 3,
            ..Default::default()
        };
        let embedding = run_pca(&scaled, &pca).unwrap();
        let cancel = CancellationToken::new();
        let bad = [
            JackStrawConfig {
                replicates: 0,
                ..Default::default()
            },
            JackStrawConfig {
                prop_freq: 0.0,
                ..Default::default()
            },
            JackStrawConfig {
                prop_freq: 1.5,
                ..Default::default()
            },
            JackStrawConfig {
                score_thresh: -0.1,
                ..Default::default()
            },
            JackStrawConfig {
                score_thresh: 2.0,
                ..Default::default()
            },
        ];
        for config in &bad {
            let err = jackstraw(&scaled, &embedding, 2, &pca, config, &cancel).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{config:?}");
        }
    }
}
