//! PCA through a truncated, seeded subspace-iteration SVD.
//!
//! Follows the randomized range finder of Halko et al. (2009, Alg. 4.4) with QR
//! re-orthonormalization at every half step. The start matrix comes from a seeded
//! generator, so identical input and rank always reproduce the same components; signs are
//! fixed afterwards so that the largest-magnitude loading of each component is positive.

use log::{debug, info, warn};
use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::PcaConfig;
use crate::error::{PipelineError, Result};
use crate::preprocessing::ScaledMatrix;

const OVERSAMPLE: usize = 10;

/// Top singular triplets of a matrix, singular values in decreasing order.
#[derive(Debug, Clone)]
pub struct TruncatedSvd {
    pub u: DMatrix<f64>,
    pub singular_values: Vec<f64>,
    pub v: DMatrix<f64>,
    pub iterations: usize,
    pub converged: bool,
}

fn orthonormal(m: DMatrix<f64>) -> DMatrix<f64> {
    m.qr().q()
}

fn top_singular_values(b: &DMatrix<f64>, rank: usize) -> Vec<f64> {
    let mut sv: Vec<f64> = b.singular_values().iter().copied().collect();
    sv.sort_by(|a, b| b.total_cmp(a));
    sv.truncate(rank);
    sv
}

pub fn truncated_svd(
    x: &DMatrix<f64>,
    rank: usize,
    max_iter: usize,
    tolerance: f64,
    seed: u64,
) -> Result<TruncatedSvd> {
    let (n, p) = x.shape();
    let max_rank = n.min(p);
    let rank = rank.min(max_rank);
    if rank == 0 {
        return Err(PipelineError::insufficient(format!(
            "cannot decompose a {n} x {p} matrix"
        )));
    }
    let width = (rank + OVERSAMPLE).min(max_rank);

    let mut rng = StdRng::seed_from_u64(seed);
    let omega = DMatrix::<f64>::from_fn(p, width, |_, _| rng.sample(StandardNormal));
    let mut q = orthonormal(x * omega);

    let mut previous: Option<Vec<f64>> = None;
    let mut iterations = 0;
    let mut converged = false;
    for it in 1..=max_iter.max(1) {
        let z = orthonormal(x.tr_mul(&q));
        q = orthonormal(x * z);
        iterations = it;

        let current = top_singular_values(&q.tr_mul(x), rank);
        if let Some(prev) = &previous {
            let stable = prev
                .iter()
                .zip(&current)
                .all(|(a, b)| (a - b).abs() <= tolerance * a.abs().max(f64::MIN_POSITIVE));
            if stable {
                converged = true;
                break;
            }
        }
        previous = Some(current);
    }
    debug!("subspace iteration stopped after {iterations} rounds (converged: {converged})");

    let b = q.tr_mul(x);
    let svd = b.svd(true, true);
    let (u_b, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(PipelineError::integrity("SVD did not return singular vectors")),
    };

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| {
        svd.singular_values[b]
            .total_cmp(&svd.singular_values[a])
            .then(a.cmp(&b))
    });
    order.truncate(rank);

    let mut u = DMatrix::<f64>::zeros(n, rank);
    let mut v = DMatrix::<f64>::zeros(p, rank);
    let mut singular_values = Vec::with_capacity(rank);
    for (k, &idx) in order.iter().enumerate() {
        let u_col = &q * u_b.column(idx);
        let v_col = v_t.row(idx).transpose();

        let pivot = (0..p).fold(0, |best, j| {
            if v_col[j].abs() > v_col[best].abs() { j } else { best }
        });
        let sign = if v_col[pivot] < 0.0 { -1.0 } else { 1.0 };

        u.set_column(k, &(u_col * sign));
        v.set_column(k, &(v_col * sign));
        singular_values.push(svd.singular_values[idx]);
    }

    Ok(TruncatedSvd {
        u,
        singular_values,
        v,
        iterations,
        converged,
    })
}

/// Cells x features dense copy with every column centered.
pub(crate) fn centered_matrix(data: &Array2<f64>) -> DMatrix<f64> {
    let (n, p) = data.dim();
    let means: Vec<f64> = (0..p)
        .map(|j| data.column(j).sum() / n.max(1) as f64)
        .collect();
    DMatrix::from_fn(n, p, |i, j| data[[i, j]] - means[j])
}

/// Principal components of the scaled matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    cell_embeddings: Array2<f64>,
    loadings: Array2<f64>,
    singular_values: Vec<f64>,
    stdev: Vec<f64>,
    variance_explained: Vec<f64>,
    cell_ids: Vec<String>,
    feature_ids: Vec<String>,
    iterations: usize,
    converged: bool,
}

impl Embedding {
    /// Cells x components coordinates (left singular vectors scaled by singular values).
    pub fn cell_embeddings(&self) -> &Array2<f64> {
        &self.cell_embeddings
    }

    /// Coordinates restricted to the first `dims` components.
    pub fn leading(&self, dims: usize) -> ArrayView2<'_, f64> {
        let dims = dims.min(self.n_components());
        self.cell_embeddings.slice(s![.., ..dims])
    }

    /// Features x components; columns are orthonormal.
    pub fn loadings(&self) -> &Array2<f64> {
        &self.loadings
    }

    pub fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }

    /// Standard deviation of each component across cells.
    pub fn stdev(&self) -> &[f64] {
        &self.stdev
    }

    /// Fraction of the total variance captured by each component, non-increasing.
    pub fn variance_explained(&self) -> &[f64] {
        &self.variance_explained
    }

    pub fn n_components(&self) -> usize {
        self.singular_values.len()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }
}

fn to_array(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

pub fn run_pca(scaled: &ScaledMatrix, config: &PcaConfig) -> Result<Embedding> {
    let (n, p) = scaled.data().dim();
    if n < 2 || p == 0 {
        return Err(PipelineError::insufficient(format!(
            "PCA needs at least 2 cells and 1 feature, got {n} x {p}"
        )));
    }

    let x = centered_matrix(scaled.data());
    let total_variance = x.norm_squared();
    if total_variance <= 0.0 {
        return Err(PipelineError::insufficient("scaled matrix carries no variance"));
    }

    let n_components = config.n_components.min(n.min(p));
    if n_components < config.n_components {
        warn!(
            "requested {} components but the scaled matrix has rank at most {n_components}",
            config.n_components
        );
    }

    let svd = truncated_svd(&x, n_components, config.max_iter, config.tolerance, config.seed)?;
    if !svd.converged {
        warn!(
            "PCA did not converge within {} iterations; returning best-effort components",
            config.max_iter
        );
    }

    let mut cell_embeddings = to_array(&svd.u);
    for (k, &sv) in svd.singular_values.iter().enumerate() {
        cell_embeddings.column_mut(k).mapv_inplace(|v| v * sv);
    }
    let stdev = svd
        .singular_values
        .iter()
        .map(|&sv| sv / ((n - 1) as f64).sqrt())
        .collect();
    let variance_explained = svd
        .singular_values
        .iter()
        .map(|&sv| sv * sv / total_variance)
        .collect();

    info!("PCA: {n_components} components from {n} cells x {p} features");
    Ok(Embedding {
        cell_embeddings,
        loadings: to_array(&svd.v),
        singular_values: svd.singular_values,
        stdev,
        variance_explained,
        cell_ids: scaled.cell_ids().to_vec(),
        feature_ids: scaled.feature_ids().to_vec(),
        iterations: svd.iterations,
        converged: svd.converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pseudo_random(n: usize, p: usize) -> DMatrix<f64> {
        // deterministic, full rank, with a dominant direction
        DMatrix::from_fn(n, p, |i, j| {
            let noise = (((i * 31 + j * 17) % 23) as f64 - 11.0) / 11.0;
            noise + if j < 3 { (i % 2) as f64 * 4.0 } else { 0.0 }
        })
    }

    #[test]
    fn matches_full_svd() {
        let x = pseudo_random(40, 12);
        let svd = truncated_svd(&x, 4, 50, 1e-10, 7).unwrap();
        let mut full: Vec<f64> = x.clone().svd(false, false).singular_values.iter().copied().collect();
        full.sort_by(|a, b| b.total_cmp(a));
        for k in 0..4 {
            assert_abs_diff_eq!(svd.singular_values[k], full[k], epsilon = 1e-6);
        }
        assert!(svd.converged);
    }

    #[test]
    fn vectors_are_orthonormal() {
        let x = pseudo_random(30, 10);
        let svd = truncated_svd(&x, 5, 30, 1e-10, 1).unwrap();
        let vtv = svd.v.tr_mul(&svd.v);
        let utu = svd.u.tr_mul(&svd.u);
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(vtv[(i, j)], expected, epsilon = 1e-8);
                assert_abs_diff_eq!(utu[(i, j)], expected, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn iteration_limit_flags_best_effort_result() {
        let x = pseudo_random(40, 12);
        let svd = truncated_svd(&x, 4, 1, 1e-14, 5).unwrap();
        assert!(!svd.converged);
        assert_eq!(svd.iterations, 1);
        assert_eq!(svd.singular_values.len(), 4);
        assert!(svd.singular_values.windows(2).all(|w| w[0] >= w[1]));
        let vtv = svd.v.tr_mul(&svd.v);
        for i in 0..4 {
            for j in 0..4 {
                assert_abs_diff_eq!(vtv[(i, j)], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn deterministic_with_fixed_signs() {
        let x = pseudo_random(25, 8);
        let a = truncated_svd(&x, 3, 30, 1e-10, 3).unwrap();
        let b = truncated_svd(&x, 3, 30, 1e-10, 3).unwrap();
        assert_eq!(a.v, b.v);
        assert_eq!(a.singular_values, b.singular_values);
        for k in 0..3 {
            let col = a.v.column(k);
            let pivot = col.iamax();
            assert!(col[pivot] > 0.0);
        }
    }

    #[test]
    fn rank_is_clamped() {
        let x = pseudo_random(4, 3);
        let svd = truncated_svd(&x, 10, 10, 1e-8, 0).unwrap();
        assert_eq!(svd.singular_values.len(), 3);
        assert!(truncated_svd(&DMatrix::zeros(0, 3), 2, 10, 1e-8, 0).is_err());
    }
}
