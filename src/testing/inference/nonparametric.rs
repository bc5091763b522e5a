use crate::testing::utils::{ColumnSplit, GroupMembership};
use crate::testing::{Alternative, TestResult};
use nalgebra_sparse::CscMatrix;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use single_utilities::traits::FloatOpsTS;
use statrs::distribution::{ContinuousCDF, Normal};

/// Wilcoxon rank-sum test for every listed gene column, comparing the two row groups.
pub fn mann_whitney_matrix_groups<T>(
    matrix: &CscMatrix<T>,
    genes: &[usize],
    groups: &GroupMembership,
    alternative: Alternative,
) -> anyhow::Result<Vec<TestResult<f64>>>
where
    T: FloatOpsTS,
{
    if let Some(&bad) = genes.iter().find(|&&g| g >= matrix.ncols()) {
        return Err(anyhow::anyhow!("Gene index {bad} out of bounds ({} columns)", matrix.ncols()));
    }

    let results = genes
        .to_vec()
        .into_par_iter()
        .map(|gene| mann_whitney_split(&groups.split_column(matrix, gene), alternative))
        .collect();

    Ok(results)
}

/// Dense two-sample Wilcoxon rank-sum test.
pub fn mann_whitney(x: &[f64], y: &[f64], alternative: Alternative) -> TestResult<f64> {
    mann_whitney_split(&ColumnSplit::from_dense(x, y), alternative)
}

/// Rank-sum test where all unstored values are zero and ranked as one tie block.
///
/// The statistic is U for the first group, the p-value uses the tie-corrected normal
/// approximation with a 0.5 continuity correction, and the effect size is the AUC
/// `U / (n1 * n2)`.
pub fn mann_whitney_split(split: &ColumnSplit, alternative: Alternative) -> TestResult<f64> {
    let (n1, n2) = (split.n1, split.n2);
    if n1 == 0 || n2 == 0 {
        return TestResult::new(f64::NAN, 1.0); // Insufficient data
    }
    let n = (n1 + n2) as f64;

    let mut values: Vec<(f64, bool)> = Vec::with_capacity(split.x.len() + split.y.len());
    values.extend(split.x.iter().map(|&v| (v, true)));
    values.extend(split.y.iter().map(|&v| (v, false)));
    values.sort_by(|a, b| a.0.total_cmp(&b.0));

    let zeros = split.zeros_x() + split.zeros_y();
    let mut zeros_placed = zeros == 0;
    let mut placed = 0usize;
    let mut rank_sum_x = 0.0;
    let mut tie_sum = 0.0;
    let mut place = |size: usize, in_x: usize| {
        let t = size as f64;
        let mid_rank = placed as f64 + (t + 1.0) / 2.0;
        rank_sum_x += in_x as f64 * mid_rank;
        tie_sum += t * t * t - t;
        placed += size;
    };

    let mut i = 0;
    while i < values.len() {
        let value = values[i].0;
        if !zeros_placed && value > 0.0 {
            place(zeros, split.zeros_x());
            zeros_placed = true;
        }
        let mut j = i;
        let mut in_x = 0;
        while j < values.len() && values[j].0 == value {
            in_x += values[j].1 as usize;
            j += 1;
        }
        place(j - i, in_x);
        i = j;
    }
    if !zeros_placed {
        place(zeros, split.zeros_x());
    }

    let n1f = n1 as f64;
    let n2f = n2 as f64;
    let u_x = rank_sum_x - n1f * (n1f + 1.0) / 2.0;
    let mean_u = n1f * n2f / 2.0;
    let var_u = n1f * n2f / 12.0 * ((n + 1.0) - tie_sum / (n * (n - 1.0)));
    let auc = u_x / (n1f * n2f);

    let delta = u_x - mean_u;
    let p_value = if var_u <= 0.0 {
        1.0
    } else {
        let sd = var_u.sqrt();
        let normal = Normal::standard();
        match alternative {
            Alternative::TwoSided if delta == 0.0 => 1.0,
            Alternative::TwoSided => {
                let z = (delta.abs() - 0.5).abs() / sd;
                (2.0 * normal.sf(z)).min(1.0)
            }
            Alternative::Greater => normal.sf((delta - 0.5) / sd),
            Alternative::Less => normal.cdf((delta + 0.5) / sd),
        }
    };

    TestResult::new(u_x, p_value)
        .with_effect_size(auc)
        .with_metadata("mean_u", mean_u)
        .with_metadata("var_u", var_u)
        .with_metadata("n1", n1f)
        .with_metadata("n2", n2f)
}
