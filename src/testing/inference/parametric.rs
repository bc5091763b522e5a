//! Two-sample t-tests over sparse expression columns.
//!
//! Group moments are accumulated from the stored entries only; unstored cells add zero to
//! both sums, so each gene costs one pass over its nonzeros.

use crate::testing::utils::{ColumnSplit, GroupMembership};
use crate::testing::{TTestType, TestResult};
use nalgebra_sparse::CscMatrix;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use single_utilities::traits::FloatOpsTS;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// t-test for every listed gene column, comparing the two row groups.
pub fn t_test_matrix_groups<T>(
    matrix: &CscMatrix<T>,
    genes: &[usize],
    groups: &GroupMembership,
    test_type: TTestType,
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
        .map(|gene| t_test_split(&groups.split_column(matrix, gene), test_type))
        .collect();

    Ok(results)
}

pub fn t_test(x: &[f64], y: &[f64], test_type: TTestType) -> TestResult<f64> {
    t_test_split(&ColumnSplit::from_dense(x, y), test_type)
}

pub fn t_test_split(split: &ColumnSplit, test_type: TTestType) -> TestResult<f64> {
    let sum = |v: &[f64]| v.iter().sum::<f64>();
    let sum_sq = |v: &[f64]| v.iter().map(|a| a * a).sum::<f64>();
    t_test_from_sums(
        sum(&split.x),
        sum_sq(&split.x),
        split.n1 as f64,
        sum(&split.y),
        sum_sq(&split.y),
        split.n2 as f64,
        test_type,
    )
}

/// t-test from per-group sums and sums of squares. The effect size is Cohen's d.
pub fn t_test_from_sums(
    sum1: f64,
    sum_sq1: f64,
    n1: f64,
    sum2: f64,
    sum_sq2: f64,
    n2: f64,
    test_type: TTestType,
) -> TestResult<f64> {
    if n1 < 2.0 || n2 < 2.0 {
        return TestResult::new(0.0, 1.0);
    }

    let mean1 = sum1 / n1;
    let mean2 = sum2 / n2;
    // sample variances, floored at zero against cancellation
    let var1 = ((sum_sq1 - n1 * mean1 * mean1) / (n1 - 1.0)).max(0.0);
    let var2 = ((sum_sq2 - n2 * mean2 * mean2) / (n2 - 1.0)).max(0.0);

    let pooled = ((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0);
    let (se, df) = match test_type {
        TTestType::Student => ((pooled * (1.0 / n1 + 1.0 / n2)).sqrt(), n1 + n2 - 2.0),
        TTestType::Welch => {
            let a = var1 / n1;
            let b = var2 / n2;
            let df = if a + b > 0.0 {
                (a + b).powi(2) / (a * a / (n1 - 1.0) + b * b / (n2 - 1.0))
            } else {
                n1 + n2 - 2.0
            };
            ((a + b).sqrt(), df)
        }
    };

    let diff = mean1 - mean2;
    let cohens_d = if pooled > 0.0 { diff / pooled.sqrt() } else { 0.0 };

    if se <= 0.0 {
        let (t, p) = if diff == 0.0 { (0.0, 1.0) } else { (diff.signum() * f64::INFINITY, 0.0) };
        return TestResult::new(t, p).with_degrees_of_freedom(df).with_effect_size(cohens_d);
    }

    let t = diff / se;
    let p_value = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).min(1.0),
        Err(_) => 1.0,
    };

    TestResult::new(t, p_value)
        .with_degrees_of_freedom(df)
        .with_effect_size(cohens_d)
        .with_metadata("mean_difference", diff)
        .with_metadata("standard_error", se)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn student_matches_hand_computation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [3.0, 4.0, 5.0, 6.0];
        let r = t_test(&x, &y, TTestType::Student);
        // pooled variance 5/3, se = sqrt(5/6)
        assert_relative_eq!(r.statistic, -2.0 / (5.0f64 / 6.0).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(r.degrees_of_freedom.unwrap(), 6.0);
        assert!(r.p_value > 0.05 && r.p_value < 0.1);
        assert_relative_eq!(r.metadata["mean_difference"], -2.0, epsilon = 1e-12);
        assert_relative_eq!(r.metadata["standard_error"], (5.0f64 / 6.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn welch_degrees_of_freedom() {
        let x = [1.0, 2.0, 3.0];
        let y = [10.0, 20.0, 30.0, 40.0, 50.0];
        let r = t_test(&x, &y, TTestType::Welch);
        let a = 1.0 / 3.0;
        let b = 250.0 / 5.0;
        let df = (a + b) * (a + b) / (a * a / 2.0 + b * b / 4.0);
        assert_relative_eq!(r.degrees_of_freedom.unwrap(), df, epsilon = 1e-10);
    }

    #[test]
    fn constant_groups() {
        let same = t_test(&[2.0, 2.0], &[2.0, 2.0, 2.0], TTestType::Welch);
        assert_relative_eq!(same.p_value, 1.0);
        let shifted = t_test(&[2.0, 2.0], &[3.0, 3.0], TTestType::Student);
        assert_relative_eq!(shifted.p_value, 0.0);
    }

    #[test]
    fn small_groups_are_uninformative() {
        let r = t_test(&[1.0], &[2.0, 3.0], TTestType::Student);
        assert_relative_eq!(r.p_value, 1.0);
    }
}
