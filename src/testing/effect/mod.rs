//! Effect sizes for comparing one gene between two cell groups.

use crate::testing::utils::ColumnSplit;

/// Mean of `expm1(v)` over a group of `n` cells of which only `nonzero` are stored.
fn mean_expm1(nonzero: &[f64], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    nonzero.iter().map(|v| v.exp_m1()).sum::<f64>() / n as f64
}

/// Log2 fold change of average expression on the count scale.
///
/// The input is log1p-normalized, so each group mean is taken after `expm1`, then
/// `log2(mean_1 + pseudocount) - log2(mean_2 + pseudocount)`.
pub fn log2_fold_change(split: &ColumnSplit, pseudocount: f64) -> f64 {
    let mean1 = mean_expm1(&split.x, split.n1);
    let mean2 = mean_expm1(&split.y, split.n2);
    (mean1 + pseudocount).log2() - (mean2 + pseudocount).log2()
}

/// Fractions of cells with nonzero expression in each group.
pub fn detection_rates(split: &ColumnSplit) -> (f64, f64) {
    let rate = |count: usize, n: usize| if n == 0 { 0.0 } else { count as f64 / n as f64 };
    (rate(split.x.len(), split.n1), rate(split.y.len(), split.n2))
}

/// Discriminative power `2 * |AUC - 0.5|`, 0 for no separation and 1 for perfect.
pub fn roc_power(auc: f64) -> f64 {
    2.0 * (auc - 0.5).abs()
}
