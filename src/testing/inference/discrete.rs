use crate::testing::TestResult;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Chi-square test of independence on the 2x2 table `[[a, b], [c, d]]`, optionally with
/// Yates' continuity correction. Tables with an empty margin give p = 1.
pub fn chi_square_2x2(a: f64, b: f64, c: f64, d: f64, yates: bool) -> TestResult<f64> {
    let total = a + b + c + d;
    let rows = [a + b, c + d];
    let cols = [a + c, b + d];
    if total <= 0.0 || rows.contains(&0.0) || cols.contains(&0.0) {
        return TestResult::new(0.0, 1.0);
    }

    let observed = [[a, b], [c, d]];
    let mut statistic = 0.0;
    for (i, row) in observed.iter().enumerate() {
        for (j, &o) in row.iter().enumerate() {
            let expected = rows[i] * cols[j] / total;
            let deviation = (o - expected).abs();
            let deviation = if yates { (deviation - 0.5).max(0.0) } else { deviation };
            statistic += deviation * deviation / expected;
        }
    }

    TestResult::new(statistic, chi_square_upper_tail(statistic, 1.0)).with_degrees_of_freedom(1.0)
}

/// Two-sample test for equality of proportions `x1 / n1` and `x2 / n2`.
///
/// Equivalent to the chi-square test on the successes/failures table, with the Yates
/// correction capped so it never exceeds the observed difference.
pub fn proportion_test(x1: usize, n1: usize, x2: usize, n2: usize) -> TestResult<f64> {
    if n1 == 0 || n2 == 0 || x1 > n1 || x2 > n2 {
        return TestResult::new(0.0, 1.0);
    }
    let (x1f, n1f, x2f, n2f) = (x1 as f64, n1 as f64, x2 as f64, n2 as f64);
    let pooled = (x1f + x2f) / (n1f + n2f);
    if pooled <= 0.0 || pooled >= 1.0 {
        return TestResult::new(0.0, 1.0);
    }

    let delta = x1f / n1f - x2f / n2f;
    let correction = 0.5f64.min(delta.abs() / (1.0 / n1f + 1.0 / n2f));

    let mut statistic = 0.0;
    for (x, n) in [(x1f, n1f), (x2f, n2f)] {
        for (observed, expected) in [(x, n * pooled), (n - x, n * (1.0 - pooled))] {
            let deviation = (observed - expected).abs() - correction;
            statistic += deviation * deviation / expected;
        }
    }

    TestResult::new(statistic, chi_square_upper_tail(statistic, 1.0))
        .with_degrees_of_freedom(1.0)
        .with_effect_size(delta)
}

fn chi_square_upper_tail(statistic: f64, df: f64) -> f64 {
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(statistic),
        Err(_) => 1.0, // Fallback for invalid parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uncorrected_table() {
        let r = chi_square_2x2(10.0, 20.0, 20.0, 10.0, false);
        // every expected cell is 15
        assert_relative_eq!(r.statistic, 4.0 * 25.0 / 15.0, epsilon = 1e-12);
        assert!(r.p_value < 0.05);
    }

    #[test]
    fn yates_shrinks_the_statistic() {
        let plain = chi_square_2x2(10.0, 20.0, 20.0, 10.0, false);
        let yates = chi_square_2x2(10.0, 20.0, 20.0, 10.0, true);
        assert_relative_eq!(yates.statistic, 4.0 * 4.5 * 4.5 / 15.0, epsilon = 1e-12);
        assert!(yates.p_value > plain.p_value);
    }

    #[test]
    fn proportion_test_matches_table() {
        let prop = proportion_test(10, 30, 20, 30);
        let table = chi_square_2x2(10.0, 20.0, 20.0, 10.0, true);
        assert_relative_eq!(prop.statistic, table.statistic, epsilon = 1e-12);
        assert_relative_eq!(prop.p_value, table.p_value, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_proportions() {
        assert_relative_eq!(proportion_test(0, 50, 0, 50).p_value, 1.0);
        assert_relative_eq!(proportion_test(5, 5, 7, 7).p_value, 1.0);
        assert_relative_eq!(proportion_test(3, 10, 3, 10).p_value, 1.0);
    }
}
