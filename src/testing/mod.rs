use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOps;
use std::collections::HashMap;

pub mod correction;
pub mod effect;
pub mod inference;

pub mod utils;

/// Per-gene two-sample test used for marker detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
    /// Wilcoxon rank-sum (Mann-Whitney U) with tie correction.
    #[serde(rename = "wilcoxon", alias = "mann_whitney")]
    MannWhitney,
    /// Rank test reported through the area under the ROC curve.
    Roc,
    TTest(TTestType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TTestType {
    Student, // Equal variance
    Welch,   // Unequal variance
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alternative {
    TwoSided,
    /// First group stochastically smaller.
    Less,
    /// First group stochastically larger.
    Greater,
}

#[derive(Debug, Clone)]
pub struct TestResult<T> {
    /// The test statistic value (e.g., t-statistic, U statistic)
    pub statistic: T,
    pub p_value: T,
    /// AUC for rank tests, Cohen's d for t-tests
    pub effect_size: Option<T>,
    pub degrees_of_freedom: Option<T>,
    pub metadata: HashMap<String, T>,
}

impl<T> TestResult<T>
where
    T: FloatOps,
{
    pub fn new(statistic: T, p_value: T) -> Self {
        TestResult {
            statistic,
            p_value,
            effect_size: None,
            degrees_of_freedom: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_effect_size(mut self, effect_size: T) -> Self {
        self.effect_size = Some(effect_size);
        self
    }

    pub fn with_degrees_of_freedom(mut self, df: T) -> Self {
        self.degrees_of_freedom = Some(df);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: T) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_significant(&self, alpha: T) -> bool {
        self.p_value < alpha
    }
}

/// Outcome of testing a set of genes, aligned with the gene list that was tested.
#[derive(Debug, Clone)]
pub struct MultipleTestResults {
    pub genes: Vec<usize>,
    pub statistics: Vec<f64>,
    pub p_values: Vec<f64>,
    pub adjusted_p_values: Vec<f64>,
    pub effect_sizes: Vec<Option<f64>>,
    pub method: TestMethod,
}

impl MultipleTestResults {
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Positions of results with an adjusted p-value below `alpha`.
    pub fn significant_indices(&self, alpha: f64) -> Vec<usize> {
        self.adjusted_p_values
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| (p < alpha).then_some(i))
            .collect()
    }

    pub fn num_significant(&self, alpha: f64) -> usize {
        self.significant_indices(alpha).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(serde_json::to_string(&TestMethod::MannWhitney).unwrap(), "\"wilcoxon\"");
        let parsed: TestMethod = serde_json::from_str("\"mann_whitney\"").unwrap();
        assert_eq!(parsed, TestMethod::MannWhitney);
        let t: TestMethod = serde_json::from_str(r#"{"t_test":"welch"}"#).unwrap();
        assert_eq!(t, TestMethod::TTest(TTestType::Welch));
    }

    #[test]
    fn significance_uses_adjusted_values() {
        let results = MultipleTestResults {
            genes: vec![4, 7, 9],
            statistics: vec![1.0, 2.0, 3.0],
            p_values: vec![0.001, 0.02, 0.5],
            adjusted_p_values: vec![0.003, 0.06, 1.0],
            effect_sizes: vec![None; 3],
            method: TestMethod::MannWhitney,
        };
        assert_eq!(results.significant_indices(0.05), vec![0]);
        assert_eq!(results.num_significant(0.1), 2);
    }
}
