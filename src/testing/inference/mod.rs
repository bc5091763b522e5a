use nalgebra_sparse::CscMatrix;
use single_utilities::traits::FloatOpsTS;
use crate::testing::correction::Correction;
use crate::testing::utils::GroupMembership;
use crate::testing::{Alternative, MultipleTestResults, TTestType, TestMethod, TestResult};

pub mod discrete;

pub mod parametric;

pub mod nonparametric;

/// Per-gene two-group tests on a cells x genes matrix stored by column.
pub trait MatrixStatTests<T>
where
    T: FloatOpsTS,
{
    fn t_test(
        &self,
        genes: &[usize],
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_type: TTestType,
    ) -> anyhow::Result<Vec<TestResult<f64>>>;

    fn mann_whitney_test(
        &self,
        genes: &[usize],
        group1_indices: &[usize],
        group2_indices: &[usize],
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>>;

    /// Test `genes` with `test_method` and correct across them. An empty gene list gives
    /// an empty result.
    fn differential_expression(
        &self,
        genes: &[usize],
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_method: TestMethod,
        correction: Correction,
    ) -> anyhow::Result<MultipleTestResults>;
}

impl<T> MatrixStatTests<T> for CscMatrix<T>
where
    T: FloatOpsTS,
{
    fn t_test(
        &self,
        genes: &[usize],
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_type: TTestType,
    ) -> anyhow::Result<Vec<TestResult<f64>>> {
        let groups = GroupMembership::new(self.nrows(), group1_indices, group2_indices)?;
        parametric::t_test_matrix_groups(self, genes, &groups, test_type)
    }

    fn mann_whitney_test(
        &self,
        genes: &[usize],
        group1_indices: &[usize],
        group2_indices: &[usize],
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>> {
        let groups = GroupMembership::new(self.nrows(), group1_indices, group2_indices)?;
        nonparametric::mann_whitney_matrix_groups(self, genes, &groups, alternative)
    }

    fn differential_expression(
        &self,
        genes: &[usize],
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_method: TestMethod,
        correction: Correction,
    ) -> anyhow::Result<MultipleTestResults> {
        let results = match test_method {
            TestMethod::TTest(test_type) => {
                self.t_test(genes, group1_indices, group2_indices, test_type)?
            }
            // ROC reports the same rank statistic; its AUC is the effect size
            TestMethod::MannWhitney | TestMethod::Roc => {
                self.mann_whitney_test(genes, group1_indices, group2_indices, Alternative::TwoSided)?
            }
        };

        let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
        let adjusted_p_values = if p_values.is_empty() {
            Vec::new()
        } else {
            correction.apply(&p_values)?
        };

        Ok(MultipleTestResults {
            genes: genes.to_vec(),
            statistics: results.iter().map(|r| r.statistic).collect(),
            p_values,
            adjusted_p_values,
            effect_sizes: results.iter().map(|r| r.effect_size).collect(),
            method: test_method,
        })
    }
}
