//! Typed per-cell metadata, aligned row-for-row with a [`super::CountMatrix`].

use serde::{Deserialize, Serialize};

use crate::clustering::ClusterAssignment;
use crate::error::{PipelineError, Result};

/// Per-cell scalars usable as regression covariates when scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    NCounts,
    NGenes,
    PercentMito,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub cell_id: String,
    /// Genes with a nonzero count.
    pub n_genes: usize,
    /// Total counts (library size).
    pub n_counts: u64,
    pub percent_mito: f64,
    pub cluster: Option<usize>,
}

impl CellRecord {
    pub fn covariate(&self, covariate: Covariate) -> f64 {
        match covariate {
            Covariate::NCounts => self.n_counts as f64,
            Covariate::NGenes => self.n_genes as f64,
            Covariate::PercentMito => self.percent_mito,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellMetadata {
    records: Vec<CellRecord>,
}

impl CellMetadata {
    pub fn from_records(records: Vec<CellRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CellRecord] {
        &self.records
    }

    pub fn get(&self, cell_id: &str) -> Option<&CellRecord> {
        self.records.iter().find(|r| r.cell_id == cell_id)
    }

    pub fn covariate_column(&self, covariate: Covariate) -> Vec<f64> {
        self.records.iter().map(|r| r.covariate(covariate)).collect()
    }

    /// Fails unless the records name exactly `cell_ids`, in the same order.
    pub fn check_aligned(&self, cell_ids: &[String]) -> Result<()> {
        if self.records.len() != cell_ids.len() {
            return Err(PipelineError::integrity(format!(
                "metadata holds {} cells but the matrix has {}",
                self.records.len(),
                cell_ids.len()
            )));
        }
        if let Some((r, id)) = self
            .records
            .iter()
            .zip(cell_ids)
            .find(|(r, id)| &r.cell_id != *id)
        {
            return Err(PipelineError::integrity(format!(
                "metadata cell '{}' does not match matrix cell '{id}'",
                r.cell_id
            )));
        }
        Ok(())
    }

    /// New metadata version with the cluster column set from `assignment`.
    pub fn with_clusters(&self, assignment: &ClusterAssignment) -> Result<Self> {
        self.check_aligned(assignment.cell_ids())?;
        let records = self
            .records
            .iter()
            .zip(assignment.labels())
            .map(|(r, &label)| CellRecord {
                cluster: Some(label),
                ..r.clone()
            })
            .collect();
        Ok(Self { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, n_genes: usize) -> CellRecord {
        CellRecord {
            cell_id: id.to_string(),
            n_genes,
            n_counts: 10 * n_genes as u64,
            percent_mito: 1.5,
            cluster: None,
        }
    }

    #[test]
    fn alignment_detects_reordering() {
        let meta = CellMetadata::from_records(vec![record("a", 1), record("b", 2)]);
        assert!(meta.check_aligned(&["a".into(), "b".into()]).is_ok());
        assert!(meta.check_aligned(&["b".into(), "a".into()]).is_err());
        assert!(meta.check_aligned(&["a".into()]).is_err());
    }

    #[test]
    fn covariates_read_typed_fields() {
        let meta = CellMetadata::from_records(vec![record("a", 3)]);
        assert_eq!(meta.covariate_column(Covariate::NGenes), vec![3.0]);
        assert_eq!(meta.covariate_column(Covariate::NCounts), vec![30.0]);
        assert_eq!(meta.covariate_column(Covariate::PercentMito), vec![1.5]);
        assert_eq!(meta.get("a").map(|r| r.n_genes), Some(3));
    }
}
