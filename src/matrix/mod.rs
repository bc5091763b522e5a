//! Sparse cell-by-gene count storage.
//!
//! Rows are cells, columns are genes. Counts are non-negative integers and zeros are never
//! stored. A [`CountMatrix`] is immutable once built: filtering produces a new matrix.

use std::collections::HashSet;

use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix};

use crate::error::{PipelineError, Result};

pub mod metadata;

#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    counts: CsrMatrix<u32>,
    cell_ids: Vec<String>,
    gene_ids: Vec<String>,
}

fn check_unique(ids: &[String], what: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(PipelineError::integrity(format!("duplicate {what} identifier '{id}'")));
        }
    }
    Ok(())
}

/// Assemble a CSR matrix from raw parts, reporting malformed input as an integrity error.
pub(crate) fn csr_from_parts<T>(
    nrows: usize,
    ncols: usize,
    offsets: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<T>,
) -> Result<CsrMatrix<T>> {
    CsrMatrix::try_from_csr_data(nrows, ncols, offsets, indices, values)
        .map_err(|e| PipelineError::integrity(format!("malformed sparse matrix: {e}")))
}

impl CountMatrix {
    /// Wrap a cells x genes CSR matrix. Explicitly stored zeros are dropped.
    pub fn new(counts: CsrMatrix<u32>, cell_ids: Vec<String>, gene_ids: Vec<String>) -> Result<Self> {
        if counts.nrows() != cell_ids.len() {
            return Err(PipelineError::integrity(format!(
                "matrix has {} rows but {} cell identifiers were given",
                counts.nrows(),
                cell_ids.len()
            )));
        }
        if counts.ncols() != gene_ids.len() {
            return Err(PipelineError::integrity(format!(
                "matrix has {} columns but {} gene identifiers were given",
                counts.ncols(),
                gene_ids.len()
            )));
        }
        check_unique(&cell_ids, "cell")?;
        check_unique(&gene_ids, "gene")?;

        let counts = if counts.values().iter().any(|&v| v == 0) {
            let (nrows, ncols) = (counts.nrows(), counts.ncols());
            let mut offsets = Vec::with_capacity(nrows + 1);
            let mut indices = Vec::with_capacity(counts.nnz());
            let mut values = Vec::with_capacity(counts.nnz());
            offsets.push(0);
            for row in counts.row_iter() {
                for (&col, &v) in row.col_indices().iter().zip(row.values()) {
                    if v > 0 {
                        indices.push(col);
                        values.push(v);
                    }
                }
                offsets.push(indices.len());
            }
            csr_from_parts(nrows, ncols, offsets, indices, values)?
        } else {
            counts
        };

        Ok(Self {
            counts,
            cell_ids,
            gene_ids,
        })
    }

    /// Build from `(cell, gene, count)` triplets; duplicate coordinates are summed.
    pub fn from_triplets(
        triplets: &[(usize, usize, u32)],
        cell_ids: Vec<String>,
        gene_ids: Vec<String>,
    ) -> Result<Self> {
        let (nrows, ncols) = (cell_ids.len(), gene_ids.len());
        let mut coo = CooMatrix::new(nrows, ncols);
        for &(row, col, value) in triplets {
            if row >= nrows || col >= ncols {
                return Err(PipelineError::integrity(format!(
                    "triplet ({row}, {col}) outside a {nrows} x {ncols} matrix"
                )));
            }
            if value > 0 {
                coo.push(row, col, value);
            }
        }
        Self::new(CsrMatrix::from(&coo), cell_ids, gene_ids)
    }

    pub fn n_cells(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn counts(&self) -> &CsrMatrix<u32> {
        &self.counts
    }

    pub fn to_csc(&self) -> CscMatrix<u32> {
        CscMatrix::from(&self.counts)
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|g| g == gene_id)
    }

    pub fn get(&self, cell: usize, gene: usize) -> u32 {
        self.counts
            .get_entry(cell, gene)
            .map(|e| e.into_value())
            .unwrap_or(0)
    }

    /// Number of cells in which each gene has a nonzero count.
    pub fn cells_per_gene(&self) -> Vec<usize> {
        let mut detected = vec![0usize; self.n_genes()];
        for &col in self.counts.col_indices() {
            detected[col] += 1;
        }
        detected
    }

    /// Keep the given rows. Indices are sorted and deduplicated first.
    pub fn subset_cells(&self, keep: &[usize]) -> Result<Self> {
        let mut keep = keep.to_vec();
        keep.sort_unstable();
        keep.dedup();
        if let Some(&last) = keep.last() {
            if last >= self.n_cells() {
                return Err(PipelineError::integrity(format!("cell index {last} out of range")));
            }
        }

        let mut offsets = Vec::with_capacity(keep.len() + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        offsets.push(0);
        for &r in &keep {
            let row = self.counts.row(r);
            indices.extend_from_slice(row.col_indices());
            values.extend_from_slice(row.values());
            offsets.push(indices.len());
        }

        let counts = csr_from_parts(keep.len(), self.n_genes(), offsets, indices, values)?;
        Ok(Self {
            counts,
            cell_ids: keep.iter().map(|&r| self.cell_ids[r].clone()).collect(),
            gene_ids: self.gene_ids.clone(),
        })
    }

    /// Keep the given columns. Indices are sorted and deduplicated first.
    pub fn subset_genes(&self, keep: &[usize]) -> Result<Self> {
        let mut keep = keep.to_vec();
        keep.sort_unstable();
        keep.dedup();

        let mut remap = vec![None; self.n_genes()];
        for (new, &old) in keep.iter().enumerate() {
            if old >= self.n_genes() {
                return Err(PipelineError::integrity(format!("gene index {old} out of range")));
            }
            remap[old] = Some(new);
        }

        let mut offsets = Vec::with_capacity(self.n_cells() + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        offsets.push(0);
        for row in self.counts.row_iter() {
            for (&col, &v) in row.col_indices().iter().zip(row.values()) {
                if let Some(new) = remap[col] {
                    indices.push(new);
                    values.push(v);
                }
            }
            offsets.push(indices.len());
        }

        let counts = csr_from_parts(self.n_cells(), keep.len(), offsets, indices, values)?;
        Ok(Self {
            counts,
            cell_ids: self.cell_ids.clone(),
            gene_ids: keep.iter().map(|&c| self.gene_ids[c].clone()).collect(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    pub(crate) fn small_matrix() -> CountMatrix {
        // 4 cells x 3 genes
        let triplets = [
            (0, 0, 5),
            (0, 2, 1),
            (1, 0, 2),
            (1, 1, 3),
            (2, 1, 7),
            (3, 0, 1),
            (3, 1, 1),
            (3, 2, 1),
        ];
        CountMatrix::from_triplets(&triplets, ids("cell", 4), ids("gene", 3)).unwrap()
    }

    #[test]
    fn triplets_sum_duplicates_and_drop_zeros() {
        let m = CountMatrix::from_triplets(
            &[(0, 0, 2), (0, 0, 3), (1, 1, 0)],
            ids("c", 2),
            ids("g", 2),
        )
        .unwrap();
        assert_eq!(m.get(0, 0), 5);
        assert_eq!(m.get(1, 1), 0);
        assert_eq!(m.counts().nnz(), 1);
    }

    #[test]
    fn explicit_zeros_are_removed() {
        let csr = CsrMatrix::try_from_csr_data(2, 2, vec![0, 2, 3], vec![0, 1, 1], vec![0u32, 4, 1])
            .unwrap();
        let m = CountMatrix::new(csr, ids("c", 2), ids("g", 2)).unwrap();
        assert_eq!(m.counts().nnz(), 2);
        assert_eq!(m.get(0, 1), 4);
    }

    #[test]
    fn mismatched_identifiers_are_rejected() {
        let err = CountMatrix::from_triplets(&[], ids("c", 2), vec!["g".into(), "g".into()])
            .unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity(_)));

        let err = CountMatrix::from_triplets(&[(3, 0, 1)], ids("c", 2), ids("g", 1)).unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity(_)));
    }

    #[test]
    fn subsetting_keeps_identifiers_aligned() {
        let m = small_matrix();
        assert_eq!(m.cells_per_gene(), vec![3, 3, 2]);

        let cells = m.subset_cells(&[3, 1]).unwrap();
        assert_eq!(cells.cell_ids(), &["cell1".to_string(), "cell3".to_string()]);
        assert_eq!(cells.get(0, 1), 3);
        assert_eq!(cells.get(1, 2), 1);

        let genes = m.subset_genes(&[2, 0]).unwrap();
        assert_eq!(genes.gene_ids(), &["gene0".to_string(), "gene2".to_string()]);
        assert_eq!(genes.get(0, 0), 5);
        assert_eq!(genes.get(0, 1), 1);
        assert_eq!(genes.get(2, 0), 0);
        assert_eq!(genes.gene_index("gene2"), Some(1));
    }
}
