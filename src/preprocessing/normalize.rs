//! Library-size normalization with a log1p transform.

use log::info;
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::matrix::{CountMatrix, csr_from_parts};

/// `log1p(count / n_counts * scale_factor)` per cell, same sparsity pattern as the counts.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMatrix {
    data: CsrMatrix<f64>,
    cell_ids: Vec<String>,
    gene_ids: Vec<String>,
    scale_factor: f64,
}

impl NormalizedMatrix {
    pub fn data(&self) -> &CsrMatrix<f64> {
        &self.data
    }

    pub fn to_csc(&self) -> CscMatrix<f64> {
        CscMatrix::from(&self.data)
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn n_cells(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.data.ncols()
    }
}

pub fn log_normalize(counts: &CountMatrix, scale_factor: f64) -> Result<NormalizedMatrix> {
    if !(scale_factor.is_finite() && scale_factor > 0.0) {
        return Err(PipelineError::configuration(format!(
            "scale_factor must be positive, got {scale_factor}"
        )));
    }
    let csr = counts.counts();

    let rows: Vec<Vec<f64>> = (0..counts.n_cells())
        .into_par_iter()
        .map(|i| {
            let row = csr.row(i);
            let total: u64 = row.values().iter().map(|&v| v as u64).sum();
            if total == 0 {
                return Vec::new();
            }
            let size = total as f64;
            row.values()
                .iter()
                .map(|&v| (v as f64 / size * scale_factor).ln_1p())
                .collect()
        })
        .collect();

    let values: Vec<f64> = rows.into_iter().flatten().collect();
    if values.len() != csr.nnz() {
        return Err(PipelineError::integrity(
            "a cell with stored counts has zero library size",
        ));
    }
    let data = csr_from_parts(
        csr.nrows(),
        csr.ncols(),
        csr.row_offsets().to_vec(),
        csr.col_indices().to_vec(),
        values,
    )?;

    info!(
        "normalized {} cells x {} genes (scale factor {scale_factor})",
        data.nrows(),
        data.ncols()
    );
    Ok(NormalizedMatrix {
        data,
        cell_ids: counts.cell_ids().to_vec(),
        gene_ids: counts.gene_ids().to_vec(),
        scale_factor,
    })
}
