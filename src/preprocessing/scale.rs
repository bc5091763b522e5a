//! Per-gene standardization of the selected features, with optional covariate regression.

use log::info;
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rayon::prelude::*;

use crate::config::ScaleConfig;
use crate::error::{PipelineError, Result};
use crate::matrix::metadata::{CellMetadata, Covariate};
use crate::preprocessing::features::FeatureSet;
use crate::preprocessing::normalize::NormalizedMatrix;

/// Dense cells x features matrix; every column has mean 0 and unit sample variance
/// (or is all zeros when the gene is constant).
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledMatrix {
    data: Array2<f64>,
    cell_ids: Vec<String>,
    feature_ids: Vec<String>,
    feature_indices: Vec<usize>,
    regressed: Vec<Covariate>,
}

impl ScaledMatrix {
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    /// Gene columns of the normalized matrix, in feature order.
    pub fn feature_indices(&self) -> &[usize] {
        &self.feature_indices
    }

    pub fn regressed(&self) -> &[Covariate] {
        &self.regressed
    }

    pub fn n_cells(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }
}

/// Residualizes responses against an intercept plus covariate columns.
struct Regressor {
    design: DMatrix<f64>,
    pinv: DMatrix<f64>,
}

impl Regressor {
    fn new(metadata: &CellMetadata, covariates: &[Covariate]) -> Result<Self> {
        let columns: Vec<Vec<f64>> = covariates
            .iter()
            .map(|&c| metadata.covariate_column(c))
            .collect();
        let design = DMatrix::from_fn(metadata.len(), covariates.len() + 1, |i, j| {
            if j == 0 { 1.0 } else { columns[j - 1][i] }
        });
        let pinv = design
            .clone()
            .pseudo_inverse(1e-10)
            .map_err(|e| PipelineError::configuration(format!("covariate regression failed: {e}")))?;
        Ok(Self { design, pinv })
    }

    fn residuals(&self, y: &[f64]) -> Vec<f64> {
        let y = DVector::from_column_slice(y);
        let beta = &self.pinv * &y;
        let fitted = &self.design * beta;
        (y - fitted).iter().copied().collect()
    }
}

fn standardize(values: &mut [f64], scale_max: Option<f64>) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    let sd = var.sqrt();
    // relative tolerance so residual round-off of a constant gene reads as constant
    if !(sd > 1e-12 * mean.abs().max(1.0)) {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    for v in values.iter_mut() {
        *v = (*v - mean) / sd;
        if let Some(max) = scale_max {
            *v = v.min(max);
        }
    }
}

pub fn scale_data(
    normalized: &NormalizedMatrix,
    features: &FeatureSet,
    metadata: &CellMetadata,
    config: &ScaleConfig,
) -> Result<ScaledMatrix> {
    metadata.check_aligned(normalized.cell_ids())?;
    let n_cells = normalized.n_cells();
    if n_cells < 2 {
        return Err(PipelineError::insufficient(format!(
            "scaling needs at least 2 cells, got {n_cells}"
        )));
    }
    if features.is_empty() {
        return Err(PipelineError::insufficient("no features selected for scaling"));
    }

    let feature_indices = features.gene_indices();
    for (f, &g) in features.features().iter().zip(&feature_indices) {
        match normalized.gene_ids().get(g) {
            Some(id) if *id == f.stats.gene_id => {}
            _ => {
                return Err(PipelineError::integrity(format!(
                    "feature '{}' (column {g}) is not present in the normalized matrix",
                    f.stats.gene_id
                )));
            }
        }
    }

    let regressor = if config.vars_to_regress.is_empty() {
        None
    } else {
        Some(Regressor::new(metadata, &config.vars_to_regress)?)
    };

    let csc = normalized.to_csc();
    let columns: Vec<Vec<f64>> = feature_indices
        .par_iter()
        .map(|&g| {
            let col = csc.col(g);
            let mut dense = vec![0.0; n_cells];
            for (&r, &v) in col.row_indices().iter().zip(col.values()) {
                dense[r] = v;
            }
            let mut values = match &regressor {
                Some(reg) => reg.residuals(&dense),
                None => dense,
            };
            standardize(&mut values, config.scale_max);
            values
        })
        .collect();

    let mut data = Array2::<f64>::zeros((n_cells, columns.len()));
    for (j, col) in columns.iter().enumerate() {
        for (i, &v) in col.iter().enumerate() {
            data[[i, j]] = v;
        }
    }

    info!(
        "scaled {} features over {} cells (regressed: {:?})",
        data.ncols(),
        n_cells,
        config.vars_to_regress
    );
    Ok(ScaledMatrix {
        data,
        cell_ids: normalized.cell_ids().to_vec(),
        feature_ids: features.gene_ids().iter().map(|s| s.to_string()).collect(),
        feature_indices,
        regressed: config.vars_to_regress.clone(),
    })
}
