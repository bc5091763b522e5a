//! Count-level stages: quality control, normalization, variable features and scaling.

pub mod features;
mod loess;
pub mod normalize;
pub mod qc;
pub mod scale;

pub use features::{FeatureSet, GeneVariance, SelectedFeature, find_variable_features};
pub use normalize::{NormalizedMatrix, log_normalize};
pub use qc::{QcOutput, cell_stats, filter_cells, filter_genes};
pub use scale::{ScaledMatrix, scale_data};
