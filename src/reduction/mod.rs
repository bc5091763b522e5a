//! Linear dimensionality reduction of the scaled matrix.

pub mod jackstraw;
pub mod pca;

pub use jackstraw::{JackStrawResult, jackstraw};
pub use pca::{Embedding, TruncatedSvd, run_pca, truncated_svd};
