//! Error taxonomy shared by every pipeline stage.
//!
//! Convergence problems are not errors: stages that iterate (PCA, Louvain) return a
//! best-effort result carrying a `converged` flag and log a warning instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or contradictory parameters. Raised before any computation starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Too few cells or genes survived a filtering stage to continue.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Identifiers or dimensions disagree between stages (a wiring bug).
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// A cancellation token was triggered while a stage was running.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A statistical kernel rejected its input.
    #[error("statistics error: {0}")]
    Statistics(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        PipelineError::InsufficientData(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        PipelineError::DataIntegrity(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
