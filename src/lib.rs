//! # single-pipeline
//!
//! A single-cell RNA-seq clustering pipeline built on sparse matrices, part of the single-rust ecosystem.
//!
//! Starting from a sparse cell × gene count matrix the crate produces quality-filtered and
//! log-normalized expression, a set of highly variable genes, a PCA embedding, a shared
//! nearest neighbor graph, Louvain clusters and ranked marker genes per cluster.
//!
//! ## Core Features
//!
//! - **Quality control**: per-cell gene/count/mitochondrial statistics and threshold filtering
//! - **Variable features**: variance-stabilizing (`vst`) selection with a loess mean-variance fit
//! - **PCA**: seeded randomized truncated SVD, plus JackStraw permutation significance
//! - **Graph clustering**: exact or HNSW k-NN, Jaccard SNN refinement, multi-start Louvain
//! - **Marker genes**: Wilcoxon, ROC and t-tests with Bonferroni or BH correction
//!
//! ## Quick Start
//!
//! Build a [`CountMatrix`], create a [`Session`] with a [`PipelineConfig`] and call
//! [`Session::run`]. Each stage can also be run on its own; stage outputs are versioned
//! values and re-running a stage discards everything downstream of it.
//!
//! ## Module Organization
//!
//! - **[`matrix`]**: count matrix and typed per-cell metadata
//! - **[`preprocessing`]**: QC, normalization, feature selection and scaling
//! - **[`reduction`]**: PCA and JackStraw
//! - **[`graph`]**: k-NN search and SNN graph construction
//! - **[`clustering`]**: Louvain community detection and cluster assignments
//! - **[`testing`]**: statistical tests and multiple testing correction
//! - **[`markers`]**: marker gene detection per cluster
//! - **[`session`]**: the stage arena tying everything together

pub mod cancel;
pub mod clustering;
pub mod config;
pub mod error;
pub mod graph;
pub mod markers;
pub mod matrix;
pub mod preprocessing;
pub mod reduction;
pub mod session;
pub mod testing;

pub use cancel::CancellationToken;
pub use clustering::{ClusterAssignment, LabeledAssignment};
pub use config::{NeighborSearch, NodeOrder, PipelineConfig};
pub use error::{PipelineError, Result};
pub use graph::NeighborGraphData;
pub use markers::{MarkerResult, MarkerTable};
pub use matrix::CountMatrix;
pub use matrix::metadata::{CellMetadata, CellRecord, Covariate};
pub use preprocessing::{FeatureSet, NormalizedMatrix, ScaledMatrix};
pub use reduction::{Embedding, JackStrawResult};
pub use session::Session;
