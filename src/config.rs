//! Per-run configuration.
//!
//! A single [`PipelineConfig`] record drives every stage of a run. Nothing is read from
//! the environment or from global state; stages receive the narrow view they need
//! (`QcThresholds`, `VstConfig`, ...) derived from the record.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::matrix::metadata::Covariate;
use crate::testing::TestMethod;
use crate::testing::correction::Correction;

/// How k-nearest neighbors are searched in PCA space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NeighborSearch {
    /// Brute force over all cells, ties broken by lower cell index.
    #[default]
    Exact,
    /// Hierarchical navigable small world index, seeded.
    Hnsw,
}

/// Order in which the Louvain local moving phase visits nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeOrder {
    /// Node index order; a single start is run.
    Sequential,
    /// Shuffled with a seeded generator, one shuffle per start and level.
    #[default]
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // ingestion and QC
    pub min_cells: usize,
    pub min_genes: usize,
    pub max_genes: usize,
    pub max_percent_mito: f64,
    pub mito_prefix: String,

    // normalization
    pub scale_factor: f64,

    // variable features
    pub n_variable_features: usize,
    pub vst_span: f64,
    pub vst_clip_max: Option<f64>,

    // scaling
    pub vars_to_regress: Vec<Covariate>,
    pub scale_max: Option<f64>,

    // PCA
    pub n_pca_components: usize,
    pub pca_max_iter: usize,
    pub pca_tolerance: f64,
    pub seed: u64,

    // neighbor graph
    pub n_neighbor_dims: usize,
    pub neighbor_k: usize,
    pub neighbor_search: NeighborSearch,
    pub prune_snn: f64,

    // clustering
    pub cluster_resolution: f64,
    pub node_order: NodeOrder,
    pub n_starts: usize,
    pub max_levels: usize,
    pub max_passes: usize,

    // markers
    pub min_pct: f64,
    pub logfc_threshold: f64,
    pub only_pos: bool,
    pub pseudocount: f64,
    pub test_method: TestMethod,
    pub correction: Correction,

    // JackStraw
    pub jackstraw_replicates: usize,
    pub jackstraw_prop_freq: f64,
    pub jackstraw_score_thresh: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_cells: 3,
            min_genes: 200,
            max_genes: 2500,
            max_percent_mito: 5.0,
            mito_prefix: "MT-".to_string(),
            scale_factor: 1e4,
            n_variable_features: 2000,
            vst_span: 0.3,
            vst_clip_max: None,
            vars_to_regress: Vec::new(),
            scale_max: None,
            n_pca_components: 50,
            pca_max_iter: 20,
            pca_tolerance: 1e-7,
            seed: 0,
            n_neighbor_dims: 10,
            neighbor_k: 20,
            neighbor_search: NeighborSearch::Exact,
            prune_snn: 0.0,
            cluster_resolution: 0.5,
            node_order: NodeOrder::Random,
            n_starts: 10,
            max_levels: 10,
            max_passes: 100,
            min_pct: 0.25,
            logfc_threshold: 0.25,
            only_pos: false,
            pseudocount: 1.0,
            test_method: TestMethod::MannWhitney,
            correction: Correction::Bonferroni,
            jackstraw_replicates: 100,
            jackstraw_prop_freq: 0.01,
            jackstraw_score_thresh: 1e-5,
        }
    }
}

fn check(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(PipelineError::Configuration(msg()))
    }
}

fn finite_positive(name: &str, value: f64) -> Result<()> {
    check(value.is_finite() && value > 0.0, || {
        format!("{name} must be a positive finite number, got {value}")
    })
}

fn fraction(name: &str, value: f64) -> Result<()> {
    check((0.0..=1.0).contains(&value), || {
        format!("{name} must lie in [0, 1], got {value}")
    })
}

impl PipelineConfig {
    /// Parse a JSON document; missing keys take their defaults. The result is validated.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::Configuration(format!("unreadable config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Configuration(format!("unserializable config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        check(self.min_genes < self.max_genes, || {
            format!(
                "min_genes ({}) must be smaller than max_genes ({})",
                self.min_genes, self.max_genes
            )
        })?;
        check(
            self.max_percent_mito.is_finite() && self.max_percent_mito > 0.0,
            || format!("max_percent_mito must be positive, got {}", self.max_percent_mito),
        )?;
        finite_positive("scale_factor", self.scale_factor)?;
        check(self.n_variable_features > 0, || {
            "n_variable_features must be at least 1".to_string()
        })?;
        check(self.vst_span > 0.0 && self.vst_span <= 1.0, || {
            format!("vst_span must lie in (0, 1], got {}", self.vst_span)
        })?;
        if let Some(clip) = self.vst_clip_max {
            finite_positive("vst_clip_max", clip)?;
        }
        if let Some(max) = self.scale_max {
            finite_positive("scale_max", max)?;
        }
        check(self.n_pca_components > 0, || {
            "n_pca_components must be at least 1".to_string()
        })?;
        check(self.pca_max_iter > 0, || "pca_max_iter must be at least 1".to_string())?;
        finite_positive("pca_tolerance", self.pca_tolerance)?;
        check(self.n_neighbor_dims > 0, || {
            "n_neighbor_dims must be at least 1".to_string()
        })?;
        check(self.n_neighbor_dims <= self.n_pca_components, || {
            format!(
                "n_neighbor_dims ({}) exceeds n_pca_components ({})",
                self.n_neighbor_dims, self.n_pca_components
            )
        })?;
        check(self.neighbor_k > 0, || "neighbor_k must be at least 1".to_string())?;
        fraction("prune_snn", self.prune_snn)?;
        finite_positive("cluster_resolution", self.cluster_resolution)?;
        check(self.n_starts > 0, || "n_starts must be at least 1".to_string())?;
        check(self.max_levels > 0, || "max_levels must be at least 1".to_string())?;
        check(self.max_passes > 0, || "max_passes must be at least 1".to_string())?;
        fraction("min_pct", self.min_pct)?;
        check(
            self.logfc_threshold.is_finite() && self.logfc_threshold >= 0.0,
            || format!("logfc_threshold must be non-negative, got {}", self.logfc_threshold),
        )?;
        finite_positive("pseudocount", self.pseudocount)?;
        self.jackstraw().validate()
    }

    pub fn qc(&self) -> QcThresholds {
        QcThresholds {
            min_genes: self.min_genes,
            max_genes: self.max_genes,
            max_percent_mito: self.max_percent_mito,
            mito_prefix: self.mito_prefix.clone(),
        }
    }

    pub fn vst(&self) -> VstConfig {
        VstConfig {
            n_features: self.n_variable_features,
            span: self.vst_span,
            clip_max: self.vst_clip_max,
        }
    }

    pub fn scaling(&self) -> ScaleConfig {
        ScaleConfig {
            vars_to_regress: self.vars_to_regress.clone(),
            scale_max: self.scale_max,
        }
    }

    pub fn pca(&self) -> PcaConfig {
        PcaConfig {
            n_components: self.n_pca_components,
            max_iter: self.pca_max_iter,
            tolerance: self.pca_tolerance,
            seed: self.seed,
        }
    }

    pub fn neighbors(&self) -> NeighborConfig {
        NeighborConfig {
            dims: self.n_neighbor_dims,
            k: self.neighbor_k,
            search: self.neighbor_search,
            prune_snn: self.prune_snn,
            seed: self.seed,
        }
    }

    pub fn louvain(&self) -> LouvainConfig {
        LouvainConfig {
            resolution: self.cluster_resolution,
            node_order: self.node_order,
            n_starts: self.n_starts,
            max_levels: self.max_levels,
            max_passes: self.max_passes,
            seed: self.seed,
        }
    }

    pub fn markers(&self) -> MarkerConfig {
        MarkerConfig {
            min_pct: self.min_pct,
            logfc_threshold: self.logfc_threshold,
            only_pos: self.only_pos,
            pseudocount: self.pseudocount,
            test_method: self.test_method,
            correction: self.correction,
        }
    }

    pub fn jackstraw(&self) -> JackStrawConfig {
        JackStrawConfig {
            replicates: self.jackstraw_replicates,
            prop_freq: self.jackstraw_prop_freq,
            score_thresh: self.jackstraw_score_thresh,
            seed: self.seed,
        }
    }
}

/// Per-cell inclusion predicates: `min_genes < n_genes < max_genes` and
/// `percent_mito < max_percent_mito`.
#[derive(Debug, Clone, PartialEq)]
pub struct QcThresholds {
    pub min_genes: usize,
    pub max_genes: usize,
    pub max_percent_mito: f64,
    pub mito_prefix: String,
}

impl QcThresholds {
    pub fn validate(&self) -> Result<()> {
        check(self.min_genes < self.max_genes, || {
            format!(
                "min_genes ({}) must be smaller than max_genes ({})",
                self.min_genes, self.max_genes
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VstConfig {
    pub n_features: usize,
    /// Fraction of genes in each local regression window.
    pub span: f64,
    /// Upper clip of standardized values; `None` uses sqrt(n_cells).
    pub clip_max: Option<f64>,
}

impl Default for VstConfig {
    fn default() -> Self {
        PipelineConfig::default().vst()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScaleConfig {
    pub vars_to_regress: Vec<Covariate>,
    pub scale_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PcaConfig {
    pub n_components: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PipelineConfig::default().pca()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborConfig {
    pub dims: usize,
    pub k: usize,
    pub search: NeighborSearch,
    pub prune_snn: f64,
    pub seed: u64,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        PipelineConfig::default().neighbors()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LouvainConfig {
    pub resolution: f64,
    pub node_order: NodeOrder,
    pub n_starts: usize,
    pub max_levels: usize,
    pub max_passes: usize,
    pub seed: u64,
}

impl Default for LouvainConfig {
    fn default() -> Self {
        PipelineConfig::default().louvain()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerConfig {
    pub min_pct: f64,
    pub logfc_threshold: f64,
    pub only_pos: bool,
    pub pseudocount: f64,
    pub test_method: TestMethod,
    pub correction: Correction,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        PipelineConfig::default().markers()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JackStrawConfig {
    pub replicates: usize,
    pub prop_freq: f64,
    pub score_thresh: f64,
    pub seed: u64,
}

impl JackStrawConfig {
    pub fn validate(&self) -> Result<()> {
        check(self.replicates > 0, || {
            "jackstraw_replicates must be at least 1".to_string()
        })?;
        check(self.prop_freq > 0.0 && self.prop_freq <= 1.0, || {
            format!("jackstraw_prop_freq must lie in (0, 1], got {}", self.prop_freq)
        })?;
        fraction("jackstraw_score_thresh", self.score_thresh)
    }
}

impl Default for JackStrawConfig {
    fn default() -> Self {
        PipelineConfig::default().jackstraw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_gene_thresholds_rejected() {
        let config = PipelineConfig {
            min_genes: 300,
            max_genes: 300,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("min_genes"));
    }

    #[test]
    fn neighbor_dims_cannot_exceed_components() {
        let config = PipelineConfig {
            n_pca_components: 5,
            n_neighbor_dims: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_and_partial_documents() {
        let config = PipelineConfig {
            min_genes: 1,
            max_genes: 50,
            max_percent_mito: 100.0,
            vars_to_regress: vec![Covariate::PercentMito],
            node_order: NodeOrder::Sequential,
            ..Default::default()
        };
        let json = config.to_json_string().unwrap();
        let back = PipelineConfig::from_json_str(&json).unwrap();
        assert_eq!(config, back);

        let partial = PipelineConfig::from_json_str(r#"{"cluster_resolution": 1.2}"#).unwrap();
        assert_eq!(partial.cluster_resolution, 1.2);
        assert_eq!(partial.neighbor_k, 20);
    }

    #[test]
    fn malformed_json_is_configuration_error() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        let err = PipelineConfig::from_json_str(r#"{"min_pct": 2.0}"#).unwrap_err();
        assert!(err.to_string().contains("min_pct"));
    }
}
