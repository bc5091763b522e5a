//! A pipeline run as an arena of committed stage outputs.
//!
//! Each stage method reads its predecessors' outputs, computes into a local value and
//! only then commits it, discarding every output downstream of it. A stage that fails
//! leaves the session exactly as it was.

use log::info;

use crate::cancel::CancellationToken;
use crate::clustering::{ClusterAssignment, louvain};
use crate::config::{LouvainConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::graph::{NeighborGraphData, build_neighbor_graph};
use crate::markers::{MarkerTable, find_all_markers, find_markers};
use crate::matrix::CountMatrix;
use crate::matrix::metadata::CellMetadata;
use crate::preprocessing::{
    FeatureSet, NormalizedMatrix, QcOutput, ScaledMatrix, filter_cells, filter_genes,
    find_variable_features, log_normalize, scale_data,
};
use crate::reduction::{Embedding, JackStrawResult, jackstraw, run_pca};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Qc,
    Normalize,
    Features,
    Scale,
    Reduce,
    Graph,
    Cluster,
    Markers,
}

fn require<'a, T>(value: Option<&'a T>, stage: &str, needs: &str) -> Result<&'a T> {
    value.ok_or_else(|| {
        PipelineError::integrity(format!("{stage} requires {needs} to have completed"))
    })
}

#[derive(Debug, Clone)]
pub struct Session {
    config: PipelineConfig,
    cancel: CancellationToken,
    counts: CountMatrix,
    qc: Option<QcOutput>,
    normalized: Option<NormalizedMatrix>,
    features: Option<FeatureSet>,
    scaled: Option<ScaledMatrix>,
    embedding: Option<Embedding>,
    jackstraw: Option<JackStrawResult>,
    graph: Option<NeighborGraphData>,
    clusters: Option<ClusterAssignment>,
    markers: Option<Vec<MarkerTable>>,
}

impl Session {
    /// Validate `config` and ingest `counts`, dropping genes detected in fewer than
    /// `min_cells` cells.
    pub fn new(counts: CountMatrix, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let counts = filter_genes(&counts, config.min_cells)?;
        info!(
            "session: {} cells x {} genes after gene filtering",
            counts.n_cells(),
            counts.n_genes()
        );
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            counts,
            qc: None,
            normalized: None,
            features: None,
            scaled: None,
            embedding: None,
            jackstraw: None,
            graph: None,
            clusters: None,
            markers: None,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingested counts, before cell QC.
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    fn invalidate_from(&mut self, stage: Stage) {
        if stage <= Stage::Qc {
            self.qc = None;
        }
        if stage <= Stage::Normalize {
            self.normalized = None;
        }
        if stage <= Stage::Features {
            self.features = None;
        }
        if stage <= Stage::Scale {
            self.scaled = None;
        }
        if stage <= Stage::Reduce {
            self.embedding = None;
            self.jackstraw = None;
        }
        if stage <= Stage::Graph {
            self.graph = None;
        }
        if stage <= Stage::Cluster {
            self.clusters = None;
        }
        self.markers = None;
    }

    pub fn run_qc(&mut self) -> Result<&QcOutput> {
        let output = filter_cells(&self.counts, &self.config.qc())?;
        self.invalidate_from(Stage::Qc);
        Ok(self.qc.insert(output))
    }

    pub fn normalize(&mut self) -> Result<&NormalizedMatrix> {
        let qc = require(self.qc.as_ref(), "normalize", "run_qc")?;
        let normalized = log_normalize(&qc.counts, self.config.scale_factor)?;
        self.invalidate_from(Stage::Normalize);
        Ok(self.normalized.insert(normalized))
    }

    pub fn select_features(&mut self) -> Result<&FeatureSet> {
        require(self.normalized.as_ref(), "select_features", "normalize")?;
        let qc = require(self.qc.as_ref(), "select_features", "run_qc")?;
        let features = find_variable_features(&qc.counts, &self.config.vst())?;
        self.invalidate_from(Stage::Features);
        Ok(self.features.insert(features))
    }

    pub fn scale(&mut self) -> Result<&ScaledMatrix> {
        let features = require(self.features.as_ref(), "scale", "select_features")?;
        let normalized = require(self.normalized.as_ref(), "scale", "normalize")?;
        let qc = require(self.qc.as_ref(), "scale", "run_qc")?;
        let scaled = scale_data(normalized, features, &qc.metadata, &self.config.scaling())?;
        self.invalidate_from(Stage::Scale);
        Ok(self.scaled.insert(scaled))
    }

    pub fn reduce(&mut self) -> Result<&Embedding> {
        let scaled = require(self.scaled.as_ref(), "reduce", "scale")?;
        let embedding = run_pca(scaled, &self.config.pca())?;
        self.invalidate_from(Stage::Reduce);
        Ok(self.embedding.insert(embedding))
    }

    /// Permutation significance of the leading `dims` components. Does not affect any
    /// other stage output.
    pub fn jackstraw(&mut self, dims: usize) -> Result<&JackStrawResult> {
        let embedding = require(self.embedding.as_ref(), "jackstraw", "reduce")?;
        let scaled = require(self.scaled.as_ref(), "jackstraw", "scale")?;
        let result = jackstraw(
            scaled,
            embedding,
            dims,
            &self.config.pca(),
            &self.config.jackstraw(),
            &self.cancel,
        )?;
        Ok(self.jackstraw.insert(result))
    }

    pub fn build_graph(&mut self) -> Result<&NeighborGraphData> {
        let embedding = require(self.embedding.as_ref(), "build_graph", "reduce")?;
        let graph = build_neighbor_graph(embedding, &self.config.neighbors())?;
        self.invalidate_from(Stage::Graph);
        Ok(self.graph.insert(graph))
    }

    /// Cluster at the configured resolution.
    pub fn cluster(&mut self) -> Result<&ClusterAssignment> {
        self.cluster_at(self.config.cluster_resolution)
    }

    /// Cluster at `resolution`, replacing any previous assignment.
    pub fn cluster_at(&mut self, resolution: f64) -> Result<&ClusterAssignment> {
        let graph = require(self.graph.as_ref(), "cluster", "build_graph")?;
        let config = LouvainConfig {
            resolution,
            ..self.config.louvain()
        };
        let assignment = louvain(graph, &config)?;
        self.invalidate_from(Stage::Cluster);
        Ok(self.clusters.insert(assignment))
    }

    /// Markers of every cluster against all other cells.
    pub fn find_all_markers(&mut self) -> Result<&[MarkerTable]> {
        let clusters = require(self.clusters.as_ref(), "find_all_markers", "cluster")?;
        let normalized = require(self.normalized.as_ref(), "find_all_markers", "normalize")?;
        let tables = find_all_markers(normalized, clusters, &self.config.markers(), &self.cancel)?;
        self.invalidate_from(Stage::Markers);
        Ok(self.markers.insert(tables))
    }

    /// Markers of one cluster against another cluster, or against all other cells.
    /// Nothing is committed.
    pub fn markers_between(&self, cluster: usize, reference: Option<usize>) -> Result<MarkerTable> {
        let clusters = require(self.clusters.as_ref(), "markers_between", "cluster")?;
        let normalized = require(self.normalized.as_ref(), "markers_between", "normalize")?;
        for c in std::iter::once(cluster).chain(reference) {
            if c >= clusters.n_clusters() {
                return Err(PipelineError::configuration(format!(
                    "cluster {c} does not exist ({} clusters)",
                    clusters.n_clusters()
                )));
            }
        }
        if reference == Some(cluster) {
            return Err(PipelineError::configuration(
                "a cluster cannot be its own reference",
            ));
        }
        let group = clusters.members(cluster);
        let reference_cells = reference.map(|r| clusters.members(r));
        let mut table = find_markers(
            normalized,
            &group,
            reference_cells.as_deref(),
            &self.config.markers(),
        )?;
        table.cluster = Some(cluster);
        Ok(table)
    }

    /// Every stage from QC through marker detection. JackStraw is not part of the run.
    pub fn run(&mut self) -> Result<()> {
        self.run_qc()?;
        self.normalize()?;
        self.select_features()?;
        self.scale()?;
        self.reduce()?;
        self.build_graph()?;
        self.cluster()?;
        self.find_all_markers()?;
        Ok(())
    }

    pub fn qc_output(&self) -> Option<&QcOutput> {
        self.qc.as_ref()
    }

    pub fn normalized(&self) -> Option<&NormalizedMatrix> {
        self.normalized.as_ref()
    }

    pub fn features(&self) -> Option<&FeatureSet> {
        self.features.as_ref()
    }

    pub fn scaled(&self) -> Option<&ScaledMatrix> {
        self.scaled.as_ref()
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }

    pub fn jackstraw_result(&self) -> Option<&JackStrawResult> {
        self.jackstraw.as_ref()
    }

    pub fn graph(&self) -> Option<&NeighborGraphData> {
        self.graph.as_ref()
    }

    pub fn clusters(&self) -> Option<&ClusterAssignment> {
        self.clusters.as_ref()
    }

    pub fn markers(&self) -> Option<&[MarkerTable]> {
        self.markers.as_deref()
    }

    /// QC metadata of the retained cells, with the cluster column filled in once
    /// clustering has run.
    pub fn cell_metadata(&self) -> Result<Option<CellMetadata>> {
        let Some(qc) = self.qc.as_ref() else {
            return Ok(None);
        };
        match self.clusters.as_ref() {
            Some(clusters) => qc.metadata.with_clusters(clusters).map(Some),
            None => Ok(Some(qc.metadata.clone())),
        }
    }
}
