//! Cell and gene quality control.

use log::info;
use rayon::prelude::*;

use crate::config::QcThresholds;
use crate::error::{PipelineError, Result};
use crate::matrix::CountMatrix;
use crate::matrix::metadata::{CellMetadata, CellRecord};

/// Filtered counts together with the metadata of exactly the surviving cells.
#[derive(Debug, Clone, PartialEq)]
pub struct QcOutput {
    pub counts: CountMatrix,
    pub metadata: CellMetadata,
}

/// Per-cell `n_genes`, `n_counts` and `percent_mito`, in row order.
pub fn cell_stats(counts: &CountMatrix, mito_prefix: &str) -> Vec<CellRecord> {
    let mito: Vec<bool> = counts
        .gene_ids()
        .iter()
        .map(|g| !mito_prefix.is_empty() && g.starts_with(mito_prefix))
        .collect();
    let csr = counts.counts();

    (0..counts.n_cells())
        .into_par_iter()
        .map(|i| {
            let row = csr.row(i);
            let mut total = 0u64;
            let mut mito_total = 0u64;
            for (&g, &v) in row.col_indices().iter().zip(row.values()) {
                total += v as u64;
                if mito[g] {
                    mito_total += v as u64;
                }
            }
            let percent_mito = if total > 0 {
                mito_total as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            CellRecord {
                cell_id: counts.cell_ids()[i].clone(),
                n_genes: row.nnz(),
                n_counts: total,
                percent_mito,
                cluster: None,
            }
        })
        .collect()
}

/// Drop genes detected in fewer than `min_cells` cells. Applied once, at ingestion.
pub fn filter_genes(counts: &CountMatrix, min_cells: usize) -> Result<CountMatrix> {
    let keep: Vec<usize> = counts
        .cells_per_gene()
        .iter()
        .enumerate()
        .filter_map(|(g, &n)| (n >= min_cells).then_some(g))
        .collect();
    if keep.is_empty() {
        return Err(PipelineError::insufficient(format!(
            "no gene is detected in at least {min_cells} cells"
        )));
    }
    info!(
        "gene filter: kept {} of {} genes (min_cells = {min_cells})",
        keep.len(),
        counts.n_genes()
    );
    counts.subset_genes(&keep)
}

fn passes(record: &CellRecord, thresholds: &QcThresholds) -> bool {
    thresholds.min_genes < record.n_genes
        && record.n_genes < thresholds.max_genes
        && record.percent_mito < thresholds.max_percent_mito
}

/// Keep cells with `min_genes < n_genes < max_genes` and `percent_mito < max_percent_mito`.
///
/// The returned metadata describes only retained cells, in matrix row order.
pub fn filter_cells(counts: &CountMatrix, thresholds: &QcThresholds) -> Result<QcOutput> {
    thresholds.validate()?;

    let records = cell_stats(counts, &thresholds.mito_prefix);
    let keep: Vec<usize> = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| passes(r, thresholds).then_some(i))
        .collect();
    if keep.is_empty() {
        return Err(PipelineError::configuration(format!(
            "QC thresholds removed all {} cells (min_genes = {}, max_genes = {}, max_percent_mito = {})",
            counts.n_cells(),
            thresholds.min_genes,
            thresholds.max_genes,
            thresholds.max_percent_mito
        )));
    }

    let filtered = counts.subset_cells(&keep)?;
    let metadata = CellMetadata::from_records(
        keep.iter().map(|&i| records[i].clone()).collect(),
    );
    metadata.check_aligned(filtered.cell_ids())?;

    info!("cell QC: kept {} of {} cells", keep.len(), counts.n_cells());
    Ok(QcOutput {
        counts: filtered,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::ids;

    fn mito_matrix() -> CountMatrix {
        let genes = vec![
            "MT-CO1".to_string(),
            "ACTB".to_string(),
            "CD3E".to_string(),
            "MS4A1".to_string(),
        ];
        let triplets = [
            // cell0: 3 genes, 10% mito
            (0, 0, 1),
            (0, 1, 5),
            (0, 2, 4),
            // cell1: 1 gene
            (1, 1, 9),
            // cell2: 4 genes, 50% mito
            (2, 0, 6),
            (2, 1, 2),
            (2, 2, 2),
            (2, 3, 2),
            // cell3: 3 genes, no mito
            (3, 1, 1),
            (3, 2, 1),
            (3, 3, 2),
        ];
        CountMatrix::from_triplets(&triplets, ids("cell", 4), genes).unwrap()
    }

    fn thresholds() -> QcThresholds {
        QcThresholds {
            min_genes: 1,
            max_genes: 4,
            max_percent_mito: 20.0,
            mito_prefix: "MT-".to_string(),
        }
    }

    #[test]
    fn stats_follow_definitions() {
        let stats = cell_stats(&mito_matrix(), "MT-");
        assert_eq!(stats[0].n_genes, 3);
        assert_eq!(stats[0].n_counts, 10);
        assert!((stats[0].percent_mito - 10.0).abs() < 1e-12);
        assert!((stats[2].percent_mito - 50.0).abs() < 1e-12);
        assert_eq!(stats[3].percent_mito, 0.0);
    }

    #[test]
    fn retained_cells_satisfy_predicates() {
        let out = filter_cells(&mito_matrix(), &thresholds()).unwrap();
        assert_eq!(out.counts.cell_ids(), &["cell0".to_string(), "cell3".to_string()]);
        for r in out.metadata.records() {
            assert!(1 < r.n_genes && r.n_genes < 4);
            assert!(r.percent_mito < 20.0);
        }
        assert!(out.metadata.get("cell1").is_none());
        assert!(out.metadata.get("cell2").is_none());
        out.metadata.check_aligned(out.counts.cell_ids()).unwrap();
    }

    #[test]
    fn refiltering_is_a_no_op() {
        let once = filter_cells(&mito_matrix(), &thresholds()).unwrap();
        let twice = filter_cells(&once.counts, &thresholds()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn everything_filtered_is_a_configuration_error() {
        let strict = QcThresholds {
            min_genes: 3,
            max_genes: 4,
            max_percent_mito: 1.0,
            ..thresholds()
        };
        let err = filter_cells(&mito_matrix(), &strict).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn inverted_thresholds_fail_before_filtering() {
        let inverted = QcThresholds {
            min_genes: 5,
            max_genes: 2,
            ..thresholds()
        };
        assert!(matches!(
            filter_cells(&mito_matrix(), &inverted),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rare_genes_dropped() {
        let filtered = filter_genes(&mito_matrix(), 3).unwrap();
        assert_eq!(filtered.gene_ids(), &["ACTB".to_string(), "CD3E".to_string()]);
        assert!(matches!(
            filter_genes(&mito_matrix(), 10),
            Err(PipelineError::InsufficientData(_))
        ));
    }
}
