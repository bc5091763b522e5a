//! Shared-nearest-neighbor refinement of a k-NN graph.
//!
//! Every cell's neighborhood includes the cell itself. Two cells are joined whenever their
//! neighborhoods intersect, weighted by the Jaccard index of the two neighborhoods.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::graph::knn::KnnResult;

/// Symmetric adjacency rows `(neighbor, weight)` sorted by neighbor, without self-loops.
pub(crate) fn jaccard_rows(knn: &KnnResult, prune: f64) -> Vec<Vec<(usize, f64)>> {
    let n = knn.n_cells();
    let neighborhood = |i: usize| std::iter::once(i).chain(knn.indices[i].iter().copied());

    // reverse[m] lists the cells whose neighborhood contains m
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for m in neighborhood(i) {
            reverse[m].push(i);
        }
    }

    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut shared: HashMap<usize, usize> = HashMap::new();
            for m in neighborhood(i) {
                for &j in &reverse[m] {
                    if j != i {
                        *shared.entry(j).or_insert(0) += 1;
                    }
                }
            }
            let size_i = knn.indices[i].len() + 1;
            let mut row: Vec<(usize, f64)> = shared
                .into_iter()
                .filter_map(|(j, s)| {
                    let size_j = knn.indices[j].len() + 1;
                    let weight = s as f64 / (size_i + size_j - s) as f64;
                    (weight > 0.0 && weight >= prune).then_some((j, weight))
                })
                .collect();
            row.sort_unstable_by_key(|&(j, _)| j);
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knn(indices: Vec<Vec<usize>>) -> KnnResult {
        let distances = indices.iter().map(|nn| vec![1.0; nn.len()]).collect();
        KnnResult { indices, distances }
    }

    #[test]
    fn jaccard_of_neighborhoods() {
        // N(0) = {0,1}, N(1) = {1,0}, N(2) = {2,1}
        let rows = jaccard_rows(&knn(vec![vec![1], vec![0], vec![1]]), 0.0);
        assert_eq!(rows[0], vec![(1, 1.0), (2, 1.0 / 3.0)]);
        assert_eq!(rows[1], vec![(0, 1.0), (2, 1.0 / 3.0)]);
        assert_eq!(rows[2], vec![(0, 1.0 / 3.0), (1, 1.0 / 3.0)]);
    }

    #[test]
    fn one_sided_nomination_is_symmetric() {
        // 2 nominates 0 but 0 does not nominate 2
        let rows = jaccard_rows(&knn(vec![vec![1], vec![0], vec![0]]), 0.0);
        let w02 = rows[0].iter().find(|e| e.0 == 2).map(|e| e.1);
        let w20 = rows[2].iter().find(|e| e.0 == 0).map(|e| e.1);
        assert!(w02.is_some());
        assert_eq!(w02, w20);
    }

    #[test]
    fn pruning_drops_weak_edges() {
        let rows = jaccard_rows(&knn(vec![vec![1], vec![0], vec![1]]), 0.5);
        assert_eq!(rows[0], vec![(1, 1.0)]);
        assert!(rows[2].is_empty());
    }
}
