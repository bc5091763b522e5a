//! k-nearest-neighbor search in embedding space.

use instant_distance::{Builder, Search};
use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Neighbors of every cell, nearest first, never including the cell itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnResult {
    pub indices: Vec<Vec<usize>>,
    pub distances: Vec<Vec<f64>>,
}

impl KnnResult {
    pub fn n_cells(&self) -> usize {
        self.indices.len()
    }
}

fn squared_distance(points: &ArrayView2<f64>, a: usize, b: usize) -> f64 {
    points
        .row(a)
        .iter()
        .zip(points.row(b).iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

fn finish(mut candidates: Vec<(f64, usize)>, k: usize) -> (Vec<usize>, Vec<f64>) {
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    candidates.truncate(k);
    candidates.into_iter().map(|(d, j)| (j, d.sqrt())).unzip()
}

/// Brute-force Euclidean k-NN. Equal distances are ordered by cell index.
pub fn exact_knn(points: ArrayView2<f64>, k: usize) -> KnnResult {
    let n = points.nrows();
    let k = k.min(n.saturating_sub(1));

    let (indices, distances) = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut candidates: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (squared_distance(&points, i, j), j))
                .collect();
            if k < candidates.len() {
                candidates.select_nth_unstable_by(k, |a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                candidates.truncate(k);
            }
            finish(candidates, k)
        })
        .unzip();

    KnnResult { indices, distances }
}

#[derive(Clone)]
struct EmbeddedPoint {
    coords: Vec<f32>,
}

impl instant_distance::Point for EmbeddedPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.coords
            .iter()
            .zip(other.coords.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// Approximate k-NN through a seeded HNSW index. Distances of the returned neighbors are
/// recomputed exactly, so only neighbor recall is approximate.
pub fn approximate_knn(points: ArrayView2<f64>, k: usize, seed: u64) -> KnnResult {
    let n = points.nrows();
    let k = k.min(n.saturating_sub(1));

    let embedded: Vec<EmbeddedPoint> = (0..n)
        .map(|i| EmbeddedPoint {
            coords: points.row(i).iter().map(|&v| v as f32).collect(),
        })
        .collect();
    let index = Builder::default()
        .seed(seed)
        .ef_search((4 * (k + 1)).max(100))
        .build(embedded.clone(), (0..n).collect::<Vec<usize>>());

    let (indices, distances) = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut search = Search::default();
            let candidates: Vec<(f64, usize)> = index
                .search(&embedded[i], &mut search)
                .map(|item| *item.value)
                .filter(|&j| j != i)
                .take(k)
                .map(|j| (squared_distance(&points, i, j), j))
                .collect();
            finish(candidates, k)
        })
        .unzip();

    KnnResult { indices, distances }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn line(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { 0.0 })
    }

    #[test]
    fn exact_neighbors_on_a_line() {
        let points = line(6);
        let knn = exact_knn(points.view(), 2);
        assert_eq!(knn.indices[0], vec![1, 2]);
        // equidistant neighbors are ordered by index
        assert_eq!(knn.indices[3], vec![2, 4]);
        assert_eq!(knn.distances[3], vec![1.0, 1.0]);
        assert_eq!(knn.indices[5], vec![4, 3]);
        assert!(knn.indices.iter().enumerate().all(|(i, nn)| !nn.contains(&i)));
    }

    #[test]
    fn k_is_clamped_to_available_cells() {
        let knn = exact_knn(line(3).view(), 10);
        assert!(knn.indices.iter().all(|nn| nn.len() == 2));
    }

    #[test]
    fn approximate_search_recovers_clear_neighbors() {
        let points = Array2::from_shape_fn((60, 2), |(i, j)| {
            let cluster = (i / 20) as f64 * 100.0;
            if j == 0 { cluster + (i % 20) as f64 * 0.1 } else { 0.0 }
        });
        let knn = approximate_knn(points.view(), 5, 42);
        for (i, nn) in knn.indices.iter().enumerate() {
            assert_eq!(nn.len(), 5);
            assert!(nn.iter().all(|&j| j / 20 == i / 20));
        }
    }
}
