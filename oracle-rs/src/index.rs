// oracle-rs/src/index.rs
// Nearest-neighbour search over corpus vectors.

use std::cmp::Ordering;

use crate::error::{OracleError, Result};

/// One search hit: position in the corpus and Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

/// Search seam so an approximate index can stand in for the exact one.
///
/// Implementations return at most `k` hits ordered by ascending distance,
/// ties broken by ascending corpus index.
pub trait NearestNeighbors: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor>;
}

/// Exact search: every query scans the whole corpus.
#[derive(Debug, Clone, Default)]
pub struct BruteForceIndex {
    vectors: Vec<Vec<f32>>,
}

impl BruteForceIndex {
    /// Builds the index; every vector must have the same dimensionality.
    pub fn build(vectors: Vec<Vec<f32>>) -> Result<Self> {
        if let Some(first) = vectors.first() {
            let expected = first.len();
            if let Some((index, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != expected) {
                return Err(OracleError::DimensionMismatch {
                    index,
                    expected,
                    found: v.len(),
                });
            }
        }
        Ok(Self { vectors })
    }
}

impl NearestNeighbors for BruteForceIndex {
    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut scored: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(index, v)| Neighbor {
                index,
                distance: euclidean(query, v),
            })
            .collect();

        scored.sort_by(by_distance_then_index);
        scored.truncate(k);
        scored
    }
}

pub(crate) fn by_distance_then_index(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.index.cmp(&b.index))
}

/// Euclidean distance; a length mismatch compares the shared prefix and
/// counts missing coordinates as zero.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let d = a.get(i).copied().unwrap_or(0.0) - b.get(i).copied().unwrap_or(0.0);
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_orders_by_distance_then_index() {
        let index = BruteForceIndex::build(vec![
            vec![1.0, 0.0],
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 0.0],
        ])
        .unwrap();

        let hits = index.nearest(&[0.0, 0.0], 3);
        let order: Vec<usize> = hits.iter().map(|n| n.index).collect();
        assert_eq!(order, vec![1, 3, 0]);
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[2].distance, 1.0);
    }

    #[test]
    fn rejects_ragged_vectors() {
        let err = BruteForceIndex::build(vec![vec![0.0; 3], vec![0.0; 2]]).unwrap_err();
        assert!(matches!(
            err,
            OracleError::DimensionMismatch { index: 1, expected: 3, found: 2 }
        ));
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = BruteForceIndex::build(Vec::new()).unwrap();
        assert!(index.is_empty());
        assert!(index.nearest(&[1.0], 5).is_empty());
    }
}
