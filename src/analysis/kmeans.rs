use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use super::similarity::squared_distance;
use crate::error::{Error, Result};
use crate::types::EmbeddingVector;

#[derive(Debug, Clone, Copy)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            k: 6,
            max_iterations: 100,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KMeansResult {
    /// Cluster index per input point
    pub assignments: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
    pub iterations: usize,
    pub converged: bool,
}

impl KMeansResult {
    pub fn members(&self, cluster: usize) -> impl Iterator<Item = usize> + '_ {
        self.assignments
            .iter()
            .enumerate()
            .filter(move |(_, &c)| c == cluster)
            .map(|(i, _)| i)
    }
}

/// Lloyd's algorithm with seeded k-means++ initialization.
///
/// `k` is clamped to the number of points. The same input and seed always
/// give the same assignments. Cancellation is observed between iterations.
pub fn kmeans(
    points: &[EmbeddingVector],
    params: KMeansParams,
    cancel: &CancellationToken,
) -> Result<KMeansResult> {
    let k = params.k.min(points.len());
    if k == 0 {
        return Ok(KMeansResult::default());
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = seed_centroids(points, k, &mut rng);
    let mut assignments = vec![usize::MAX; points.len()];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iterations {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        iterations += 1;

        let next: Vec<usize> = points
            .par_iter()
            .map(|p| nearest(p.as_slice(), &centroids))
            .collect();
        if next == assignments {
            converged = true;
            break;
        }
        assignments = next;

        let dim = points[0].as_slice().len();
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in points.iter().zip(&assignments) {
            counts[cluster] += 1;
            for (acc, v) in sums[cluster].iter_mut().zip(point.as_slice()) {
                *acc += v;
            }
        }
        for (cluster, sum) in sums.into_iter().enumerate() {
            // Empty clusters keep their previous centroid
            if counts[cluster] > 0 {
                let n = counts[cluster] as f32;
                centroids[cluster] = sum.into_iter().map(|v| v / n).collect();
            }
        }
    }

    tracing::debug!("k-means finished after {iterations} iterations (converged: {converged})");
    Ok(KMeansResult {
        assignments,
        centroids,
        iterations,
        converged,
    })
}

/// k-means++: each next seed is drawn with probability proportional to its
/// squared distance from the nearest seed already chosen
fn seed_centroids(points: &[EmbeddingVector], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut chosen = vec![rng.gen_range(0..points.len())];

    while chosen.len() < k {
        let distances: Vec<f64> = points
            .iter()
            .map(|p| {
                chosen
                    .iter()
                    .map(|&c| f64::from(squared_distance(p.as_slice(), points[c].as_slice())))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = distances.iter().sum();

        let pick = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut pick = None;
            for (i, d) in distances.iter().enumerate() {
                if *d > 0.0 && target < *d {
                    pick = Some(i);
                    break;
                }
                target -= d;
            }
            // Float round-off can run past the end; take the last candidate
            pick.or_else(|| distances.iter().rposition(|d| *d > 0.0))
        } else {
            None
        };

        // All remaining points coincide with a seed: take the next unused index
        let pick = pick
            .or_else(|| (0..points.len()).find(|i| !chosen.contains(i)))
            .unwrap_or(0);
        chosen.push(pick);
    }

    chosen
        .into_iter()
        .map(|i| points[i].as_slice().to_vec())
        .collect()
}

/// Index of the closest centroid; ties go to the lowest index
fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}
