//! Seeded k-means over 2-D points.
//!
//! K-means++ initialisation followed by Lloyd iterations. Deterministic
//! for a fixed seed. An empty cluster is repaired by reseeding its
//! centroid onto the point farthest from its assigned centroid.

use crate::error::Result;
use crate::PipelineError;
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_EPS: f64 = 1e-8;

/// A fitted k-means model.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    /// Cluster index per input point.
    pub labels: Vec<usize>,
    /// `k × d` centroid matrix.
    pub centroids: Array2<f64>,
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Fit k-means with `k` clusters on an `n × d` matrix.
pub fn kmeans(points: &Array2<f64>, k: usize, seed: u64) -> Result<KMeansFit> {
    let n = points.nrows();
    if k == 0 {
        return Err(PipelineError::InsufficientData(
            "cannot cluster into zero clusters".into(),
        ));
    }
    if n < k {
        return Err(PipelineError::InsufficientData(format!(
            "{n} samples cannot form {k} clusters"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = plus_plus_init(points, k, &mut rng);
    let mut labels = vec![0usize; n];

    for _ in 0..MAX_ITERATIONS {
        // Assignment.
        for i in 0..n {
            let point = points.row(i);
            labels[i] = (0..k)
                .map(|c| (c, squared_distance(point, centroids.row(c))))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(c, _)| c)
                .unwrap_or(0);
        }

        // Update.
        let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
        let mut counts = vec![0usize; k];
        for i in 0..n {
            let c = labels[i];
            counts[c] += 1;
            let mut row = sums.row_mut(c);
            row += &points.row(i);
        }

        let mut shift = 0.0;
        for c in 0..k {
            if counts[c] == 0 {
                // Reseed onto the point farthest from its centroid.
                let farthest = (0..n)
                    .max_by(|&a, &b| {
                        squared_distance(points.row(a), centroids.row(labels[a]))
                            .total_cmp(&squared_distance(points.row(b), centroids.row(labels[b])))
                    })
                    .unwrap_or(0);
                centroids.row_mut(c).assign(&points.row(farthest));
                shift += 1.0;
                continue;
            }
            let new_centroid = sums.row(c).mapv(|v| v / counts[c] as f64);
            shift += squared_distance(new_centroid.view(), centroids.row(c));
            centroids.row_mut(c).assign(&new_centroid);
        }

        if shift < CONVERGENCE_EPS {
            break;
        }
    }

    // Final assignment against the converged centroids.
    for i in 0..n {
        let point = points.row(i);
        labels[i] = (0..k)
            .map(|c| (c, squared_distance(point, centroids.row(c))))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, _)| c)
            .unwrap_or(0);
    }

    Ok(KMeansFit { labels, centroids })
}

/// K-means++ seeding: the first centroid uniformly, each next one with
/// probability proportional to the squared distance from the nearest
/// chosen centroid.
fn plus_plus_init(points: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = points.nrows();
    let d = points.ncols();
    let mut centroids = Array2::<f64>::zeros((k, d));

    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&points.row(first));

    let mut nearest = vec![f64::INFINITY; n];
    for c in 1..k {
        for i in 0..n {
            let dist = squared_distance(points.row(i), centroids.row(c - 1));
            if dist < nearest[i] {
                nearest[i] = dist;
            }
        }
        let total: f64 = nearest.iter().sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut pick = n - 1;
            for (i, &weight) in nearest.iter().enumerate() {
                if target < weight {
                    pick = i;
                    break;
                }
                target -= weight;
            }
            pick
        };
        centroids.row_mut(c).assign(&points.row(chosen));
    }

    centroids
}
