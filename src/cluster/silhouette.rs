//! Silhouette score for a flat clustering.
//!
//! Per-point cohesion/separation averaged over the dataset: values in
//! [-1, 1], higher means better-separated clusters. Matches the standard
//! definition: `s(i) = (b(i) - a(i)) / max(a(i), b(i))`, where `a` is the
//! mean intra-cluster distance and `b` the mean distance to the nearest
//! other cluster; singleton clusters score 0.

use crate::error::Result;
use crate::PipelineError;
use ndarray::Array2;

/// Compute the mean silhouette over all points.
///
/// Fails when the labelling has fewer than 2 or more than `n - 1` distinct
/// clusters — sweep callers skip such candidates without aborting.
pub fn silhouette_score(points: &Array2<f64>, labels: &[usize]) -> Result<f64> {
    let n = points.nrows();
    if labels.len() != n {
        return Err(PipelineError::Other(format!(
            "label count {} does not match {} points",
            labels.len(),
            n
        )));
    }

    let mut clusters: Vec<usize> = labels.to_vec();
    clusters.sort_unstable();
    clusters.dedup();
    let k = clusters.len();
    if k < 2 || k > n.saturating_sub(1) {
        return Err(PipelineError::InsufficientData(format!(
            "silhouette needs 2 <= clusters <= n - 1, got k={k} for n={n}"
        )));
    }

    let cluster_sizes: std::collections::HashMap<usize, usize> =
        clusters
            .iter()
            .map(|&c| (c, labels.iter().filter(|&&l| l == c).count()))
            .collect();

    let distance = |i: usize, j: usize| -> f64 {
        points
            .row(i)
            .iter()
            .zip(points.row(j).iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    };

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if cluster_sizes[&own] == 1 {
            continue; // s(i) = 0 for singletons
        }

        let mut intra = 0.0;
        let mut nearest_other = f64::INFINITY;
        for &other in &clusters {
            let mut sum = 0.0;
            let mut count = 0usize;
            for j in 0..n {
                if j == i || labels[j] != other {
                    continue;
                }
                sum += distance(i, j);
                count += 1;
            }
            if other == own {
                intra = sum / count as f64;
            } else if count > 0 {
                let mean = sum / count as f64;
                if mean < nearest_other {
                    nearest_other = mean;
                }
            }
        }

        let denom = intra.max(nearest_other);
        if denom > 0.0 {
            total += (nearest_other - intra) / denom;
        }
    }

    Ok(total / n as f64)
}
