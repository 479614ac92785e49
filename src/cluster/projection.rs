//! Seeded 2-D projection of high-dimensional embedding vectors.
//!
//! Principal-component projection via power iteration with deflation: the
//! two directions of highest variance become the report's `x`/`y` plane.
//! Deterministic for a fixed seed, which keeps cluster geometry stable
//! across re-runs of the same job.

use crate::error::Result;
use crate::PipelineError;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const POWER_ITERATIONS: usize = 100;
const CONVERGENCE_EPS: f64 = 1e-9;

/// The neighbour-count clamp applied before projecting:
/// `max(2, min(15, n_samples - 1))`.
pub fn neighbor_count(n_samples: usize) -> usize {
    15.min(n_samples.saturating_sub(1)).max(2)
}

/// Project an `n × d` embedding matrix onto its two principal axes.
///
/// Fails with [`PipelineError::InsufficientData`] when there are too few
/// samples for the neighbour clamp to hold (`n_samples < 3`).
pub fn project_to_plane(embeddings: &Array2<f64>, seed: u64) -> Result<Array2<f64>> {
    let n = embeddings.nrows();
    let d = embeddings.ncols();
    if n < 3 {
        return Err(PipelineError::InsufficientData(format!(
            "{n} samples is below the neighbour threshold {}; the corpus is too small to cluster",
            neighbor_count(n)
        )));
    }
    if d == 0 {
        return Err(PipelineError::InsufficientData(
            "embedding vectors are empty".into(),
        ));
    }

    // Center columns.
    let mean = embeddings
        .mean_axis(Axis(0))
        .expect("non-empty matrix has a column mean");
    let centered = embeddings - &mean.view().insert_axis(Axis(0));

    let mut rng = StdRng::seed_from_u64(seed);
    let first = principal_direction(&centered, None, &mut rng);
    let second = principal_direction(&centered, Some(&first), &mut rng);

    let mut projected = Array2::zeros((n, 2));
    for i in 0..n {
        let row = centered.row(i);
        projected[[i, 0]] = row.dot(&first);
        projected[[i, 1]] = row.dot(&second);
    }
    Ok(projected)
}

/// Power iteration for the dominant direction of `Xᵀ X`, deflating against
/// an already-found direction when given.
fn principal_direction(
    centered: &Array2<f64>,
    deflate: Option<&Array1<f64>>,
    rng: &mut StdRng,
) -> Array1<f64> {
    let d = centered.ncols();
    let mut v: Array1<f64> = Array1::from_iter((0..d).map(|_| rng.gen_range(-1.0..1.0)));
    orthogonalize(&mut v, deflate);
    normalize(&mut v);

    for _ in 0..POWER_ITERATIONS {
        // w = Xᵀ (X v)
        let projected = centered.dot(&v);
        let mut w = centered.t().dot(&projected);
        orthogonalize(&mut w, deflate);
        let norm = normalize(&mut w);
        if norm < CONVERGENCE_EPS {
            // Degenerate variance along this axis; keep the previous vector.
            break;
        }
        let delta = (&w - &v).mapv(f64::abs).sum();
        v = w;
        if delta < CONVERGENCE_EPS {
            break;
        }
    }
    v
}

fn orthogonalize(v: &mut Array1<f64>, against: Option<&Array1<f64>>) {
    if let Some(basis) = against {
        let projection = v.dot(basis);
        *v -= &(basis * projection);
    }
}

fn normalize(v: &mut Array1<f64>) -> f64 {
    let norm = v.dot(v).sqrt();
    if norm > 0.0 {
        *v /= norm;
    }
    norm
}
