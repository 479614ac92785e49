//! Ward-linkage agglomerative merging of cluster centroids.
//!
//! The leaf centroids from k-means are merged pairwise, always joining the
//! pair with the smallest Ward cost (the increase in within-cluster
//! variance), until the requested number of clusters remains. Centroid
//! sets are small (≤ a few hundred), so the O(k³) greedy merge is fine.

use crate::error::Result;
use crate::PipelineError;
use ndarray::{Array1, Array2};

/// Merge `centroids` down to `k_cut` clusters and return the merged
/// cluster index (0-based, relabelled densely) per original centroid.
pub fn ward_cut(centroids: &Array2<f64>, k_cut: usize) -> Result<Vec<usize>> {
    let k = centroids.nrows();
    if k_cut == 0 {
        return Err(PipelineError::InsufficientData(
            "cannot cut a hierarchy at zero clusters".into(),
        ));
    }
    if k_cut > k {
        return Err(PipelineError::InsufficientData(format!(
            "cannot cut {k} centroids into {k_cut} clusters"
        )));
    }

    struct Node {
        mean: Array1<f64>,
        size: f64,
        members: Vec<usize>,
        alive: bool,
    }

    let mut nodes: Vec<Node> = (0..k)
        .map(|i| Node {
            mean: centroids.row(i).to_owned(),
            size: 1.0,
            members: vec![i],
            alive: true,
        })
        .collect();

    // Ward cost for merging clusters a and b:
    // (|a| * |b|) / (|a| + |b|) * ||mean_a - mean_b||².
    let ward_cost = |a: &Node, b: &Node| -> f64 {
        let diff = &a.mean - &b.mean;
        let dist_sq = diff.dot(&diff);
        (a.size * b.size) / (a.size + b.size) * dist_sq
    };

    let mut alive_count = k;
    while alive_count > k_cut {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..nodes.len() {
            if !nodes[i].alive {
                continue;
            }
            for j in (i + 1)..nodes.len() {
                if !nodes[j].alive {
                    continue;
                }
                let cost = ward_cost(&nodes[i], &nodes[j]);
                if best.map_or(true, |(_, _, c)| cost < c) {
                    best = Some((i, j, cost));
                }
            }
        }
        let (i, j, _) = best.expect("at least two clusters remain");

        let (size_i, size_j) = (nodes[i].size, nodes[j].size);
        let merged_size = size_i + size_j;
        let merged_mean =
            (&nodes[i].mean * size_i + &nodes[j].mean * size_j).mapv(|v| v / merged_size);
        let mut merged_members = std::mem::take(&mut nodes[i].members);
        merged_members.extend(std::mem::take(&mut nodes[j].members));

        nodes[i].mean = merged_mean;
        nodes[i].size = merged_size;
        nodes[i].members = merged_members;
        nodes[j].alive = false;
        alive_count -= 1;
    }

    let mut labels = vec![0usize; k];
    let mut next_label = 0usize;
    for node in &nodes {
        if !node.alive {
            continue;
        }
        for &member in &node.members {
            labels[member] = next_label;
        }
        next_label += 1;
    }
    Ok(labels)
}
