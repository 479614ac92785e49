//! The hierarchical clustering engine.
//!
//! CPU-bound, no LLM involvement: a seeded 2-D projection of the embedding
//! matrix, k-means at the finest granularity, then Ward-linkage
//! agglomerative merging of the leaf centroids to derive the coarser level.
//! The auto-tune sweep scores candidate cluster counts by silhouette on the
//! 2-D embedding.

pub mod agglomerative;
pub mod kmeans;
pub mod projection;
pub mod silhouette;

pub use agglomerative::ward_cut;
pub use kmeans::{kmeans, KMeansFit};
pub use projection::{neighbor_count, project_to_plane};
pub use silhouette::silhouette_score;

use crate::error::Result;
use ndarray::Array2;

/// Deterministic seed shared by the projection and k-means.
pub const CLUSTER_SEED: u64 = 42;

/// Per-argument assignments for one hierarchy level, finest level last.
#[derive(Debug, Clone)]
pub struct HierarchyAssignments {
    /// `levels[l][i]` is the cluster index of point `i` at level `l + 1`.
    pub levels: Vec<Vec<usize>>,
    /// The cluster counts the levels were cut at, ascending.
    pub cluster_nums: Vec<usize>,
}

/// Cluster 2-D points into a two-level hierarchy.
///
/// K-means runs once at `max(cluster_nums)`; each smaller count is derived
/// by merging the leaf centroids agglomeratively and relabelling every
/// point through its leaf.
pub fn assign_hierarchy(points: &Array2<f64>, cluster_nums: &[usize]) -> Result<HierarchyAssignments> {
    let mut nums: Vec<usize> = cluster_nums.to_vec();
    nums.sort_unstable();

    let leaf_k = *nums.last().expect("cluster_nums must not be empty");
    let fit = kmeans(points, leaf_k, CLUSTER_SEED)?;

    let mut levels = Vec::with_capacity(nums.len());
    for &cut in &nums[..nums.len() - 1] {
        let merged = ward_cut(&fit.centroids, cut)?;
        let labels: Vec<usize> = fit.labels.iter().map(|&leaf| merged[leaf]).collect();
        levels.push(labels);
    }
    levels.push(fit.labels.clone());

    Ok(HierarchyAssignments {
        levels,
        cluster_nums: nums,
    })
}

/// Format a cluster id as `"<level>_<label>"` to prevent cross-level
/// collisions.
pub fn cluster_id(level: usize, label: usize) -> String {
    format!("{level}_{label}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Four well-separated blobs of five points each.
    fn blobs() -> Array2<f64> {
        let centers = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)];
        let mut data = Vec::new();
        for (cx, cy) in centers {
            for i in 0..5 {
                let offset = i as f64 * 0.1;
                data.push(cx + offset);
                data.push(cy - offset);
            }
        }
        Array2::from_shape_vec((20, 2), data).unwrap()
    }

    #[test]
    fn test_assign_hierarchy_levels_and_counts() {
        let points = blobs();
        let hierarchy = assign_hierarchy(&points, &[2, 4]).unwrap();
        assert_eq!(hierarchy.cluster_nums, vec![2, 4]);
        assert_eq!(hierarchy.levels.len(), 2);

        let distinct = |labels: &[usize]| {
            let mut seen: Vec<usize> = labels.to_vec();
            seen.sort_unstable();
            seen.dedup();
            seen.len()
        };
        assert!(distinct(&hierarchy.levels[0]) <= 2);
        assert_eq!(distinct(&hierarchy.levels[1]), 4);
    }

    #[test]
    fn test_level2_refines_level1() {
        let points = blobs();
        let hierarchy = assign_hierarchy(&points, &[2, 4]).unwrap();
        // Every level-2 cluster maps into exactly one level-1 cluster.
        let mut parent: std::collections::HashMap<usize, usize> = Default::default();
        for i in 0..points.nrows() {
            let l1 = hierarchy.levels[0][i];
            let l2 = hierarchy.levels[1][i];
            let entry = parent.entry(l2).or_insert(l1);
            assert_eq!(*entry, l1, "level-2 cluster {l2} has two parents");
        }
    }

    #[test]
    fn test_assignments_deterministic() {
        let points = blobs();
        let a = assign_hierarchy(&points, &[2, 4]).unwrap();
        let b = assign_hierarchy(&points, &[2, 4]).unwrap();
        assert_eq!(a.levels, b.levels);
    }

    #[test]
    fn test_cluster_id_format() {
        assert_eq!(cluster_id(1, 3), "1_3");
        assert_eq!(cluster_id(2, 0), "2_0");
    }
}
