//! Hierarchical clustering stage.
//!
//! Projects the embedding matrix onto the 2-D report plane, clusters at the
//! finest count with k-means, and derives the coarser level by merging leaf
//! centroids. In auto-cluster mode a silhouette sweep picks both counts
//! first and records the full sweep into the status file.

use crate::cluster::{
    assign_hierarchy, cluster_id, kmeans, project_to_plane, silhouette_score, CLUSTER_SEED,
};
use crate::error::Result;
use crate::runtime::PipelineRun;
use crate::status_file::{AutoClusterResult, BestKs, KScore, LabelledScore};
use crate::tables::{self, ClusterRow};
use crate::PipelineError;
use ndarray::Array2;
use std::time::Instant;

pub async fn run(run: &PipelineRun) -> Result<()> {
    let arguments = tables::read_args(&run.paths.output(tables::ARGS_FILE))?;
    let embeddings = tables::read_embeddings(&run.paths.output(tables::EMBEDDINGS_FILE))?;

    if arguments.len() != embeddings.len() {
        return Err(PipelineError::Other(format!(
            "{} arguments but {} embeddings",
            arguments.len(),
            embeddings.len()
        )));
    }

    let n = embeddings.len();
    let dims = embeddings.first().map(|r| r.vector.len()).unwrap_or(0);
    let mut matrix = Array2::<f64>::zeros((n, dims));
    for (i, row) in embeddings.iter().enumerate() {
        for (j, &v) in row.vector.iter().enumerate() {
            matrix[[i, j]] = v as f64;
        }
    }

    let points = project_to_plane(&matrix, CLUSTER_SEED)?;
    run.check_cancelled()?;

    let clustering = &run.config.hierarchical_clustering;
    let cluster_nums: Vec<usize> = match &clustering.cluster_nums {
        Some(nums) => nums.clone(),
        None => {
            let sweep = auto_tune(
                &points,
                clustering.cluster_top_min,
                clustering.cluster_top_max,
                clustering.cluster_bottom_max,
            )?;
            let chosen = vec![sweep.best.top.k, sweep.best.bottom.k];
            write_sweep_report(run, &sweep)?;
            run.update_status(|s| s.auto_cluster_result = Some(sweep))?;
            chosen
        }
    };

    let hierarchy = assign_hierarchy(&points, &cluster_nums)?;

    let rows: Vec<ClusterRow> = arguments
        .iter()
        .enumerate()
        .map(|(i, argument)| ClusterRow {
            arg_id: argument.arg_id.clone(),
            argument: argument.argument.clone(),
            x: points[[i, 0]],
            y: points[[i, 1]],
            level1_id: cluster_id(1, hierarchy.levels[0][i]),
            level2_id: cluster_id(2, hierarchy.levels[1][i]),
        })
        .collect();

    tables::write_clusters(&run.paths.output(tables::CLUSTERS_FILE), &rows)?;
    tracing::info!(
        arguments = rows.len(),
        cluster_nums = ?hierarchy.cluster_nums,
        "clustering complete"
    );
    Ok(())
}

/// Sweep candidate `k`s over both ranges, scoring each k-means fit by
/// silhouette on the 2-D embedding. Ties break toward the smaller `k`;
/// a failing candidate is recorded as skipped, never aborts the sweep.
pub(crate) fn auto_tune(
    points: &Array2<f64>,
    top_min: usize,
    top_max: usize,
    bottom_max: usize,
) -> Result<AutoClusterResult> {
    let n = points.nrows();
    let max_clusters = n.saturating_sub(1).max(2);

    let top_max = top_max.min(max_clusters);
    let bottom_max = bottom_max.min(max_clusters);
    let top_min = top_min.clamp(2, top_max);
    let bottom_min = (top_max + 1).min(bottom_max);

    let started = Instant::now();
    let mut results = Vec::new();
    let mut skipped = Vec::new();

    let mut sweep_range = |prefix: &str, lo: usize, hi: usize| -> Option<KScore> {
        let mut best: Option<KScore> = None;
        for k in lo..=hi {
            let label = format!("{prefix}-{k}");
            let score = kmeans(points, k, CLUSTER_SEED)
                .and_then(|fit| silhouette_score(points, &fit.labels));
            match score {
                Ok(score) => {
                    results.push(LabelledScore {
                        label,
                        score,
                    });
                    // Strict comparison keeps the smaller k on ties.
                    if best.map_or(true, |b| score > b.score) {
                        best = Some(KScore { k, score });
                    }
                }
                Err(e) => {
                    tracing::warn!(candidate = %label, "silhouette skipped: {e}");
                    skipped.push(label);
                }
            }
        }
        best
    };

    let best_top = sweep_range("top", top_min, top_max);
    let best_bottom = sweep_range("bottom", bottom_min, bottom_max);

    let (Some(top), Some(bottom)) = (best_top, best_bottom) else {
        return Err(PipelineError::InsufficientData(format!(
            "auto-cluster sweep found no scoreable candidate over {n} samples"
        )));
    };

    Ok(AutoClusterResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        top_range: [top_min, top_max],
        bottom_range: [bottom_min, bottom_max],
        best: BestKs { top, bottom },
        duration_sec: started.elapsed().as_secs_f64(),
        results,
        skipped,
    })
}

/// Human-readable sweep report next to the machine-readable status entry.
fn write_sweep_report(run: &PipelineRun, sweep: &AutoClusterResult) -> Result<()> {
    let mut lines = vec!["Clustering sweep (silhouette score)".to_string()];
    for entry in &sweep.results {
        lines.push(format!("{:>12}: {:.6}", entry.label, entry.score));
    }
    for label in &sweep.skipped {
        lines.push(format!("{label:>12}: skipped"));
    }
    lines.push(String::new());
    lines.push("Chosen cluster counts:".to_string());
    lines.push(format!(
        " - top:    {} (score={:.6})",
        sweep.best.top.k, sweep.best.top.score
    ));
    lines.push(format!(
        " - bottom: {} (score={:.6})",
        sweep.best.bottom.k, sweep.best.bottom.score
    ));
    std::fs::write(
        run.paths.output("auto_cluster_result.txt"),
        lines.join("\n"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::minimal_config;
    use crate::gateway::LlmGateway;
    use crate::provider::{MockProvider, MockReply, RetryPolicy};
    use crate::runtime::{JobPaths, PipelineRun, RunFlags};
    use crate::tables::{ArgumentRow, EmbeddingRow};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn test_run(dir: &std::path::Path, auto: bool) -> PipelineRun {
        let mut config = minimal_config("job");
        if auto {
            config.hierarchical_clustering.cluster_nums = None;
            config.hierarchical_clustering.auto_cluster_enabled = true;
            config.hierarchical_clustering.cluster_top_min = 2;
            config.hierarchical_clustering.cluster_top_max = 5;
            config.hierarchical_clustering.cluster_bottom_max = 10;
        }
        let gateway = LlmGateway::new(
            Arc::new(MockProvider::fixed(MockReply::text(""))),
            RetryPolicy::none(),
            "mock-model",
            "mock-embed",
        );
        let paths = JobPaths::under(dir, &config);
        PipelineRun::new(config, paths, gateway, RunFlags::default()).unwrap()
    }

    /// Seed n arguments whose embeddings fall into `groups` separated blobs.
    fn seed_tables(run: &PipelineRun, n: usize, groups: usize) {
        let mut args = Vec::new();
        let mut embeds = Vec::new();
        for i in 0..n {
            let group = i % groups;
            args.push(ArgumentRow {
                arg_id: format!("AC{i}_0"),
                argument: format!("argument {i}"),
                categories: BTreeMap::new(),
            });
            let base = group as f32 * 50.0;
            let jitter = (i / groups) as f32 * 0.05;
            embeds.push(EmbeddingRow {
                arg_id: format!("AC{i}_0"),
                vector: vec![base + jitter, base - jitter, jitter, 1.0],
            });
        }
        tables::write_args(&run.paths.output(tables::ARGS_FILE), &args).unwrap();
        tables::write_embeddings(&run.paths.output(tables::EMBEDDINGS_FILE), &embeds).unwrap();
    }

    #[tokio::test]
    async fn test_fixed_cluster_nums() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), false);
        seed_tables(&run, 20, 4);

        super::run(&run).await.unwrap();

        let rows = tables::read_clusters(&run.paths.output(tables::CLUSTERS_FILE)).unwrap();
        assert_eq!(rows.len(), 20);
        assert!(rows.iter().all(|r| r.level1_id.starts_with("1_")));
        assert!(rows.iter().all(|r| r.level2_id.starts_with("2_")));

        let distinct = |f: fn(&ClusterRow) -> &str| {
            let mut ids: Vec<&str> = rows.iter().map(f).collect();
            ids.sort_unstable();
            ids.dedup();
            ids.len()
        };
        assert!(distinct(|r| &r.level1_id) <= 2);
        assert!(distinct(|r| &r.level2_id) <= 4);
    }

    #[tokio::test]
    async fn test_every_level2_has_one_parent() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), false);
        seed_tables(&run, 24, 4);
        super::run(&run).await.unwrap();

        let rows = tables::read_clusters(&run.paths.output(tables::CLUSTERS_FILE)).unwrap();
        let mut parents: std::collections::HashMap<String, String> = Default::default();
        for row in &rows {
            let entry = parents
                .entry(row.level2_id.clone())
                .or_insert_with(|| row.level1_id.clone());
            assert_eq!(entry, &row.level1_id, "level-2 id with two parents");
        }
    }

    #[tokio::test]
    async fn test_auto_cluster_records_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), true);
        seed_tables(&run, 60, 4);

        super::run(&run).await.unwrap();

        let status = run.status_snapshot();
        let sweep = status.auto_cluster_result.expect("sweep recorded");
        assert!((2..=5).contains(&sweep.best.top.k));
        assert!((6..=10).contains(&sweep.best.bottom.k));
        assert!(sweep.best.top.score.is_finite());
        assert!(sweep.best.bottom.score.is_finite());
        assert!(!sweep.results.is_empty());
        assert!(run.paths.output("auto_cluster_result.txt").exists());
    }

    #[tokio::test]
    async fn test_too_few_samples_fails() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), false);
        seed_tables(&run, 2, 2);
        let err = super::run(&run).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[test]
    fn test_auto_tune_clamps_to_sample_count() {
        // 8 points: max_clusters = 7, so bottom_max 100 clamps to 7.
        let mut data = Vec::new();
        for i in 0..8 {
            data.push((i % 4) as f64 * 30.0);
            data.push((i / 4) as f64 * 30.0);
        }
        let points = Array2::from_shape_vec((8, 2), data).unwrap();
        let sweep = auto_tune(&points, 2, 20, 100).unwrap();
        assert!(sweep.top_range[1] <= 7);
        assert!(sweep.bottom_range[1] <= 7);
        assert!(sweep.best.top.k >= 2);
    }

    #[test]
    fn test_auto_tune_records_skipped_candidates() {
        // With n = 5, k = 4 gives k = n - 1 (valid) and the clamp prevents
        // k >= n entirely; instead force skips by an unscoreable k range
        // where every point is its own cluster.
        let data = vec![0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 10.0, 10.0, 5.0, 5.0];
        let points = Array2::from_shape_vec((5, 2), data).unwrap();
        let sweep = auto_tune(&points, 2, 3, 4).unwrap();
        // k = 4 on 5 points yields 4 clusters (one pair) — scoreable; the
        // sweep succeeded and nothing was silently dropped.
        let labelled: usize = sweep.results.len() + sweep.skipped.len();
        assert_eq!(labelled, (2..=3).count() + (4..=4).count());
    }

    #[test]
    fn test_ties_break_toward_smaller_k() {
        // Two clean blobs: k=2 scores best; larger ks never beat it, and a
        // strict > comparison keeps the first (smallest) best k.
        let mut data = Vec::new();
        for i in 0..10 {
            data.push(if i < 5 { 0.0 } else { 100.0 } + (i % 5) as f64 * 0.01);
            data.push(0.0);
        }
        let points = Array2::from_shape_vec((10, 2), data).unwrap();
        let sweep = auto_tune(&points, 2, 4, 8).unwrap();
        assert_eq!(sweep.best.top.k, 2);
    }
}
