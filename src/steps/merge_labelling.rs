//! Merge labelling stage: coarse labels plus density ranking.
//!
//! For each level-1 cluster the initial labels and descriptions of its
//! children are collated into one LLM call producing the coarser
//! `{label, description}`. Every cluster at both levels then gets a
//! density (geometric compactness in the 2-D plane), a rank per level
//! (1 = densest), and the rank's percentile.

use crate::error::Result;
use crate::gateway::json_schema_format;
use crate::provider::{ChatMessage, TokenUsage};
use crate::runtime::PipelineRun;
use crate::steps::initial_labelling::LabelReply;
use crate::tables::{self, ClusterRow, InitialLabelRow, MergeLabelRow};
use crate::worker_pool::{map_with_limit, PoolOptions};
use crate::PipelineError;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

const PER_CLUSTER_TIMEOUT: Duration = Duration::from_secs(60);

fn merge_schema() -> serde_json::Value {
    json_schema_format(
        "LabelReply",
        json!({
            "type": "object",
            "properties": {
                "label": {"type": "string", "description": "a short name for the merged cluster"},
                "description": {"type": "string", "description": "what unites the child clusters"}
            },
            "required": ["label", "description"],
            "additionalProperties": false
        }),
    )
}

/// Members / (1 + mean distance to the cluster centroid): tighter clusters
/// score higher.
pub(crate) fn density(points: &[(f64, f64)]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    n / (1.0 + mean_dist)
}

/// Assign per-level density ranks (1 = densest) and percentiles in place.
pub(crate) fn rank_densities(rows: &mut [MergeLabelRow]) {
    let levels: Vec<u32> = {
        let mut seen: Vec<u32> = rows.iter().map(|r| r.level).collect();
        seen.sort_unstable();
        seen.dedup();
        seen
    };
    for level in levels {
        let mut indexed: Vec<(usize, f64)> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.level == level)
            .map(|(i, r)| (i, r.density.unwrap_or(0.0)))
            .collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        let count = indexed.len() as f64;
        for (rank0, (idx, _)) in indexed.into_iter().enumerate() {
            let rank = rank0 as u64 + 1;
            rows[idx].density_rank = Some(rank);
            rows[idx].density_rank_percentile = Some(rank as f64 / count * 100.0);
        }
    }
}

pub async fn run(run: &PipelineRun) -> Result<()> {
    let config = &run.config;
    let clusters = tables::read_clusters(&run.paths.output(tables::CLUSTERS_FILE))?;
    let initial_labels =
        tables::read_initial_labels(&run.paths.output(tables::INITIAL_LABELS_FILE))?;

    if clusters.is_empty() {
        return Err(PipelineError::InsufficientData(
            "hierarchical_clusters.csv is empty".into(),
        ));
    }

    let initial_by_id: BTreeMap<&str, &InitialLabelRow> =
        initial_labels.iter().map(|l| (l.id.as_str(), l)).collect();

    // level-1 id → (child level-2 ids, member rows)
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut level1_points: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    let mut level2_points: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    for row in &clusters {
        let child_list = children.entry(row.level1_id.clone()).or_default();
        if !child_list.contains(&row.level2_id) {
            child_list.push(row.level2_id.clone());
        }
        level1_points
            .entry(row.level1_id.clone())
            .or_default()
            .push((row.x, row.y));
        level2_points
            .entry(row.level2_id.clone())
            .or_default()
            .push((row.x, row.y));
    }

    let labelling = &config.hierarchical_merge_labelling;
    let model = config.model_for(&labelling.model);
    let prompt = labelling.prompt.clone();
    let schema = merge_schema();

    let opts = PoolOptions::new(labelling.workers, PER_CLUSTER_TIMEOUT)
        .with_cancellation(run.cancel.clone());

    let inputs: Vec<(String, String)> = children
        .iter()
        .map(|(level1_id, child_ids)| {
            let collated = child_ids
                .iter()
                .map(|id| match initial_by_id.get(id.as_str()) {
                    Some(l) => format!("- {}: {}", l.label, l.description),
                    None => format!("- {id}"),
                })
                .collect::<Vec<_>>()
                .join("\n");
            (level1_id.clone(), collated)
        })
        .collect();

    let outcome = map_with_limit(
        inputs.clone(),
        |_, (level1_id, collated)| {
            let model = model.clone();
            let prompt = prompt.clone();
            let schema = schema.clone();
            async move {
                let messages = vec![ChatMessage::system(prompt), ChatMessage::user(collated)];
                match run
                    .gateway
                    .chat_parsed::<LabelReply>(&model, messages, schema)
                    .await
                {
                    Ok((reply, usage)) => Ok((reply, usage)),
                    Err(PipelineError::Parse(message)) => {
                        tracing::warn!(cluster = %level1_id, "merge label unusable: {message}");
                        Ok((LabelReply::default(), TokenUsage::default()))
                    }
                    Err(e) => Err(e),
                }
            }
        },
        &opts,
        |_| {},
    )
    .await?;

    run.add_token_usage(&outcome.usage)?;

    let mut rows: Vec<MergeLabelRow> = Vec::new();
    for ((level1_id, _), reply) in inputs.iter().zip(outcome.results) {
        let points = &level1_points[level1_id];
        rows.push(MergeLabelRow {
            level: 1,
            id: level1_id.clone(),
            label: reply.label,
            description: reply.description,
            value: points.len() as u64,
            parent: "0".to_string(),
            density: Some(density(points)),
            density_rank: None,
            density_rank_percentile: None,
        });
    }
    for (level1_id, child_ids) in &children {
        for child_id in child_ids {
            let points = &level2_points[child_id];
            let initial = initial_by_id.get(child_id.as_str());
            rows.push(MergeLabelRow {
                level: 2,
                id: child_id.clone(),
                label: initial.map(|l| l.label.clone()).unwrap_or_default(),
                description: initial.map(|l| l.description.clone()).unwrap_or_default(),
                value: points.len() as u64,
                parent: level1_id.clone(),
                density: Some(density(points)),
                density_rank: None,
                density_rank_percentile: None,
            });
        }
    }

    rank_densities(&mut rows);

    tables::write_merge_labels(&run.paths.output(tables::MERGE_LABELS_FILE), &rows)?;
    tracing::info!(labels = rows.len(), "merge labelling complete");
    Ok(())
}
