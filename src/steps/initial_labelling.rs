//! Initial labelling stage: one `{label, description}` per leaf cluster.
//!
//! Samples up to `sampling_num` arguments per level-2 cluster, sends them
//! with the initial-labelling prompt, and records the structured reply.
//! Clusters are labelled in parallel through the worker pool.

use crate::error::Result;
use crate::gateway::json_schema_format;
use crate::provider::{ChatMessage, TokenUsage};
use crate::runtime::PipelineRun;
use crate::tables::{self, InitialLabelRow};
use crate::worker_pool::{map_with_limit, PoolOptions};
use crate::PipelineError;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

const PER_CLUSTER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct LabelReply {
    pub label: String,
    pub description: String,
}

pub(crate) fn label_schema() -> serde_json::Value {
    json_schema_format(
        "LabelReply",
        json!({
            "type": "object",
            "properties": {
                "label": {"type": "string", "description": "a short cluster name"},
                "description": {"type": "string", "description": "what unites the cluster"}
            },
            "required": ["label", "description"],
            "additionalProperties": false
        }),
    )
}

pub async fn run(run: &PipelineRun) -> Result<()> {
    let config = &run.config;
    let clusters = tables::read_clusters(&run.paths.output(tables::CLUSTERS_FILE))?;
    if clusters.is_empty() {
        return Err(PipelineError::InsufficientData(
            "hierarchical_clusters.csv is empty".into(),
        ));
    }

    // Group argument texts by leaf cluster, preserving id order.
    let mut members: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &clusters {
        members
            .entry(row.level2_id.clone())
            .or_default()
            .push(row.argument.clone());
    }

    let labelling = &config.hierarchical_initial_labelling;
    let model = config.model_for(&labelling.model);
    let prompt = labelling.prompt.clone();
    let sampling_num = labelling.sampling_num;
    let schema = label_schema();

    let opts = PoolOptions::new(labelling.workers, PER_CLUSTER_TIMEOUT)
        .with_cancellation(run.cancel.clone());

    let inputs: Vec<(String, Vec<String>)> = members
        .iter()
        .map(|(id, texts)| (id.clone(), texts.clone()))
        .collect();

    let outcome = map_with_limit(
        inputs.clone(),
        |_, (cluster_id, texts)| {
            let model = model.clone();
            let prompt = prompt.clone();
            let schema = schema.clone();
            async move {
                let sample = texts
                    .iter()
                    .take(sampling_num)
                    .map(|t| format!("* {t}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let messages = vec![ChatMessage::system(prompt), ChatMessage::user(sample)];
                match run
                    .gateway
                    .chat_parsed::<LabelReply>(&model, messages, schema)
                    .await
                {
                    Ok((reply, usage)) => Ok((reply, usage)),
                    Err(PipelineError::Parse(message)) => {
                        tracing::warn!(cluster = %cluster_id, "label reply unusable: {message}");
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

    let rows: Vec<InitialLabelRow> = inputs
        .iter()
        .zip(outcome.results)
        .map(|((id, texts), reply)| InitialLabelRow {
            id: id.clone(),
            label: reply.label,
            description: reply.description,
            value: texts.len() as u64,
        })
        .collect();

    tables::write_initial_labels(&run.paths.output(tables::INITIAL_LABELS_FILE), &rows)?;
    tracing::info!(clusters = rows.len(), "initial labelling complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::minimal_config;
    use crate::gateway::LlmGateway;
    use crate::provider::{MockProvider, MockReply, RetryPolicy};
    use crate::runtime::{JobPaths, PipelineRun, RunFlags};
    use crate::tables::ClusterRow;
    use std::sync::Arc;

    fn test_run(dir: &std::path::Path, provider: MockProvider) -> PipelineRun {
        let config = minimal_config("job");
        let gateway = LlmGateway::new(
            Arc::new(provider),
            RetryPolicy::none(),
            "mock-model",
            "mock-embed",
        );
        let paths = JobPaths::under(dir, &config);
        PipelineRun::new(config, paths, gateway, RunFlags::default()).unwrap()
    }

    fn seed_clusters(run: &PipelineRun) {
        let rows: Vec<ClusterRow> = (0..8)
            .map(|i| ClusterRow {
                arg_id: format!("AC{i}_0"),
                argument: format!("argument {i}"),
                x: i as f64,
                y: 0.0,
                level1_id: format!("1_{}", i % 2),
                level2_id: format!("2_{}", i % 4),
            })
            .collect();
        tables::write_clusters(&run.paths.output(tables::CLUSTERS_FILE), &rows).unwrap();
    }

    #[tokio::test]
    async fn test_one_label_per_leaf_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::json(
            json!({"label": "A label", "description": "A description"}),
        ));
        let run = test_run(dir.path(), provider);
        seed_clusters(&run);

        super::run(&run).await.unwrap();

        let labels =
            tables::read_initial_labels(&run.paths.output(tables::INITIAL_LABELS_FILE)).unwrap();
        assert_eq!(labels.len(), 4);
        let ids: Vec<&str> = labels.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["2_0", "2_1", "2_2", "2_3"]);
        assert!(labels.iter().all(|l| l.value == 2));
        assert!(labels.iter().all(|l| l.label == "A label"));
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_cluster_row() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::text("not a label"));
        let run = test_run(dir.path(), provider);
        seed_clusters(&run);

        super::run(&run).await.unwrap();

        let labels =
            tables::read_initial_labels(&run.paths.output(tables::INITIAL_LABELS_FILE)).unwrap();
        assert_eq!(labels.len(), 4, "every cluster still gets a row");
        assert!(labels.iter().all(|l| l.label.is_empty()));
    }

    #[tokio::test]
    async fn test_empty_clusters_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::text("{}"));
        let run = test_run(dir.path(), provider);
        tables::write_clusters(&run.paths.output(tables::CLUSTERS_FILE), &[]).unwrap();

        let err = super::run(&run).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }
}
