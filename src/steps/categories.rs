//! Category classification: an optional post-step of extraction.
//!
//! When `extraction.categories` names category columns, each argument is
//! classified into one of the allowed values per column via an LLM call.
//! Same concurrency rules as extraction; a failed classification leaves
//! the category cell empty.

use crate::error::Result;
use crate::gateway::json_schema_format;
use crate::provider::{ChatMessage, TokenUsage};
use crate::runtime::PipelineRun;
use crate::tables::ArgumentRow;
use crate::worker_pool::{map_with_limit, PoolOptions};
use crate::PipelineError;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const PER_ARGUMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Default)]
struct CategoryReply {
    category: String,
}

fn category_schema(allowed: &[String]) -> serde_json::Value {
    json_schema_format(
        "CategoryReply",
        json!({
            "type": "object",
            "properties": {
                "category": {"type": "string", "enum": allowed}
            },
            "required": ["category"],
            "additionalProperties": false
        }),
    )
}

/// Annotate every argument with one value per configured category column.
pub async fn classify(run: &PipelineRun, arguments: &mut [ArgumentRow]) -> Result<()> {
    let config = &run.config;
    let model = config.model_for(&config.extraction.model);

    for (column, allowed) in &config.extraction.categories {
        if allowed.is_empty() {
            tracing::warn!(column, "category column has no allowed values, skipping");
            continue;
        }
        let schema = category_schema(allowed);
        let prompt = format!(
            "Classify the opinion into exactly one of these '{}' categories: {}. \
             Reply with JSON {{\"category\": \"...\"}}.",
            column,
            allowed.join(", ")
        );

        let opts = PoolOptions::new(config.extraction.workers, PER_ARGUMENT_TIMEOUT)
            .with_cancellation(run.cancel.clone());

        let texts: Vec<String> = arguments.iter().map(|a| a.argument.clone()).collect();
        let outcome = map_with_limit(
            texts,
            |_, text| {
                let model = model.clone();
                let prompt = prompt.clone();
                let schema = schema.clone();
                async move {
                    let messages = vec![ChatMessage::system(prompt), ChatMessage::user(text)];
                    match run
                        .gateway
                        .chat_parsed::<CategoryReply>(&model, messages, schema)
                        .await
                    {
                        Ok((reply, usage)) => Ok((reply.category, usage)),
                        Err(PipelineError::Parse(message)) => {
                            tracing::warn!("category reply unusable: {message}");
                            Ok((String::new(), TokenUsage::default()))
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

        for (argument, category) in arguments.iter_mut().zip(outcome.results) {
            // An off-list reply counts as a failed classification.
            if allowed.contains(&category) {
                argument.categories.insert(column.clone(), category);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::minimal_config;
    use crate::gateway::LlmGateway;
    use crate::provider::{MockProvider, MockReply, RetryPolicy};
    use crate::runtime::{JobPaths, PipelineRun, RunFlags};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn run_with_provider(dir: &std::path::Path, provider: MockProvider) -> PipelineRun {
        let mut config = minimal_config("job");
        config.extraction.categories.insert(
            "topic".into(),
            vec!["transit".into(), "parks".into()],
        );
        let gateway = LlmGateway::new(
            Arc::new(provider),
            RetryPolicy::none(),
            "mock-model",
            "mock-embed",
        );
        let paths = JobPaths::under(dir, &config);
        PipelineRun::new(config, paths, gateway, RunFlags::default()).unwrap()
    }

    fn arguments() -> Vec<ArgumentRow> {
        vec![
            ArgumentRow {
                arg_id: "AC1_0".into(),
                argument: "Trains should run later.".into(),
                categories: BTreeMap::new(),
            },
            ArgumentRow {
                arg_id: "AC2_0".into(),
                argument: "More green space downtown.".into(),
                categories: BTreeMap::new(),
            },
        ]
    }

    #[tokio::test]
    async fn test_classify_annotates_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::with_responder(|req| {
            let text = &req.messages.last().unwrap().content;
            let value = if text.contains("Trains") { "transit" } else { "parks" };
            MockReply::json(json!({"category": value}))
        });
        let run = run_with_provider(dir.path(), provider);

        let mut args = arguments();
        classify(&run, &mut args).await.unwrap();

        assert_eq!(args[0].categories["topic"], "transit");
        assert_eq!(args[1].categories["topic"], "parks");
    }

    #[tokio::test]
    async fn test_off_list_reply_leaves_cell_empty() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::json(json!({"category": "weather"})));
        let run = run_with_provider(dir.path(), provider);

        let mut args = arguments();
        classify(&run, &mut args).await.unwrap();
        assert!(args.iter().all(|a| a.categories.is_empty()));
    }

    #[tokio::test]
    async fn test_parse_failure_leaves_cell_empty() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::text("not json"));
        let run = run_with_provider(dir.path(), provider);

        let mut args = arguments();
        classify(&run, &mut args).await.unwrap();
        assert!(args.iter().all(|a| a.categories.is_empty()));
    }
}
