//! Extraction stage: per-comment argument extraction.
//!
//! One chat call per comment with the extraction prompt; the response is
//! coerced into `{"extractedOpinionList": [string, …]}`. Duplicate argument
//! text across comments reuses the first `arg_id` and only adds a relation
//! row. A per-comment parse failure downgrades that comment to "no
//! arguments extracted"; an empty final table fails the stage.

use crate::corpus::Corpus;
use crate::error::Result;
use crate::gateway::json_schema_format;
use crate::provider::{ChatMessage, TokenUsage};
use crate::runtime::PipelineRun;
use crate::steps::categories;
use crate::tables::{self, ArgumentRow, RelationRow};
use crate::worker_pool::{map_with_limit, PoolOptions};
use crate::PipelineError;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

const PER_COMMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(rename = "extractedOpinionList")]
    extracted_opinion_list: Vec<String>,
}

fn extraction_schema() -> serde_json::Value {
    json_schema_format(
        "ExtractionReply",
        json!({
            "type": "object",
            "properties": {
                "extractedOpinionList": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "the extracted opinions"
                }
            },
            "required": ["extractedOpinionList"],
            "additionalProperties": false
        }),
    )
}

pub async fn run(run: &PipelineRun) -> Result<()> {
    let config = &run.config;
    let corpus = Corpus::read(&run.paths.input_csv, &config.extraction.properties)?;

    let limit = config.extraction.limit.min(corpus.comments.len());
    let comments = &corpus.comments[..limit];
    let model = config.model_for(&config.extraction.model);
    let prompt = config.extraction.prompt.clone();
    let schema = extraction_schema();

    let opts = PoolOptions::new(config.extraction.workers, PER_COMMENT_TIMEOUT)
        .with_cancellation(run.cancel.clone());

    let total = comments.len();
    let mut completed = 0usize;
    let inputs: Vec<(String, String)> = comments
        .iter()
        .map(|c| (c.id.clone(), c.body.clone()))
        .collect();

    let outcome = map_with_limit(
        inputs,
        |_, (comment_id, body)| {
            let model = model.clone();
            let prompt = prompt.clone();
            let schema = schema.clone();
            async move {
                let messages = vec![ChatMessage::system(prompt), ChatMessage::user(body)];
                match run
                    .gateway
                    .chat_parsed::<ExtractionReply>(&model, messages, schema)
                    .await
                {
                    Ok((reply, usage)) => {
                        let items: Vec<String> = reply
                            .extracted_opinion_list
                            .into_iter()
                            .filter(|s| !s.trim().is_empty())
                            .collect();
                        Ok((items, usage))
                    }
                    Err(PipelineError::Parse(message)) => {
                        tracing::warn!(
                            comment_id = %comment_id,
                            "giving up on this comment, no valid opinion list: {message}"
                        );
                        Ok((Vec::new(), TokenUsage::default()))
                    }
                    Err(e) => Err(e),
                }
            }
        },
        &opts,
        |delta| {
            completed += delta;
            tracing::debug!(completed, total, "extraction progress");
        },
    )
    .await?;

    run.add_token_usage(&outcome.usage)?;
    tracing::info!(
        input = outcome.usage.input,
        output = outcome.usage.output,
        total = outcome.usage.total,
        "extraction token usage"
    );

    // Dedup arguments by text; repeats only add relation rows.
    let mut arguments: Vec<ArgumentRow> = Vec::new();
    let mut by_text: HashMap<String, usize> = HashMap::new();
    let mut relations: Vec<RelationRow> = Vec::new();

    for (comment, extracted) in comments.iter().zip(outcome.results.iter()) {
        for (position, text) in extracted.iter().enumerate() {
            let arg_id = match by_text.get(text) {
                Some(&idx) => arguments[idx].arg_id.clone(),
                None => {
                    let arg_id = format!("A{}_{}", comment.id, position);
                    by_text.insert(text.clone(), arguments.len());
                    arguments.push(ArgumentRow {
                        arg_id: arg_id.clone(),
                        argument: text.clone(),
                        categories: BTreeMap::new(),
                    });
                    arg_id
                }
            };
            relations.push(RelationRow {
                arg_id,
                comment_id: comment.id.clone(),
            });
        }
    }

    if arguments.is_empty() {
        return Err(PipelineError::InsufficientData(
            "no arguments were extracted; the prompt may not fit the corpus".into(),
        ));
    }

    if !config.extraction.categories.is_empty() {
        categories::classify(run, &mut arguments).await?;
    }

    tables::write_args(&run.paths.output(tables::ARGS_FILE), &arguments)?;
    tables::write_relations(&run.paths.output(tables::RELATIONS_FILE), &relations)?;

    tracing::info!(
        arguments = arguments.len(),
        relations = relations.len(),
        "extraction complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::minimal_config;
    use crate::gateway::LlmGateway;
    use crate::provider::{MockProvider, MockReply, RetryPolicy};
    use crate::runtime::{JobPaths, PipelineRun, RunFlags};
    use std::path::Path;
    use std::sync::Arc;

    fn write_corpus(dir: &Path, name: &str, rows: &[(&str, &str)]) {
        let inputs = dir.join("inputs");
        std::fs::create_dir_all(&inputs).unwrap();
        let mut content = String::from("comment-id,comment-body\n");
        for (id, body) in rows {
            content.push_str(&format!("{id},{body}\n"));
        }
        std::fs::write(inputs.join(format!("{name}.csv")), content).unwrap();
    }

    fn run_with_provider(dir: &Path, provider: MockProvider) -> PipelineRun {
        let config = minimal_config("job");
        write_corpus(
            dir,
            "job",
            &[
                ("C1", "Trains should run later at night."),
                ("C2", "The city needs more bike lanes."),
                ("C3", "Comment three."),
            ],
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

    #[tokio::test]
    async fn test_extraction_writes_args_and_relations() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::with_responder(|req| {
            let body = &req.messages.last().unwrap().content;
            MockReply::json(json!({"extractedOpinionList": [format!("opinion about: {body}")]}))
        });
        let run = run_with_provider(dir.path(), provider);

        super::run(&run).await.unwrap();

        let args = tables::read_args(&run.paths.output(tables::ARGS_FILE)).unwrap();
        let relations =
            tables::read_relations(&run.paths.output(tables::RELATIONS_FILE)).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(relations.len(), 3);
        assert!(args[0].arg_id.starts_with("AC1_"));

        let status = run.status_snapshot();
        assert!(status.total_token_usage > 0);
    }

    #[tokio::test]
    async fn test_duplicate_text_reuses_arg_id() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::json(
            json!({"extractedOpinionList": ["identical opinion"]}),
        ));
        let run = run_with_provider(dir.path(), provider);

        super::run(&run).await.unwrap();

        let args = tables::read_args(&run.paths.output(tables::ARGS_FILE)).unwrap();
        let relations =
            tables::read_relations(&run.paths.output(tables::RELATIONS_FILE)).unwrap();
        assert_eq!(args.len(), 1, "identical text must dedup");
        assert_eq!(args[0].arg_id, "AC1_0");
        assert_eq!(relations.len(), 3);
        assert!(relations.iter().all(|r| r.arg_id == "AC1_0"));
    }

    #[tokio::test]
    async fn test_parse_failure_downgrades_single_comment() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::with_responder(|req| {
            let body = &req.messages.last().unwrap().content;
            if body.contains("three") {
                MockReply::text("absolutely not json")
            } else {
                MockReply::json(json!({"extractedOpinionList": [format!("re: {body}")]}))
            }
        });
        let run = run_with_provider(dir.path(), provider);

        super::run(&run).await.unwrap();

        let args = tables::read_args(&run.paths.output(tables::ARGS_FILE)).unwrap();
        assert_eq!(args.len(), 2, "the failing comment contributes nothing");
    }

    #[tokio::test]
    async fn test_empty_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::fixed(MockReply::json(json!({"extractedOpinionList": []})));
        let run = run_with_provider(dir.path(), provider);

        let err = super::run(&run).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[tokio::test]
    async fn test_empty_strings_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::with_responder(|req| {
            let body = &req.messages.last().unwrap().content;
            MockReply::json(json!({"extractedOpinionList": ["", format!("kept: {body}"), "  "]}))
        });
        let run = run_with_provider(dir.path(), provider);

        super::run(&run).await.unwrap();

        let args = tables::read_args(&run.paths.output(tables::ARGS_FILE)).unwrap();
        assert_eq!(args.len(), 3);
        assert!(args.iter().all(|a| a.argument.starts_with("kept:")));
    }
}
