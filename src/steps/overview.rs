//! Overview stage: one summarising LLM call.
//!
//! Collates the level-1 `(label, description)` pairs into a single prompt
//! and writes the returned paragraph to `hierarchical_overview.txt`. When
//! the reply is not valid structured output, reasoning wrappers are
//! stripped and the raw text is kept.

use crate::coerce;
use crate::error::Result;
use crate::gateway::json_schema_format;
use crate::provider::{ChatMessage, ResponseBody, ResponseFormat};
use crate::runtime::PipelineRun;
use crate::tables;
use crate::PipelineError;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct OverviewReply {
    summary: String,
}

fn overview_schema() -> serde_json::Value {
    json_schema_format(
        "OverviewReply",
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "overall summary of the clusters"}
            },
            "required": ["summary"],
            "additionalProperties": false
        }),
    )
}

pub async fn run(run: &PipelineRun) -> Result<()> {
    let config = &run.config;
    let labels = tables::read_merge_labels(&run.paths.output(tables::MERGE_LABELS_FILE))?;
    let level1: Vec<_> = labels.iter().filter(|l| l.level == 1).collect();
    if level1.is_empty() {
        return Err(PipelineError::InsufficientData(
            "no level-1 labels to summarise".into(),
        ));
    }

    let mut input_text = String::new();
    for (i, label) in level1.iter().enumerate() {
        input_text.push_str(&format!(
            "# Cluster {}/{}: {}\n\n{}\n\n",
            i,
            level1.len(),
            label.label,
            label.description
        ));
    }

    let model = config.model_for(&config.hierarchical_overview.model);
    let messages = vec![
        ChatMessage::system(config.hierarchical_overview.prompt.clone()),
        ChatMessage::user(input_text),
    ];

    let outcome = run
        .gateway
        .chat_with_model(&model, messages, ResponseFormat::JsonSchema(overview_schema()))
        .await?;
    run.add_token_usage(&outcome.usage)?;

    let summary = match &outcome.body {
        ResponseBody::Json(value) => value["summary"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        ResponseBody::Text(text) => {
            coerce::parse_or_plain_text(text, |reply: OverviewReply| reply.summary)
        }
    };

    std::fs::write(run.paths.output(tables::OVERVIEW_FILE), summary)?;
    tracing::info!("overview complete");
    Ok(())
}
