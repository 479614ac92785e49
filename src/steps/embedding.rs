//! Embedding stage: one vector per argument.
//!
//! Remote providers get inputs batched by cumulative token count under the
//! configured budget (falling back to a fixed item count when no tokenizer
//! is available); the local path sends everything in one batch. Output
//! order matches `args.csv` order exactly.

use crate::error::Result;
use crate::gateway::count_tokens;
use crate::runtime::PipelineRun;
use crate::tables::{self, EmbeddingRow};
use crate::PipelineError;

/// Split inputs into batches whose token counts stay under `max_tokens`.
/// Any single oversized input still forms its own batch (the gateway
/// truncates it). `max_items` bounds batches when token counting fails.
pub(crate) fn plan_batches(
    texts: &[String],
    max_tokens: usize,
    max_items: usize,
) -> Vec<std::ops::Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0usize;
    let mut current_tokens = 0usize;
    let mut current_items = 0usize;

    for (i, text) in texts.iter().enumerate() {
        let tokens = count_tokens(text).unwrap_or(0);
        let over_tokens = tokens > 0 && current_tokens + tokens > max_tokens;
        let over_items = tokens == 0 && current_items >= max_items;
        if current_items > 0 && (over_tokens || over_items) {
            batches.push(start..i);
            start = i;
            current_tokens = 0;
            current_items = 0;
        }
        current_tokens += tokens;
        current_items += 1;
    }
    if start < texts.len() {
        batches.push(start..texts.len());
    }
    batches
}

pub async fn run(run: &PipelineRun) -> Result<()> {
    let config = &run.config;
    let arguments = tables::read_args(&run.paths.output(tables::ARGS_FILE))?;
    if arguments.is_empty() {
        return Err(PipelineError::InsufficientData(
            "args.csv is empty, nothing to embed".into(),
        ));
    }

    let texts: Vec<String> = arguments.iter().map(|a| a.argument.clone()).collect();

    let batches = if run.gateway.embeds_locally() {
        vec![0..texts.len()]
    } else {
        plan_batches(
            &texts,
            config.embedding.max_tokens,
            config.embedding.max_items,
        )
    };

    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for (i, batch) in batches.iter().enumerate() {
        run.check_cancelled()?;
        tracing::info!(batch = i + 1, batches = batches.len(), "embedding batch");
        let (batch_vectors, usage) = run.gateway.embed(&texts[batch.clone()]).await?;
        run.add_token_usage(&usage)?;
        vectors.extend(batch_vectors);
    }

    let rows: Vec<EmbeddingRow> = arguments
        .iter()
        .zip(vectors)
        .map(|(argument, vector)| EmbeddingRow {
            arg_id: argument.arg_id.clone(),
            vector,
        })
        .collect();

    tables::write_embeddings(&run.paths.output(tables::EMBEDDINGS_FILE), &rows)?;
    tracing::info!(embeddings = rows.len(), "embedding complete");
    Ok(())
}
