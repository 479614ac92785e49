//! # Broadlisten
//!
//! A hierarchical opinion-clustering report pipeline: a long-running batch
//! job that ingests a corpus of comments, extracts atomic opinions with
//! LLM calls, embeds them, clusters the vectors into a two-level
//! hierarchy, labels each cluster, and aggregates everything into one
//! report artifact — plus the surrounding job control plane that launches,
//! tracks, cancels, and edits those jobs.
//!
//! ## Core Concepts
//!
//! - **[`LlmGateway`]** — provider-agnostic chat + embedding facade with
//!   rate-limit retry, structured-output coercion, and token accounting.
//! - **[`provider::Provider`]** — one adapter per vendor (OpenAI-compatible,
//!   Azure deployments, native Gemini, plus a scripted mock for tests).
//! - **[`worker_pool::map_with_limit`]** — bounded parallel per-item LLM
//!   calls with partial-failure tolerance and in-order results.
//! - **[`runtime::run_step`]** — sequential stage execution with
//!   resume/skip/force semantics and a persisted status file.
//! - **[`cluster`]** — the CPU-bound engine: 2-D projection, seeded
//!   k-means, Ward centroid merging, silhouette auto-tune.
//! - **[`StatusManager`]** — the file-backed registry of job states,
//!   visibility, token usage, and estimated cost, with a
//!   cache-invalidation hook toward the presentation tier.
//! - **[`Launcher`]** — spawns the pipeline binary per job and reconciles
//!   its exit into the registry.
//!
//! ## Pipeline shape
//!
//! ```text
//! extraction ──► embedding ──► clustering ──► initial labelling
//!      ──► merge labelling ──► overview ──► aggregation
//! ```
//!
//! Each stage persists its output as a sidecar table (see [`tables`]) so a
//! re-run can resume where it stopped.

pub mod cluster;
pub mod cluster_edits;
pub mod coerce;
pub mod config;
pub mod corpus;
pub mod error;
pub mod gateway;
pub mod launcher;
pub mod pricing;
pub mod provider;
pub mod runtime;
pub mod status;
pub mod status_file;
pub mod steps;
pub mod tables;
pub mod worker_pool;

pub use config::{Config, ProviderKind};
pub use error::{PipelineError, Result};
pub use gateway::{ChatOutcome, LlmGateway};
pub use launcher::{JobHandle, JobRequest, Launcher, LauncherDirs};
pub use provider::{Provider, RetryPolicy, TokenUsage};
pub use runtime::{run_step, JobPaths, PipelineRun, RunFlags};
pub use status::{ReportState, StatusManager, StatusRecord, Visibility};
pub use worker_pool::{map_with_limit, PoolOptions, PoolOutcome};

/// Build the gateway a config describes, resolving the provider from the
/// environment (`USER_API_KEY` wins over per-provider keys).
pub fn gateway_for(config: &Config) -> Result<LlmGateway> {
    let user_api_key = std::env::var("USER_API_KEY").ok();
    let provider = provider::provider_for(
        config.provider,
        config.local_llm_address.as_deref(),
        user_api_key.as_deref(),
    )?;
    Ok(
        LlmGateway::new(
            provider,
            RetryPolicy::standard(),
            config.model.clone(),
            config.embedding.model.clone(),
        )
        .with_local_embedding(config.is_embedded_at_local || config.provider == ProviderKind::Local),
    )
}

/// Run every stage of a prepared pipeline in order, then mark completion.
pub async fn run_pipeline(run: &PipelineRun) -> Result<()> {
    run_step(run, "extraction", steps::extraction::run(run)).await?;
    run_step(run, "embedding", steps::embedding::run(run)).await?;
    run_step(run, "hierarchical_clustering", steps::clustering::run(run)).await?;
    run_step(
        run,
        "hierarchical_initial_labelling",
        steps::initial_labelling::run(run),
    )
    .await?;
    run_step(
        run,
        "hierarchical_merge_labelling",
        steps::merge_labelling::run(run),
    )
    .await?;
    run_step(run, "hierarchical_overview", steps::overview::run(run)).await?;
    run_step(run, "hierarchical_aggregation", steps::aggregation::run(run)).await?;
    runtime::finish(run)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, MockReply};
    use std::sync::Arc;

    fn assert_send_sync<T: Send + Sync>(_: &T) {}

    #[test]
    fn test_gateway_is_send_sync() {
        let gateway = LlmGateway::new(
            Arc::new(MockProvider::fixed(MockReply::text(""))),
            RetryPolicy::none(),
            "m",
            "e",
        );
        assert_send_sync(&gateway);
    }
}
