//! The pipeline binary: runs one report job described by a config file.
//!
//! Invoked by the launcher as
//! `broadlisten <config.json> --skip-interaction --without-html`, with
//! optional `--only <stage>`, `--force`, per-stage `--skip-*` flags, and
//! the auto-cluster bounds. Exit code 0 on success, 1 on failure.

use anyhow::Context;
use broadlisten::runtime::{JobPaths, PipelineRun, RunFlags};
use broadlisten::Config;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "broadlisten", about = "Run the opinion-clustering report pipeline.")]
struct Cli {
    /// Path to the config JSON file that defines the pipeline execution.
    config: PathBuf,

    /// Force re-run of all steps regardless of previous execution.
    #[arg(short, long)]
    force: bool,

    /// Run only the specified step (e.g. extraction, embedding,
    /// hierarchical_aggregation).
    #[arg(short, long)]
    only: Option<String>,

    /// Accepted for launcher compatibility; there is no interactive prompt.
    #[arg(long)]
    skip_interaction: bool,

    /// Accepted for launcher compatibility; no HTML is rendered here.
    #[arg(long)]
    without_html: bool,

    /// Skip the extraction step.
    #[arg(long)]
    skip_extraction: bool,

    /// Skip the initial labelling step.
    #[arg(long)]
    skip_initial_labelling: bool,

    /// Skip the merge labelling step.
    #[arg(long)]
    skip_merge_labelling: bool,

    /// Skip the overview step.
    #[arg(long)]
    skip_overview: bool,

    /// Automatically determine cluster numbers.
    #[arg(long)]
    auto_cluster: bool,

    /// Minimum number of top-level clusters.
    #[arg(long)]
    cluster_top_min: Option<usize>,

    /// Maximum number of top-level clusters.
    #[arg(long)]
    cluster_top_max: Option<usize>,

    /// Maximum number of bottom-level clusters.
    #[arg(long)]
    cluster_bottom_max: Option<usize>,
}

/// Fold the CLI flags into the loaded config.
fn apply_flags(config: &mut Config, cli: &Cli) {
    config.skip_extraction |= cli.skip_extraction;
    config.skip_initial_labelling |= cli.skip_initial_labelling;
    config.skip_merge_labelling |= cli.skip_merge_labelling;
    config.skip_overview |= cli.skip_overview;

    let clustering = &mut config.hierarchical_clustering;
    if cli.auto_cluster {
        clustering.auto_cluster_enabled = true;
        clustering.cluster_nums = None;
    }
    if let Some(top_min) = cli.cluster_top_min {
        clustering.cluster_top_min = top_min;
    }
    if let Some(top_max) = cli.cluster_top_max {
        clustering.cluster_top_max = top_max;
    }
    if let Some(bottom_max) = cli.cluster_bottom_max {
        clustering.cluster_bottom_max = bottom_max;
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        tracing::error!("pipeline failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Flags fold in before validation: --auto-cluster can supply the
    // clustering shape on its own.
    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let mut config: Config =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", cli.config.display()))?;
    apply_flags(&mut config, &cli);
    config.validate().context("validating configuration")?;

    let base = std::env::current_dir()?;
    let paths = JobPaths::under(&base, &config);
    let gateway = broadlisten::gateway_for(&config)?;
    let flags = RunFlags {
        force: cli.force,
        only: cli.only.clone(),
    };

    let run = PipelineRun::new(config, paths, gateway, flags)?;
    broadlisten::run_pipeline(&run).await?;
    Ok(())
}
