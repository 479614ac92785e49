//! Stage runtime: sequential execution with resume, skip, and force.
//!
//! [`PipelineRun`] bundles everything a stage needs — the immutable config,
//! job paths, the LLM gateway, run flags, and the status file behind a
//! mutex. [`run_step`] wraps each stage with the skip/force/only rules,
//! timing, token-usage persistence, and structured failure reporting.

use crate::config::Config;
use crate::error::Result;
use crate::gateway::LlmGateway;
use crate::provider::TokenUsage;
use crate::status_file::{self, RunState, StatusFile, STATUS_FILE_NAME};
use crate::PipelineError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// The ordered stage names of one full run.
pub const STAGES: [&str; 7] = [
    "extraction",
    "embedding",
    "hierarchical_clustering",
    "hierarchical_initial_labelling",
    "hierarchical_merge_labelling",
    "hierarchical_overview",
    "hierarchical_aggregation",
];

/// Filesystem layout of one job.
#[derive(Debug, Clone)]
pub struct JobPaths {
    /// The input corpus CSV.
    pub input_csv: PathBuf,
    /// The per-job output directory; every artifact lands here.
    pub output_dir: PathBuf,
}

impl JobPaths {
    /// Conventional layout relative to a working directory:
    /// `inputs/<input>.csv` and `outputs/<name>/`.
    pub fn under(base: &Path, config: &Config) -> Self {
        Self {
            input_csv: base.join("inputs").join(format!("{}.csv", config.input)),
            output_dir: base.join("outputs").join(&config.name),
        }
    }

    pub fn output(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    pub fn status_file(&self) -> PathBuf {
        self.output(STATUS_FILE_NAME)
    }
}

/// Operator flags for one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    /// Re-run stages even when the status file marks them done.
    pub force: bool,
    /// Run only the named stage; every other stage is skipped.
    pub only: Option<String>,
}

/// Shared state for one pipeline execution.
pub struct PipelineRun {
    pub config: Config,
    pub paths: JobPaths,
    pub gateway: LlmGateway,
    pub flags: RunFlags,
    pub cancel: Arc<AtomicBool>,
    status: Mutex<StatusFile>,
}

impl PipelineRun {
    /// Prepare a run, resuming from an existing status file when one is
    /// present (unless `--force` discards it).
    pub fn new(
        config: Config,
        paths: JobPaths,
        gateway: LlmGateway,
        flags: RunFlags,
    ) -> Result<Self> {
        std::fs::create_dir_all(&paths.output_dir)?;

        let mut status = if flags.force {
            StatusFile::default()
        } else {
            status_file::load(&paths.status_file()).unwrap_or_default()
        };
        status.status = RunState::Processing;
        status.error = None;

        let run = Self {
            config,
            paths,
            gateway,
            flags,
            cancel: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(status),
        };
        run.persist_status()?;
        Ok(run)
    }

    /// Accumulate token usage into the status file and persist.
    pub fn add_token_usage(&self, usage: &TokenUsage) -> Result<()> {
        if usage.is_zero() {
            return Ok(());
        }
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            status.add_usage(usage);
        }
        self.persist_status()
    }

    /// Read a copy of the current status.
    pub fn status_snapshot(&self) -> StatusFile {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Mutate the status under the lock and persist.
    pub fn update_status(&self, f: impl FnOnce(&mut StatusFile)) -> Result<()> {
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            f(&mut status);
        }
        self.persist_status()
    }

    fn persist_status(&self) -> Result<()> {
        let status = self.status.lock().expect("status lock poisoned").clone();
        status_file::write_atomic(&self.paths.status_file(), &status)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// Run one named stage under the runtime rules.
///
/// - already in the completed set and no `--force`: skip;
/// - `--only <other>`: skip;
/// - `skip_<name>` in the config: record a skipped marker, skip;
/// - otherwise mark `current_job`, execute, time it, and append to the
///   completed set.
///
/// On failure the error text lands in the status file under `error`, the
/// state flips to `error`, and the error is rethrown to halt the pipeline.
pub async fn run_step<Fut>(run: &PipelineRun, name: &str, fut: Fut) -> Result<()>
where
    Fut: Future<Output = Result<()>>,
{
    if let Some(ref only) = run.flags.only {
        if only != name {
            tracing::info!(stage = name, only = %only, "skipping (not the --only stage)");
            return Ok(());
        }
    } else if !run.flags.force && run.status_snapshot().is_completed(name) {
        tracing::info!(stage = name, "skipping (already completed)");
        return Ok(());
    }

    if run.config.skip_requested(name) {
        tracing::info!(stage = name, "skipping (configured)");
        run.update_status(|s| {
            if !s.skipped_jobs.iter().any(|j| j == name) {
                s.skipped_jobs.push(name.to_string());
            }
        })?;
        return Ok(());
    }

    run.check_cancelled()?;
    run.update_status(|s| s.current_job = name.to_string())?;
    tracing::info!(stage = name, "starting");
    let started = Instant::now();

    match fut.await {
        Ok(()) => {
            let elapsed = started.elapsed().as_secs_f64();
            run.update_status(|s| {
                if !s.completed_jobs.iter().any(|j| j == name) {
                    s.completed_jobs.push(name.to_string());
                }
                s.step_seconds.insert(name.to_string(), elapsed);
            })?;
            tracing::info!(stage = name, elapsed_sec = elapsed, "done");
            Ok(())
        }
        Err(e) => {
            tracing::error!(stage = name, error = %e, "stage failed");
            run.update_status(|s| {
                s.status = RunState::Error;
                s.error = Some(format!("{name}: {e}"));
            })?;
            Err(PipelineError::StageFailed {
                stage: name.to_string(),
                message: e.to_string(),
            })
        }
    }
}

/// Mark a run finished: `status = completed`, `current_job = "completed"`.
pub fn finish(run: &PipelineRun) -> Result<()> {
    run.update_status(|s| {
        s.status = RunState::Completed;
        s.current_job = "completed".to_string();
    })
}
