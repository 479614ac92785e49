//! The job launcher: turns a report request into a running pipeline child.
//!
//! Serialises the request into the pipeline's config and input files,
//! registers the job as `processing`, spawns the pipeline binary, and
//! monitors its exit from a background task: exit 0 pulls the token totals
//! out of the job's status file and flips the registry to `ready`, anything
//! else flips it to `error`. The returned [`JobHandle`] exposes `wait()`
//! and `cancel()`.

use crate::config::{Config, ProviderKind};
use crate::error::Result;
use crate::status::{ReportState, StatusManager};
use crate::status_file::{self, STATUS_FILE_NAME};
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One input comment of a job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentInput {
    pub id: String,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra attribute columns, written to the CSV as-is.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

/// Prompts for the four LLM stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPrompts {
    pub extraction: String,
    pub initial_labelling: String,
    pub merge_labelling: String,
    pub overview: String,
}

/// A report-generation request from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job slug; also names the input/config/output files.
    pub input: String,
    pub question: String,
    pub intro: String,
    pub provider: ProviderKind,
    pub model: String,
    pub workers: usize,
    /// `[top, bottom]`, or empty to auto-tune.
    #[serde(default)]
    pub cluster: Vec<usize>,
    pub prompt: JobPrompts,
    pub comments: Vec<CommentInput>,
    #[serde(default)]
    pub is_pubcom: bool,
    #[serde(default)]
    pub is_embedded_at_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_llm_address: Option<String>,
    #[serde(default)]
    pub enable_source_link: bool,
    /// Per-job API key, passed to the child as `USER_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_api_key: Option<String>,
}

/// Directory layout the launcher materialises jobs into.
#[derive(Debug, Clone)]
pub struct LauncherDirs {
    pub config_dir: PathBuf,
    pub input_dir: PathBuf,
    /// The pipeline's working directory; per-job outputs live under
    /// `<work_dir>/outputs/<slug>/`.
    pub work_dir: PathBuf,
}

impl LauncherDirs {
    pub fn under(base: &std::path::Path) -> Self {
        Self {
            config_dir: base.join("configs"),
            input_dir: base.join("inputs"),
            work_dir: base.to_path_buf(),
        }
    }

    fn output_dir(&self, slug: &str) -> PathBuf {
        self.work_dir.join("outputs").join(slug)
    }
}

/// Handle on a spawned pipeline child.
pub struct JobHandle {
    pub slug: String,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<Result<ExitStatus>>,
}

impl JobHandle {
    /// Wait for the child and its post-exit bookkeeping to finish.
    pub async fn wait(self) -> Result<ExitStatus> {
        self.monitor
            .await
            .map_err(|e| PipelineError::Other(format!("monitor task failed: {e}")))?
    }

    /// Kill the child; the monitor flips the job to `error`.
    pub fn cancel(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Spawns and monitors pipeline children.
pub struct Launcher {
    status: Arc<StatusManager>,
    dirs: LauncherDirs,
    pipeline_bin: PathBuf,
}

impl Launcher {
    pub fn new(status: Arc<StatusManager>, dirs: LauncherDirs, pipeline_bin: PathBuf) -> Self {
        Self {
            status,
            dirs,
            pipeline_bin,
        }
    }

    /// Launch a full pipeline run for a job request.
    pub async fn launch(&self, request: JobRequest) -> Result<JobHandle> {
        request_config(&request).validate()?;

        self.status.add_new(
            &request.input,
            &request.question,
            &request.intro,
            request.is_pubcom,
        )?;

        let result = async {
            let config_path = self.write_config(&request)?;
            self.write_input_csv(&request)?;
            self.spawn(&request.input, &config_path, &[], request.user_api_key.as_deref())
        }
        .await;

        match result {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::error!(slug = %request.input, "failed to launch report generation: {e}");
                let _ = self.status.set_state(&request.input, ReportState::Error);
                Err(e)
            }
        }
    }

    /// Re-run only the aggregation stage for an existing job (after
    /// metadata or label edits).
    pub fn execute_aggregation(&self, slug: &str) -> Result<JobHandle> {
        let config_path = self.dirs.config_dir.join(format!("{slug}.json"));
        if !config_path.exists() {
            return Err(PipelineError::ConfigInvalid(format!(
                "no config file for job {slug}"
            )));
        }
        self.spawn(slug, &config_path, &["-o", "hierarchical_aggregation"], None)
    }

    fn write_config(&self, request: &JobRequest) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dirs.config_dir)?;
        let config = request_config(request);
        let path = self.dirs.config_dir.join(format!("{}.json", request.input));
        status_file::write_atomic_bytes(&path, serde_json::to_string_pretty(&config)?.as_bytes())?;
        Ok(path)
    }

    fn write_input_csv(&self, request: &JobRequest) -> Result<()> {
        std::fs::create_dir_all(&self.dirs.input_dir)?;
        let path = self.dirs.input_dir.join(format!("{}.csv", request.input));

        let attribute_columns: Vec<String> = request
            .comments
            .iter()
            .flat_map(|c| c.attributes.keys().cloned())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut writer = csv::Writer::from_path(&path)?;
        let mut header = vec![
            "comment-id".to_string(),
            "comment-body".to_string(),
            "source".to_string(),
            "url".to_string(),
        ];
        header.extend(attribute_columns.iter().cloned());
        writer.write_record(&header)?;

        for comment in &request.comments {
            let mut record = vec![
                comment.id.clone(),
                comment.comment.clone(),
                comment.source.clone().unwrap_or_default(),
                comment.url.clone().unwrap_or_default(),
            ];
            for column in &attribute_columns {
                record.push(comment.attributes.get(column).cloned().unwrap_or_default());
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn spawn(
        &self,
        slug: &str,
        config_path: &PathBuf,
        extra_args: &[&str],
        user_api_key: Option<&str>,
    ) -> Result<JobHandle> {
        let mut command = tokio::process::Command::new(&self.pipeline_bin);
        command
            .arg(config_path)
            .arg("--skip-interaction")
            .arg("--without-html")
            .args(extra_args)
            .current_dir(&self.dirs.work_dir)
            .kill_on_drop(true);
        if let Some(key) = user_api_key {
            command.env("USER_API_KEY", key);
        }

        let mut child = command.spawn()?;
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let status = Arc::clone(&self.status);
        let slug_owned = slug.to_string();
        let status_path = self.dirs.output_dir(slug).join(STATUS_FILE_NAME);
        let config_path = config_path.clone();

        let monitor = tokio::spawn(async move {
            let exit = tokio::select! {
                exit = child.wait() => exit?,
                _ = kill_rx => {
                    tracing::warn!(slug = %slug_owned, "job cancelled, killing child");
                    let _ = child.kill().await;
                    let _ = status.set_state(&slug_owned, ReportState::Error);
                    return Err(PipelineError::Cancelled);
                }
            };

            if exit.success() {
                finalize_success(&status, &slug_owned, &status_path, &config_path);
            } else {
                tracing::error!(slug = %slug_owned, code = ?exit.code(), "pipeline failed");
                let _ = status.set_state(&slug_owned, ReportState::Error);
            }
            Ok(exit)
        });

        Ok(JobHandle {
            slug: slug.to_string(),
            kill: Some(kill_tx),
            monitor,
        })
    }
}

/// Pull token totals and provider/model into the registry, then mark ready.
fn finalize_success(
    status: &StatusManager,
    slug: &str,
    status_path: &PathBuf,
    config_path: &PathBuf,
) {
    if let Some(job_status) = status_file::load(status_path) {
        let (provider, model) = match Config::load(config_path) {
            Ok(config) => (
                Some(config.provider.as_str().to_string()),
                Some(config.model),
            ),
            Err(e) => {
                tracing::error!(slug, "could not re-read the job config: {e}");
                (None, None)
            }
        };
        if let Err(e) = status.update_tokens(
            slug,
            job_status.total_token_usage,
            Some(job_status.token_usage_input),
            Some(job_status.token_usage_output),
            provider.as_deref(),
            model.as_deref(),
        ) {
            tracing::error!(slug, "token update failed: {e}");
        }
    } else {
        tracing::warn!(slug, "pipeline exited 0 without a status file");
    }

    if let Err(e) = status.set_state(slug, ReportState::Ready) {
        tracing::error!(slug, "could not mark job ready: {e}");
    }
}

/// Materialise the child's config from the request.
fn request_config(request: &JobRequest) -> Config {
    use crate::config::*;

    let auto = request.cluster.len() != 2;
    Config {
        name: request.input.clone(),
        input: request.input.clone(),
        question: request.question.clone(),
        intro: request.intro.clone(),
        model: request.model.clone(),
        provider: request.provider,
        local_llm_address: request.local_llm_address.clone(),
        is_embedded_at_local: request.is_embedded_at_local,
        is_pubcom: request.is_pubcom,
        enable_source_link: request.enable_source_link,
        extraction: ExtractionConfig {
            prompt: request.prompt.extraction.clone(),
            workers: request.workers,
            limit: request.comments.len(),
            properties: Vec::new(),
            categories: BTreeMap::new(),
            model: None,
        },
        embedding: EmbeddingConfig::default(),
        hierarchical_clustering: ClusteringConfig {
            cluster_nums: (!auto).then(|| request.cluster.clone()),
            auto_cluster_enabled: auto,
            ..Default::default()
        },
        hierarchical_initial_labelling: LabellingConfig {
            prompt: request.prompt.initial_labelling.clone(),
            sampling_num: 30,
            workers: request.workers,
            model: None,
        },
        hierarchical_merge_labelling: LabellingConfig {
            prompt: request.prompt.merge_labelling.clone(),
            sampling_num: 30,
            workers: request.workers,
            model: None,
        },
        hierarchical_overview: OverviewConfig {
            prompt: request.prompt.overview.clone(),
            model: None,
        },
        hierarchical_aggregation: AggregationConfig::default(),
        translation: None,
        skip_extraction: false,
        skip_initial_labelling: false,
        skip_merge_labelling: false,
        skip_overview: false,
    }
}
