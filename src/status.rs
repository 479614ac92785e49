//! The process-wide report status registry.
//!
//! One JSON file maps `slug → StatusRecord`; every mutation happens behind
//! a single lock and is persisted atomically. Visibility and metadata
//! changes fire a cache-invalidation POST at the downstream presentation
//! tier; invalidation failures are logged, never propagated.

use crate::error::Result;
use crate::pricing;
use crate::status_file;
use crate::tables;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const REVALIDATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle state of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportState {
    Processing,
    Ready,
    Error,
    Deleted,
}

impl ReportState {
    /// The monotonic state machine: `processing → {ready, error, deleted}`,
    /// `ready/error → deleted`, `deleted` terminal. Re-asserting the
    /// current state is a no-op.
    fn can_transition(self, to: ReportState) -> bool {
        use ReportState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Processing, Ready) | (Processing, Error) | (Processing, Deleted)
                | (Ready, Deleted)
                | (Error, Deleted)
        )
    }
}

/// Who can see a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

/// Figures pulled from a ready report's aggregated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub comment_num: u64,
    pub arguments_num: u64,
    pub cluster_num_at_level_2: u64,
}

/// One registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub slug: String,
    pub status: ReportState,
    pub visibility: Visibility,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub is_pubcom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub token_usage: u64,
    #[serde(default)]
    pub token_usage_input: u64,
    #[serde(default)]
    pub token_usage_output: u64,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

/// Where cache-invalidation requests go.
#[derive(Debug, Clone)]
pub struct RevalidateConfig {
    pub url: String,
    pub secret: String,
}

impl RevalidateConfig {
    /// From `REVALIDATE_URL` / `REVALIDATE_SECRET`; `None` disables the hook.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("REVALIDATE_URL").ok()?;
        let secret = std::env::var("REVALIDATE_SECRET").unwrap_or_default();
        Some(Self { url, secret })
    }
}

/// Convert a legacy registry in place: `is_public: bool` becomes
/// `visibility: public|private` and the old key is dropped. Idempotent —
/// records without `is_public` are untouched.
pub fn convert_legacy_format(registry: &mut Value) {
    let Some(map) = registry.as_object_mut() else {
        return;
    };
    for record in map.values_mut() {
        let Some(fields) = record.as_object_mut() else {
            continue;
        };
        if let Some(Value::Bool(is_public)) = fields.remove("is_public") {
            let visibility = if is_public { "public" } else { "private" };
            fields.insert("visibility".to_string(), Value::String(visibility.into()));
        }
    }
}

/// The registry service. Owns the file exclusively; all writers go through
/// its lock.
pub struct StatusManager {
    path: PathBuf,
    report_dir: PathBuf,
    revalidate: Option<RevalidateConfig>,
    http: reqwest::Client,
    records: Mutex<BTreeMap<String, StatusRecord>>,
}

impl StatusManager {
    /// Open (or create) a registry file. A missing or unreadable file is an
    /// empty registry.
    pub fn new(path: PathBuf, report_dir: PathBuf, revalidate: Option<RevalidateConfig>) -> Self {
        let records = load_records(&path);
        Self {
            path,
            report_dir,
            revalidate,
            http: reqwest::Client::new(),
            records: Mutex::new(records),
        }
    }

    /// All records; deleted ones filtered out unless asked for.
    pub fn list_reports(&self, include_deleted: bool) -> Vec<StatusRecord> {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|r| include_deleted || r.status != ReportState::Deleted)
            .cloned()
            .collect()
    }

    pub fn get(&self, slug: &str) -> Option<StatusRecord> {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .get(slug)
            .cloned()
    }

    /// Register a freshly launched job.
    pub fn add_new(
        &self,
        slug: &str,
        title: &str,
        description: &str,
        is_pubcom: bool,
    ) -> Result<()> {
        let record = StatusRecord {
            slug: slug.to_string(),
            status: ReportState::Processing,
            visibility: Visibility::Unlisted,
            title: title.to_string(),
            description: description.to_string(),
            is_pubcom,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            token_usage: 0,
            token_usage_input: 0,
            token_usage_output: 0,
            estimated_cost: 0.0,
            provider: None,
            model: None,
            analysis: None,
        };
        let mut records = self.records.lock().expect("registry lock poisoned");
        records.insert(slug.to_string(), record);
        self.save(&records)
    }

    /// Validated state transition.
    pub fn set_state(&self, slug: &str, state: ReportState) -> Result<()> {
        let mut records = self.records.lock().expect("registry lock poisoned");
        let record = records.get_mut(slug).ok_or_else(|| {
            PipelineError::Other(format!("slug {slug} not found in report status"))
        })?;
        if !record.status.can_transition(state) {
            return Err(PipelineError::InvalidTransition(format!(
                "{:?} -> {:?} for {slug}",
                record.status, state
            )));
        }
        record.status = state;
        self.save(&records)
    }

    /// Change visibility, then ask the presentation tier to drop its cache.
    pub async fn set_visibility(&self, slug: &str, visibility: Visibility) -> Result<Visibility> {
        {
            let mut records = self.records.lock().expect("registry lock poisoned");
            let record = records.get_mut(slug).ok_or_else(|| {
                PipelineError::Other(format!("slug {slug} not found in report status"))
            })?;
            record.visibility = visibility;
            self.save(&records)?;
        }
        self.invalidate_cache(slug).await;
        Ok(visibility)
    }

    /// Partial token update; cost is recomputed only when input, output,
    /// provider, and model are all present.
    pub fn update_tokens(
        &self,
        slug: &str,
        total: u64,
        input: Option<u64>,
        output: Option<u64>,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().expect("registry lock poisoned");
        let Some(record) = records.get_mut(slug) else {
            tracing::warn!(slug, "token update for unknown slug ignored");
            return Ok(());
        };

        record.token_usage = total;
        if let Some(input) = input {
            record.token_usage_input = input;
        }
        if let Some(output) = output {
            record.token_usage_output = output;
        }
        if let (Some(input), Some(output), Some(provider), Some(model)) =
            (input, output, provider, model)
        {
            record.provider = Some(provider.to_string());
            record.model = Some(model.to_string());
            record.estimated_cost = pricing::cost(provider, model, input, output);
            tracing::info!(slug, cost = record.estimated_cost, "estimated cost updated");
        }
        self.save(&records)
    }

    /// Update title/description, patch the aggregated artifact when one
    /// exists, then invalidate the cache.
    pub async fn update_config(
        &self,
        slug: &str,
        question: Option<&str>,
        intro: Option<&str>,
    ) -> Result<StatusRecord> {
        let updated = {
            let mut records = self.records.lock().expect("registry lock poisoned");
            let record = records.get_mut(slug).ok_or_else(|| {
                PipelineError::Other(format!("slug {slug} not found in report status"))
            })?;
            if let Some(question) = question {
                record.title = question.to_string();
            }
            if let Some(intro) = intro {
                record.description = intro.to_string();
            }
            let updated = record.clone();
            self.save(&records)?;
            updated
        };

        if let Err(e) = self.patch_artifact(slug, question, intro) {
            tracing::error!(slug, "failed to update the aggregated artifact: {e}");
        }

        self.invalidate_cache(slug).await;
        Ok(updated)
    }

    /// Attach `{comment_num, arguments_num, cluster_num_at_level_2}` from
    /// the aggregated artifact to a ready report.
    pub fn enrich_with_analysis(&self, record: &mut StatusRecord) -> Result<()> {
        if record.status != ReportState::Ready {
            return Ok(());
        }
        let path = self.artifact_path(&record.slug);
        let raw = std::fs::read_to_string(&path)?;
        let artifact: Value = serde_json::from_str(&raw)?;

        let clusters_at_level2 = artifact["clusters"]
            .as_array()
            .map(|cs| cs.iter().filter(|c| c["level"] == 2).count() as u64)
            .unwrap_or(0);
        record.analysis = Some(Analysis {
            comment_num: artifact["comment_num"].as_u64().unwrap_or(0),
            arguments_num: artifact["arguments"]
                .as_array()
                .map(|a| a.len() as u64)
                .unwrap_or(0),
            cluster_num_at_level_2: clusters_at_level2,
        });
        Ok(())
    }

    /// The stage a running job is currently in, as the control plane
    /// reports it: `"loading"` until the pipeline has written its status
    /// file, `"error"`/`"completed"` once it is terminal, otherwise the
    /// stage name.
    pub fn current_step(&self, slug: &str) -> String {
        let path = self.report_dir.join(slug).join(status_file::STATUS_FILE_NAME);
        let Some(job_status) = status_file::load(&path) else {
            return "loading".to_string();
        };
        if job_status.error.is_some() {
            return "error".to_string();
        }
        if job_status.status == status_file::RunState::Completed {
            return "completed".to_string();
        }
        if job_status.current_job.is_empty() {
            return "loading".to_string();
        }
        job_status.current_job
    }

    fn artifact_path(&self, slug: &str) -> PathBuf {
        self.report_dir.join(slug).join(tables::RESULT_FILE)
    }

    fn patch_artifact(
        &self,
        slug: &str,
        question: Option<&str>,
        intro: Option<&str>,
    ) -> Result<()> {
        let path = self.artifact_path(slug);
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut artifact: Value = serde_json::from_str(&raw)?;
        if let Some(question) = question {
            if let Some(config) = artifact.get_mut("config") {
                config["question"] = Value::String(question.to_string());
            }
        }
        if let Some(intro) = intro {
            artifact["overview"] = Value::String(intro.to_string());
        }
        status_file::write_atomic_bytes(&path, serde_json::to_string_pretty(&artifact)?.as_bytes())
    }

    /// POST `{tag: "report-<slug>", secret}` with a short timeout. Non-200
    /// responses and transport failures are logged and swallowed.
    async fn invalidate_cache(&self, slug: &str) {
        let Some(ref revalidate) = self.revalidate else {
            return;
        };
        let payload = serde_json::json!({
            "tag": format!("report-{slug}"),
            "secret": revalidate.secret,
        });
        let result = self
            .http
            .post(&revalidate.url)
            .timeout(REVALIDATE_TIMEOUT)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(slug, "presentation cache invalidated");
            }
            Ok(resp) => {
                tracing::error!(slug, status = resp.status().as_u16(), "revalidate rejected");
            }
            Err(e) => {
                tracing::error!(slug, "revalidate request failed: {e}");
            }
        }
    }

    fn save(&self, records: &BTreeMap<String, StatusRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let value = serde_json::to_string_pretty(records)?;
        status_file::write_atomic_bytes(&self.path, value.as_bytes())
    }
}

/// Read the registry from disk, converting legacy records. A missing or
/// corrupt file yields an empty registry.
fn load_records(path: &Path) -> BTreeMap<String, StatusRecord> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    let Ok(mut value) = serde_json::from_str::<Value>(&raw) else {
        return BTreeMap::new();
    };
    convert_legacy_format(&mut value);

    let Some(map) = value.as_object() else {
        return BTreeMap::new();
    };
    let mut records = BTreeMap::new();
    for (slug, entry) in map {
        match serde_json::from_value::<StatusRecord>(entry.clone()) {
            Ok(record) => {
                records.insert(slug.clone(), record);
            }
            Err(e) => {
                tracing::warn!(slug, "dropping unreadable status record: {e}");
            }
        }
    }
    records
}
