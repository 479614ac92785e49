//! The per-job pipeline status file (`hierarchical_status.json`).
//!
//! Written after every stage transition so the control plane can poll
//! `current_job`, accumulated token usage, and (in auto-cluster mode) the
//! silhouette sweep outcome. Writes are atomic: a sibling temp file is
//! renamed over the target, never leaving a partial file behind.

use crate::error::Result;
use crate::provider::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const STATUS_FILE_NAME: &str = "hierarchical_status.json";

/// Overall run state as reported to the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Processing,
    Completed,
    Error,
}

/// One `(k, silhouette)` winner of an auto-cluster range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KScore {
    pub k: usize,
    pub score: f64,
}

/// A scored sweep candidate, labelled `top-<k>` or `bottom-<k>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledScore {
    pub label: String,
    pub score: f64,
}

/// The winners of both sweep ranges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestKs {
    pub top: KScore,
    pub bottom: KScore,
}

/// Recorded outcome of the auto-cluster sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoClusterResult {
    pub timestamp: String,
    pub top_range: [usize; 2],
    pub bottom_range: [usize; 2],
    pub best: BestKs,
    pub duration_sec: f64,
    pub results: Vec<LabelledScore>,
    /// Candidates whose silhouette computation failed (e.g. `k >= n`).
    #[serde(default)]
    pub skipped: Vec<String>,
}

/// The status file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusFile {
    pub status: RunState,
    #[serde(default)]
    pub current_job: String,
    #[serde(default)]
    pub completed_jobs: Vec<String>,
    #[serde(default)]
    pub skipped_jobs: Vec<String>,
    #[serde(default)]
    pub token_usage_input: u64,
    #[serde(default)]
    pub token_usage_output: u64,
    #[serde(default)]
    pub total_token_usage: u64,
    /// Wall-clock seconds per completed stage.
    #[serde(default)]
    pub step_seconds: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_cluster_result: Option<AutoClusterResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusFile {
    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_jobs.iter().any(|s| s == stage)
    }

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.token_usage_input += usage.input;
        self.token_usage_output += usage.output;
        self.total_token_usage += usage.total;
    }
}

/// Read a status file if one exists. A corrupt file is treated as absent —
/// a crashed job becomes `error` on the next reconciliation, never silently
/// resumes from bad state.
pub fn load(path: &Path) -> Option<StatusFile> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(path = %path.display(), "discarding unreadable status file: {e}");
            None
        }
    }
}

/// Atomically persist a status file: write a sibling temp file, then rename.
pub fn write_atomic(path: &Path, status: &StatusFile) -> Result<()> {
    write_atomic_bytes(path, serde_json::to_string_pretty(status)?.as_bytes())
}

/// Atomic replace for any artifact file.
pub fn write_atomic_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
