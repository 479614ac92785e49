//! Editing labelled clusters after a run.
//!
//! The control plane lets operators fix a cluster's label or takeaway text
//! without re-running the pipeline; the edit lands directly in the job's
//! `hierarchical_merge_labels.csv` and takes effect on the next
//! aggregation-only re-run.

use crate::error::Result;
use crate::tables::{self, MergeLabelRow};
use crate::PipelineError;
use std::path::{Path, PathBuf};

/// One requested edit.
#[derive(Debug, Clone)]
pub struct ClusterUpdate {
    pub id: String,
    pub label: String,
    pub description: String,
}

/// Accessor for one job's merge-labels table.
pub struct ClusterEdits {
    labels_path: PathBuf,
}

impl ClusterEdits {
    /// `report_dir/<slug>/hierarchical_merge_labels.csv`.
    pub fn for_report(report_dir: &Path, slug: &str) -> Self {
        Self {
            labels_path: report_dir.join(slug).join(tables::MERGE_LABELS_FILE),
        }
    }

    /// All label rows; an absent file reads as empty.
    pub fn read(&self) -> Result<Vec<MergeLabelRow>> {
        if !self.labels_path.exists() {
            return Ok(Vec::new());
        }
        tables::read_merge_labels(&self.labels_path)
    }

    /// Replace the label/description of one cluster, keeping every other
    /// field intact.
    pub fn update(&self, update: &ClusterUpdate) -> Result<()> {
        let mut rows = self.read()?;
        let Some(row) = rows.iter_mut().find(|r| r.id == update.id) else {
            return Err(PipelineError::Other(format!(
                "cluster {} not found in {}",
                update.id,
                self.labels_path.display()
            )));
        };
        row.label = update.label.clone();
        row.description = update.description.clone();
        tables::write_merge_labels(&self.labels_path, &rows)
    }
}
