//! Sidecar tables written between stages.
//!
//! Each stage communicates with the next through files in the job's output
//! directory: `args.csv`, `relations.csv`, `hierarchical_clusters.csv`,
//! `hierarchical_initial_labels.csv`, `hierarchical_merge_labels.csv`, and
//! the opaque binary `embeddings.bin`.

use crate::error::Result;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const ARGS_FILE: &str = "args.csv";
pub const RELATIONS_FILE: &str = "relations.csv";
pub const CLUSTERS_FILE: &str = "hierarchical_clusters.csv";
pub const INITIAL_LABELS_FILE: &str = "hierarchical_initial_labels.csv";
pub const MERGE_LABELS_FILE: &str = "hierarchical_merge_labels.csv";
pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const OVERVIEW_FILE: &str = "hierarchical_overview.txt";
pub const RESULT_FILE: &str = "hierarchical_result.json";
pub const PUBCOM_FILE: &str = "final_result_with_comments.csv";

/// One extracted argument. Category columns (when classification ran) are
/// carried in `categories`, keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentRow {
    pub arg_id: String,
    pub argument: String,
    pub categories: BTreeMap<String, String>,
}

/// Write `args.csv`: fixed `arg-id`/`argument` columns plus one column per
/// category, in sorted order.
pub fn write_args(path: &Path, rows: &[ArgumentRow]) -> Result<()> {
    let category_columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.categories.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["arg-id".to_string(), "argument".to_string()];
    header.extend(category_columns.iter().cloned());
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![row.arg_id.clone(), row.argument.clone()];
        for column in &category_columns {
            record.push(row.categories.get(column).cloned().unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read `args.csv` back, restoring category columns.
pub fn read_args(path: &Path) -> Result<Vec<ArgumentRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut categories = BTreeMap::new();
        for (i, column) in headers.iter().enumerate().skip(2) {
            if let Some(value) = record.get(i) {
                if !value.is_empty() {
                    categories.insert(column.clone(), value.to_string());
                }
            }
        }
        rows.push(ArgumentRow {
            arg_id: record.get(0).unwrap_or("").to_string(),
            argument: record.get(1).unwrap_or("").to_string(),
            categories,
        });
    }
    Ok(rows)
}

/// One argument ↔ comment relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRow {
    #[serde(rename = "arg-id")]
    pub arg_id: String,
    #[serde(rename = "comment-id")]
    pub comment_id: String,
}

pub fn write_relations(path: &Path, rows: &[RelationRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_relations(path: &Path) -> Result<Vec<RelationRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Per-argument cluster assignment with its 2-D coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRow {
    #[serde(rename = "arg-id")]
    pub arg_id: String,
    pub argument: String,
    pub x: f64,
    pub y: f64,
    #[serde(rename = "cluster-level-1-id")]
    pub level1_id: String,
    #[serde(rename = "cluster-level-2-id")]
    pub level2_id: String,
}

pub fn write_clusters(path: &Path, rows: &[ClusterRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_clusters(path: &Path) -> Result<Vec<ClusterRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// A leaf-cluster label from the initial labelling pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialLabelRow {
    pub id: String,
    pub label: String,
    pub description: String,
    /// Member count of the cluster.
    pub value: u64,
}

pub fn write_initial_labels(path: &Path, rows: &[InitialLabelRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_initial_labels(path: &Path) -> Result<Vec<InitialLabelRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// A labelled cluster at any level, with density ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLabelRow {
    pub level: u32,
    pub id: String,
    pub label: String,
    pub description: String,
    pub value: u64,
    pub parent: String,
    pub density: Option<f64>,
    pub density_rank: Option<u64>,
    pub density_rank_percentile: Option<f64>,
}

pub fn write_merge_labels(path: &Path, rows: &[MergeLabelRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_merge_labels(path: &Path) -> Result<Vec<MergeLabelRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// One stored embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub arg_id: String,
    pub vector: Vec<f32>,
}

/// Persist embeddings as an opaque binary sidecar.
pub fn write_embeddings(path: &Path, rows: &[EmbeddingRow]) -> Result<()> {
    let bytes = bincode::serialize(rows)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Load the embeddings sidecar, verifying shared dimensionality.
pub fn read_embeddings(path: &Path) -> Result<Vec<EmbeddingRow>> {
    let bytes = std::fs::read(path)?;
    let rows: Vec<EmbeddingRow> = bincode::deserialize(&bytes)?;
    if let Some(first) = rows.first() {
        let dims = first.vector.len();
        if let Some(bad) = rows.iter().find(|r| r.vector.len() != dims) {
            return Err(PipelineError::Other(format!(
                "embedding '{}' has {} dimensions, expected {}",
                bad.arg_id,
                bad.vector.len(),
                dims
            )));
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_roundtrip_with_categories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ARGS_FILE);
        let rows = vec![
            ArgumentRow {
                arg_id: "AC1_0".into(),
                argument: "Trains should run later.".into(),
                categories: [("topic".to_string(), "transit".to_string())].into(),
            },
            ArgumentRow {
                arg_id: "AC2_0".into(),
                argument: "More parks.".into(),
                categories: BTreeMap::new(),
            },
        ];
        write_args(&path, &rows).unwrap();
        let loaded = read_args(&path).unwrap();
        assert_eq!(loaded, rows);
    }

    #[test]
    fn test_relations_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RELATIONS_FILE);
        let rows = vec![RelationRow {
            arg_id: "AC1_0".into(),
            comment_id: "C1".into(),
        }];
        write_relations(&path, &rows).unwrap();
        assert_eq!(read_relations(&path).unwrap(), rows);
    }

    #[test]
    fn test_clusters_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLUSTERS_FILE);
        let rows = vec![ClusterRow {
            arg_id: "AC1_0".into(),
            argument: "x".into(),
            x: 0.5,
            y: -1.25,
            level1_id: "1_0".into(),
            level2_id: "2_3".into(),
        }];
        write_clusters(&path, &rows).unwrap();
        assert_eq!(read_clusters(&path).unwrap(), rows);
    }

    #[test]
    fn test_merge_labels_roundtrip_with_optionals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MERGE_LABELS_FILE);
        let rows = vec![MergeLabelRow {
            level: 1,
            id: "1_0".into(),
            label: "Transit".into(),
            description: "Opinions about transit.".into(),
            value: 12,
            parent: "0".into(),
            density: Some(0.8),
            density_rank: Some(1),
            density_rank_percentile: Some(50.0),
        }];
        write_merge_labels(&path, &rows).unwrap();
        assert_eq!(read_merge_labels(&path).unwrap(), rows);
    }

    #[test]
    fn test_embeddings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EMBEDDINGS_FILE);
        let rows = vec![
            EmbeddingRow {
                arg_id: "AC1_0".into(),
                vector: vec![0.1, 0.2, 0.3],
            },
            EmbeddingRow {
                arg_id: "AC2_0".into(),
                vector: vec![0.4, 0.5, 0.6],
            },
        ];
        write_embeddings(&path, &rows).unwrap();
        assert_eq!(read_embeddings(&path).unwrap(), rows);
    }

    #[test]
    fn test_embeddings_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EMBEDDINGS_FILE);
        let rows = vec![
            EmbeddingRow {
                arg_id: "a".into(),
                vector: vec![0.1, 0.2],
            },
            EmbeddingRow {
                arg_id: "b".into(),
                vector: vec![0.1],
            },
        ];
        write_embeddings(&path, &rows).unwrap();
        assert!(read_embeddings(&path).is_err());
    }
}
