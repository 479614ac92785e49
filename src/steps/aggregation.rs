//! Aggregation stage: joins every sidecar table into the report artifact.
//!
//! `hierarchical_result.json` carries the arguments (with their full
//! cluster-id paths rooted at `"0"`), the labelled cluster tree, the
//! property map, the overview paragraph, and the effective config. All
//! numbers are native JSON; serialisation is UTF-8, 2-space indent,
//! non-ASCII preserved. When `is_pubcom` is set a flattened per-comment
//! CSV is emitted alongside.

use crate::corpus::{Corpus, ATTRIBUTE_PREFIX};
use crate::error::Result;
use crate::runtime::PipelineRun;
use crate::status_file::write_atomic_bytes;
use crate::tables::{self, ArgumentRow, ClusterRow, MergeLabelRow, RelationRow};
use crate::PipelineError;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Label of the synthetic root cluster.
const ROOT_LABEL: &str = "Overall";
/// Overview text used when the overview stage was skipped.
const OVERVIEW_PLACEHOLDER: &str = "(overview skipped)";

#[derive(Debug, Clone, Serialize)]
pub struct ReportArgument {
    pub arg_id: String,
    pub argument: String,
    pub x: f64,
    pub y: f64,
    pub p: f64,
    /// All levels, including the synthetic root `"0"`.
    pub cluster_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportCluster {
    pub level: u32,
    pub id: String,
    pub label: String,
    pub takeaway: String,
    pub value: u64,
    pub parent: String,
    pub density_rank_percentile: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ReportArtifact {
    pub arguments: Vec<ReportArgument>,
    pub clusters: Vec<ReportCluster>,
    pub comments: BTreeMap<String, Value>,
    pub comment_num: usize,
    #[serde(rename = "propertyMap")]
    pub property_map: BTreeMap<String, BTreeMap<String, Option<String>>>,
    pub overview: String,
    pub config: crate::config::Config,
    pub translations: Value,
}

pub async fn run(run: &PipelineRun) -> Result<()> {
    let config = &run.config;
    let corpus = Corpus::read(&run.paths.input_csv, &[])?;
    let arguments = tables::read_args(&run.paths.output(tables::ARGS_FILE))?;
    let relations = tables::read_relations(&run.paths.output(tables::RELATIONS_FILE))?;
    let clusters = tables::read_clusters(&run.paths.output(tables::CLUSTERS_FILE))?;
    let labels = tables::read_merge_labels(&run.paths.output(tables::MERGE_LABELS_FILE))?;

    let overview = std::fs::read_to_string(run.paths.output(tables::OVERVIEW_FILE))
        .unwrap_or_else(|_| OVERVIEW_PLACEHOLDER.to_string());

    // First relation wins for attribute/url lookup.
    let mut arg_to_comment: HashMap<&str, &str> = HashMap::new();
    for relation in &relations {
        arg_to_comment
            .entry(relation.arg_id.as_str())
            .or_insert(relation.comment_id.as_str());
    }

    let attribute_columns = corpus.attribute_columns();
    let report_arguments = build_arguments(
        &clusters,
        &corpus,
        &arg_to_comment,
        &attribute_columns,
        config.enable_source_link,
    );
    let report_clusters = build_clusters(&labels, arguments.len() as u64);
    let property_map = build_property_map(config, &arguments, &corpus, &arg_to_comment)?;
    let translations = load_translations(run)?;

    let processed = corpus.comments.len().min(config.extraction.limit);
    let mut effective_config = config.clone();
    effective_config.intro = format!(
        "{}\nOf the {} comments analysed, {} opinions were extracted and clustered.",
        config.intro,
        processed,
        arguments.len()
    );

    let artifact = ReportArtifact {
        arguments: report_arguments,
        clusters: report_clusters,
        comments: BTreeMap::new(),
        comment_num: corpus.comments.len(),
        property_map,
        overview,
        config: effective_config,
        translations,
    };

    let json = serde_json::to_string_pretty(&artifact)?;
    write_atomic_bytes(&run.paths.output(tables::RESULT_FILE), json.as_bytes())?;

    if config.is_pubcom {
        write_pubcom_csv(run, &corpus, &arguments, &relations, &clusters, &labels)?;
    }

    tracing::info!(
        arguments = artifact.arguments.len(),
        clusters = artifact.clusters.len(),
        "aggregation complete"
    );
    Ok(())
}

fn build_arguments(
    clusters: &[ClusterRow],
    corpus: &Corpus,
    arg_to_comment: &HashMap<&str, &str>,
    attribute_columns: &[String],
    enable_source_link: bool,
) -> Vec<ReportArgument> {
    clusters
        .iter()
        .map(|row| {
            let mut attributes = None;
            let mut url = None;

            if let Some(comment) = arg_to_comment
                .get(row.arg_id.as_str())
                .and_then(|id| corpus.comment(id))
            {
                if enable_source_link {
                    url = comment.url.clone();
                }
                if !attribute_columns.is_empty() {
                    let map: BTreeMap<String, String> = attribute_columns
                        .iter()
                        .filter_map(|column| {
                            comment.attributes.get(column).map(|value| {
                                (
                                    column
                                        .strip_prefix(ATTRIBUTE_PREFIX)
                                        .unwrap_or(column)
                                        .to_string(),
                                    value.clone(),
                                )
                            })
                        })
                        .collect();
                    if !map.is_empty() {
                        attributes = Some(map);
                    }
                }
            }

            ReportArgument {
                arg_id: row.arg_id.clone(),
                argument: row.argument.clone(),
                x: row.x,
                y: row.y,
                p: 0.0,
                cluster_ids: vec![
                    "0".to_string(),
                    row.level1_id.clone(),
                    row.level2_id.clone(),
                ],
                attributes,
                url,
            }
        })
        .collect()
}

fn build_clusters(labels: &[MergeLabelRow], total: u64) -> Vec<ReportCluster> {
    let mut clusters = vec![ReportCluster {
        level: 0,
        id: "0".to_string(),
        label: ROOT_LABEL.to_string(),
        takeaway: String::new(),
        value: total,
        parent: String::new(),
        density_rank_percentile: Some(0.0),
    }];
    clusters.extend(labels.iter().map(|label| ReportCluster {
        level: label.level,
        id: label.id.clone(),
        label: label.label.clone(),
        takeaway: label.description.clone(),
        value: label.value,
        parent: label.parent.clone(),
        density_rank_percentile: label.density_rank_percentile,
    }));
    clusters
}

/// attribute_name → arg_id → value, over the hidden-property columns and
/// the classification categories. A column that is neither a category nor
/// a comment column is a configuration error.
fn build_property_map(
    config: &crate::config::Config,
    arguments: &[ArgumentRow],
    corpus: &Corpus,
    arg_to_comment: &HashMap<&str, &str>,
) -> Result<BTreeMap<String, BTreeMap<String, Option<String>>>> {
    let mut columns: Vec<String> = config
        .hierarchical_aggregation
        .hidden_properties
        .keys()
        .chain(config.extraction.categories.keys())
        .cloned()
        .collect();
    columns.sort();
    columns.dedup();

    let mut property_map = BTreeMap::new();
    for column in columns {
        let is_category = config.extraction.categories.contains_key(&column);
        if !is_category && !corpus.columns.contains(&column) {
            return Err(PipelineError::ConfigInvalid(format!(
                "property column '{column}' exists neither as a category nor in the input; \
                 remove it from hierarchical_aggregation.hidden_properties"
            )));
        }

        let mut values = BTreeMap::new();
        for argument in arguments {
            let value = if is_category {
                argument.categories.get(&column).cloned()
            } else {
                arg_to_comment
                    .get(argument.arg_id.as_str())
                    .and_then(|id| corpus.comment(id))
                    .and_then(|c| c.attributes.get(&column).cloned())
            };
            values.insert(argument.arg_id.clone(), value);
        }
        property_map.insert(column, values);
    }
    Ok(property_map)
}

fn load_translations(run: &PipelineRun) -> Result<Value> {
    let configured = run
        .config
        .translation
        .as_ref()
        .is_some_and(|t| !t.languages.is_empty());
    if !configured {
        return Ok(Value::Object(Default::default()));
    }
    let raw = std::fs::read_to_string(run.paths.output("translations.json"))?;
    Ok(serde_json::from_str(&raw)?)
}

/// The flattened per-comment CSV: each argument joined with its source
/// comment, level-1 label, and preserved attribute columns.
fn write_pubcom_csv(
    run: &PipelineRun,
    corpus: &Corpus,
    arguments: &[ArgumentRow],
    relations: &[RelationRow],
    clusters: &[ClusterRow],
    labels: &[MergeLabelRow],
) -> Result<()> {
    let level1_labels: HashMap<&str, &str> = labels
        .iter()
        .filter(|l| l.level == 1)
        .map(|l| (l.id.as_str(), l.label.as_str()))
        .collect();
    let cluster_by_arg: HashMap<&str, &ClusterRow> =
        clusters.iter().map(|c| (c.arg_id.as_str(), c)).collect();
    let argument_by_id: HashMap<&str, &ArgumentRow> =
        arguments.iter().map(|a| (a.arg_id.as_str(), a)).collect();

    let has_source = corpus.columns.iter().any(|c| c == "source");
    let has_url = corpus.columns.iter().any(|c| c == "url");
    let attribute_columns = corpus.attribute_columns();

    let mut header = vec![
        "comment-id".to_string(),
        "original-comment".to_string(),
        "arg_id".to_string(),
        "argument".to_string(),
        "category_id".to_string(),
        "category".to_string(),
    ];
    if has_source {
        header.push("source".to_string());
    }
    if has_url {
        header.push("url".to_string());
    }
    header.extend(attribute_columns.iter().cloned());

    let mut writer = csv::Writer::from_path(run.paths.output(tables::PUBCOM_FILE))?;
    writer.write_record(&header)?;

    for relation in relations {
        let Some(argument) = argument_by_id.get(relation.arg_id.as_str()) else {
            continue;
        };
        let Some(comment) = corpus.comment(&relation.comment_id) else {
            continue;
        };
        let cluster = cluster_by_arg.get(relation.arg_id.as_str());
        let category_id = cluster.map(|c| c.level1_id.as_str()).unwrap_or("");
        let category = level1_labels.get(category_id).copied().unwrap_or("");

        let mut record = vec![
            comment.id.clone(),
            comment.body.clone(),
            argument.arg_id.clone(),
            argument.argument.clone(),
            category_id.to_string(),
            category.to_string(),
        ];
        if has_source {
            record.push(comment.source.clone().unwrap_or_default());
        }
        if has_url {
            record.push(comment.url.clone().unwrap_or_default());
        }
        for column in &attribute_columns {
            record.push(comment.attributes.get(column).cloned().unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
