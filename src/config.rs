//! Job configuration: the JSON file a report job is launched with.
//!
//! The config is immutable once the pipeline starts; command-line flags
//! (`--auto-cluster`, `--skip-*`, the cluster bounds) are folded in before
//! validation. Required keys: `name`, `input`, `question`, `intro`,
//! `model`, `provider`, `extraction.prompt`, the per-stage prompts, and one
//! of `hierarchical_clustering.cluster_nums` /
//! `hierarchical_clustering.auto_cluster_enabled`.

use crate::error::Result;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Supported LLM vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Azure,
    Gemini,
    #[serde(rename = "openrouter")]
    OpenRouter,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub prompt: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Process at most this many comments.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Per-comment attribute columns to validate and carry through.
    #[serde(default)]
    pub properties: Vec<String>,
    /// Category-classification slot: column name → allowed values.
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
    /// Per-stage model override; the top-level model otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Cumulative token budget per remote embedding request.
    #[serde(default = "default_embedding_max_tokens")]
    pub max_tokens: usize,
    /// Item-count fallback when inputs cannot be token-counted.
    #[serde(default = "default_embedding_max_items")]
    pub max_items: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            max_tokens: default_embedding_max_tokens(),
            max_items: default_embedding_max_items(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Canonical shape: `[top, bottom]` with `top < bottom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_nums: Option<Vec<usize>>,
    #[serde(default)]
    pub auto_cluster_enabled: bool,
    #[serde(default = "default_top_min")]
    pub cluster_top_min: usize,
    #[serde(default = "default_top_max")]
    pub cluster_top_max: usize,
    #[serde(default = "default_bottom_max")]
    pub cluster_bottom_max: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            cluster_nums: None,
            auto_cluster_enabled: false,
            cluster_top_min: default_top_min(),
            cluster_top_max: default_top_max(),
            cluster_bottom_max: default_bottom_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabellingConfig {
    pub prompt: String,
    #[serde(default = "default_sampling_num")]
    pub sampling_num: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewConfig {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Attribute → values hidden from the aggregated output.
    #[serde(default)]
    pub hidden_properties: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub languages: Vec<String>,
}

/// The full job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Job slug; also names the output directory.
    pub name: String,
    /// Input corpus stem (`inputs/<input>.csv`).
    pub input: String,
    pub question: String,
    pub intro: String,
    pub model: String,
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_llm_address: Option<String>,
    #[serde(default)]
    pub is_embedded_at_local: bool,
    #[serde(default)]
    pub is_pubcom: bool,
    #[serde(default)]
    pub enable_source_link: bool,

    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub hierarchical_clustering: ClusteringConfig,
    pub hierarchical_initial_labelling: LabellingConfig,
    pub hierarchical_merge_labelling: LabellingConfig,
    pub hierarchical_overview: OverviewConfig,
    #[serde(default)]
    pub hierarchical_aggregation: AggregationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationConfig>,

    #[serde(default)]
    pub skip_extraction: bool,
    #[serde(default)]
    pub skip_initial_labelling: bool,
    #[serde(default)]
    pub skip_merge_labelling: bool,
    #[serde(default)]
    pub skip_overview: bool,
}

fn default_workers() -> usize {
    1
}
fn default_limit() -> usize {
    usize::MAX
}
fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}
fn default_embedding_max_tokens() -> usize {
    200_000
}
fn default_embedding_max_items() -> usize {
    1_000
}
fn default_sampling_num() -> usize {
    30
}
fn default_top_min() -> usize {
    2
}
fn default_top_max() -> usize {
    20
}
fn default_bottom_max() -> usize {
    100
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the invariants a job must hold before it starts.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::ConfigInvalid(msg));

        if self.name.is_empty() {
            return fail("name must not be empty".into());
        }
        if self.extraction.prompt.is_empty() {
            return fail("extraction.prompt must not be empty".into());
        }
        if self.extraction.workers == 0 {
            return fail("extraction.workers must be positive".into());
        }

        let clustering = &self.hierarchical_clustering;
        match (&clustering.cluster_nums, clustering.auto_cluster_enabled) {
            (Some(nums), _) => {
                if nums.len() != 2 {
                    return fail(format!(
                        "hierarchical_clustering.cluster_nums must be [top, bottom], got {:?}",
                        nums
                    ));
                }
                if nums[0] < 2 || nums[0] >= nums[1] {
                    return fail(format!(
                        "cluster_nums requires 2 <= top < bottom, got {:?}",
                        nums
                    ));
                }
            }
            (None, true) => {
                if clustering.cluster_top_min < 2
                    || clustering.cluster_top_min > clustering.cluster_top_max
                    || clustering.cluster_top_max >= clustering.cluster_bottom_max
                {
                    return fail(format!(
                        "auto_cluster requires 2 <= top_min <= top_max < bottom_max, got [{}, {}] / {}",
                        clustering.cluster_top_min,
                        clustering.cluster_top_max,
                        clustering.cluster_bottom_max
                    ));
                }
            }
            (None, false) => {
                return fail(
                    "one of hierarchical_clustering.cluster_nums or auto_cluster_enabled is required"
                        .into(),
                );
            }
        }

        Ok(())
    }

    /// The model for a stage, honouring the per-stage override.
    pub fn model_for(&self, stage_model: &Option<String>) -> String {
        stage_model.clone().unwrap_or_else(|| self.model.clone())
    }

    /// Whether the given stage name was configured to be skipped.
    pub fn skip_requested(&self, stage: &str) -> bool {
        match stage {
            "extraction" => self.skip_extraction,
            "hierarchical_initial_labelling" => self.skip_initial_labelling,
            "hierarchical_merge_labelling" => self.skip_merge_labelling,
            "hierarchical_overview" => self.skip_overview,
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A minimal valid config for stage tests.
    pub fn minimal_config(name: &str) -> Config {
        Config {
            name: name.to_string(),
            input: name.to_string(),
            question: "What do people think?".into(),
            intro: "A small survey.".into(),
            model: "mock-model".into(),
            provider: ProviderKind::OpenAi,
            local_llm_address: None,
            is_embedded_at_local: false,
            is_pubcom: false,
            enable_source_link: false,
            extraction: ExtractionConfig {
                prompt: "Extract opinions.".into(),
                workers: 2,
                limit: usize::MAX,
                properties: Vec::new(),
                categories: BTreeMap::new(),
                model: None,
            },
            embedding: EmbeddingConfig::default(),
            hierarchical_clustering: ClusteringConfig {
                cluster_nums: Some(vec![2, 4]),
                ..Default::default()
            },
            hierarchical_initial_labelling: LabellingConfig {
                prompt: "Label this cluster.".into(),
                sampling_num: 30,
                workers: 2,
                model: None,
            },
            hierarchical_merge_labelling: LabellingConfig {
                prompt: "Merge these labels.".into(),
                sampling_num: 30,
                workers: 2,
                model: None,
            },
            hierarchical_overview: OverviewConfig {
                prompt: "Summarise the clusters.".into(),
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
}
