//! The LLM gateway: a provider-agnostic facade for chat and embedding.
//!
//! [`LlmGateway`] owns the HTTP client, the provider adapter, and the retry
//! policy. Stages call [`LlmGateway::chat_parsed`] for schema-coerced
//! structured output and [`LlmGateway::embed`] for vectors; both return the
//! provider's token usage for the caller to accumulate — the gateway itself
//! holds no token totals.

use crate::coerce;
use crate::error::Result;
use crate::provider::{
    retry::with_retry, ChatMessage, ChatRequest, ChatResponse, EmbedRequest, Provider,
    ResponseBody, ResponseFormat, RetryPolicy, TokenUsage,
};
use crate::PipelineError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tiktoken_rs::CoreBPE;

/// Embedding inputs above this many tokens are truncated to the head.
const EMBED_TRUNCATE_TOKENS: usize = 8_000;
/// Truncation budget for the local embedding path.
const EMBED_TRUNCATE_TOKENS_LOCAL: usize = 128;

static EMBED_TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn embed_tokenizer() -> Option<&'static CoreBPE> {
    EMBED_TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!("tokenizer unavailable, falling back to item batching: {e}");
                None
            }
        })
        .as_ref()
}

/// Count tokens in a text; `None` when no tokenizer is available.
pub fn count_tokens(text: &str) -> Option<usize> {
    embed_tokenizer().map(|bpe| bpe.encode_ordinary(text).len())
}

/// Truncate a text to its first `budget` tokens. Returns the input
/// unchanged when it fits or no tokenizer is available.
fn truncate_tokens(text: &str, budget: usize) -> String {
    let Some(bpe) = embed_tokenizer() else {
        return text.to_string();
    };
    let tokens = bpe.encode_ordinary(text);
    if tokens.len() <= budget {
        return text.to_string();
    }
    tracing::warn!(
        tokens = tokens.len(),
        budget,
        "embedding input exceeds the token budget, truncating to the head"
    );
    bpe.decode(tokens[..budget].to_vec())
        .unwrap_or_else(|_| text.chars().take(budget * 4).collect())
}

/// A coerced chat outcome: the tagged body plus its token usage.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub body: ResponseBody,
    pub usage: TokenUsage,
}

impl ChatOutcome {
    /// Coerce the body into a typed record, stripping reasoning wrappers
    /// before re-parsing when the text form is not valid JSON.
    pub fn coerce<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.body {
            ResponseBody::Json(value) => {
                serde_json::from_value(value.clone()).map_err(|e| {
                    PipelineError::Parse(format!("structured body did not match schema: {e}"))
                })
            }
            ResponseBody::Text(text) => coerce::parse_as(text),
        }
    }

    pub fn text(&self) -> String {
        self.body.as_text()
    }
}

/// Provider-agnostic chat + embedding facade with retry and coercion.
pub struct LlmGateway {
    client: Client,
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
    chat_model: String,
    embedding_model: String,
    embed_locally: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("provider", &self.provider.name())
            .field("chat_model", &self.chat_model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

impl LlmGateway {
    pub fn new(
        provider: Arc<dyn Provider>,
        policy: RetryPolicy,
        chat_model: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            provider,
            policy,
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            embed_locally: false,
            cancel: None,
        }
    }

    /// Route embedding through the local single-batch path with the short
    /// truncation budget.
    pub fn with_local_embedding(mut self, local: bool) -> Self {
        self.embed_locally = local;
        self
    }

    /// Attach a cancellation flag checked between retry attempts.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    /// Whether embedding inputs go through the local path.
    pub fn embeds_locally(&self) -> bool {
        self.embed_locally
    }

    /// Send a chat request with the default model, retrying rate limits.
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        format: ResponseFormat,
    ) -> Result<ChatOutcome> {
        self.chat_with_model(&self.chat_model.clone(), messages, format)
            .await
    }

    /// Send a chat request against an explicit model.
    pub async fn chat_with_model(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        format: ResponseFormat,
    ) -> Result<ChatOutcome> {
        let request = ChatRequest {
            model: model.to_string(),
            messages,
            format,
        };

        let response: ChatResponse = with_retry(
            &self.policy,
            self.cancel.as_deref(),
            || self.provider.chat(&self.client, &request),
        )
        .await?;

        Ok(ChatOutcome {
            body: response.body,
            usage: response.usage,
        })
    }

    /// Chat with a JSON-schema response format and coerce into `T`.
    pub async fn chat_parsed<T: DeserializeOwned>(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        schema: Value,
    ) -> Result<(T, TokenUsage)> {
        let outcome = self
            .chat_with_model(model, messages, ResponseFormat::JsonSchema(schema))
            .await?;
        let parsed = outcome.coerce::<T>()?;
        Ok((parsed, outcome.usage))
    }

    /// Embed a batch of texts, preprocessing each input to the provider's
    /// token budget. Output order matches input order.
    pub async fn embed(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, TokenUsage)> {
        let budget = if self.embed_locally {
            EMBED_TRUNCATE_TOKENS_LOCAL
        } else {
            EMBED_TRUNCATE_TOKENS
        };
        let inputs: Vec<String> = texts.iter().map(|t| truncate_tokens(t, budget)).collect();

        let request = EmbedRequest {
            model: self.embedding_model.clone(),
            inputs,
        };

        let response = with_retry(&self.policy, self.cancel.as_deref(), || {
            self.provider.embed(&self.client, &request)
        })
        .await?;

        if response.vectors.len() != texts.len() {
            return Err(PipelineError::Other(format!(
                "provider returned {} vectors for {} inputs",
                response.vectors.len(),
                texts.len()
            )));
        }

        Ok((response.vectors, response.usage))
    }
}

/// Build the OpenAI wire-form schema wrapper the gateway sends for
/// structured output.
pub fn json_schema_format(name: &str, schema: Value) -> Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": name,
            "strict": true,
            "schema": schema,
        },
    })
}
