//! Provider trait and normalized request/response types.
//!
//! The [`Provider`] trait abstracts over LLM vendors, translating between
//! normalized [`ChatRequest`]/[`ChatResponse`] (and the embedding
//! equivalents) and vendor-specific HTTP APIs.
//!
//! ## Architecture
//!
//! ```text
//! LlmGateway ──► ChatRequest ──► Provider::chat() ──► ChatResponse
//!                                      │
//!               ┌──────────────┬───────┴────────┬──────────────┐
//!         OpenAiCompatible   AzureProvider  GeminiProvider  MockProvider
//!         openai/openrouter  deployment +   generateContent   tests
//!         /local host:port   api-version    embedContent
//! ```
//!
//! Every successful call reports [`TokenUsage`]; providers are stateless for
//! token totals — callers accumulate.

pub mod azure;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod retry;

pub use azure::AzureProvider;
pub use gemini::GeminiProvider;
pub use mock::{MockProvider, MockReply};
pub use openai::OpenAiCompatible;
pub use retry::RetryPolicy;

use crate::config::ProviderKind;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// How many tokens were spent on prompt vs. completion.
///
/// Providers may report `total` directly; when they do not, it is the sum of
/// the two parts. Values are accumulated with [`TokenUsage::add`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, total: u64) -> Self {
        Self {
            input,
            output,
            total,
        }
    }

    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.input == 0 && self.output == 0
    }
}

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Structured-output request shape, in the OpenAI wire form.
///
/// When both a JSON flag and a schema would apply, callers construct
/// `JsonSchema` — the schema wins. Adapters that cannot express the wire
/// form natively (Gemini) rewrite it; see
/// [`gemini::normalize_response_format`].
#[derive(Debug, Clone, Default)]
pub enum ResponseFormat {
    /// Plain text completion.
    #[default]
    Text,
    /// Schemaless JSON mode (`{"type": "json_object"}`).
    JsonObject,
    /// A full JSON-schema response format
    /// (`{"type": "json_schema", "json_schema": {...}}`).
    JsonSchema(Value),
}

impl ResponseFormat {
    /// Serialize into the OpenAI `response_format` field, when one applies.
    pub fn to_openai_value(&self) -> Option<Value> {
        match self {
            ResponseFormat::Text => None,
            ResponseFormat::JsonObject => Some(serde_json::json!({"type": "json_object"})),
            ResponseFormat::JsonSchema(schema) => Some(schema.clone()),
        }
    }
}

/// A normalized chat request — provider-agnostic.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier (e.g. `"gpt-4o"`, `"gemini-2.5-flash"`,
    /// `"openai/gpt-4o-mini"` for OpenRouter).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub format: ResponseFormat,
}

/// Response payload, parsed into a tagged variant so downstream stages never
/// inspect raw provider shapes.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// Plain text (possibly containing JSON the caller will coerce).
    Text(String),
    /// Provider-parsed structured output.
    Json(Value),
}

impl ResponseBody {
    /// The raw text form, serializing `Json` losslessly.
    pub fn as_text(&self) -> String {
        match self {
            ResponseBody::Text(s) => s.clone(),
            ResponseBody::Json(v) => v.to_string(),
        }
    }
}

/// A normalized chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub body: ResponseBody,
    pub usage: TokenUsage,
}

/// A normalized embedding request.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: String,
    pub inputs: Vec<String>,
}

/// A normalized embedding response. `vectors[i]` corresponds to
/// `inputs[i]`; all vectors in one response share dimensionality.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
    pub usage: TokenUsage,
}

/// Abstraction over LLM vendors.
///
/// Implementors translate the normalized request types into the vendor's
/// HTTP API and map failures into the error taxonomy: 401/403 →
/// [`PipelineError::Auth`], 429 → [`PipelineError::RateLimited`], 4xx →
/// [`PipelineError::BadRequest`], anything else surfaces as
/// [`PipelineError::Http`].
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute a chat completion.
    async fn chat(&self, client: &Client, request: &ChatRequest) -> Result<ChatResponse>;

    /// Execute an embedding call.
    async fn embed(&self, client: &Client, request: &EmbedRequest) -> Result<EmbedResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Build the provider adapter for a configured vendor.
///
/// `user_api_key` (from `USER_API_KEY`) overrides the per-vendor key
/// environment variables.
pub fn provider_for(
    kind: ProviderKind,
    local_address: Option<&str>,
    user_api_key: Option<&str>,
) -> Result<Arc<dyn Provider>> {
    let key_or_env = |var: &str| -> Option<String> {
        user_api_key
            .map(str::to_string)
            .or_else(|| std::env::var(var).ok())
    };

    match kind {
        ProviderKind::OpenAi => {
            let key = key_or_env("OPENAI_API_KEY").ok_or(PipelineError::Auth {
                provider: "openai",
                message: "OPENAI_API_KEY is not set".into(),
            })?;
            Ok(Arc::new(OpenAiCompatible::openai(key)))
        }
        ProviderKind::OpenRouter => {
            let key = key_or_env("OPENROUTER_API_KEY").ok_or(PipelineError::Auth {
                provider: "openrouter",
                message: "OPENROUTER_API_KEY is not set".into(),
            })?;
            Ok(Arc::new(OpenAiCompatible::openrouter(key)))
        }
        ProviderKind::Local => {
            let address = local_address.unwrap_or("localhost:11434");
            Ok(Arc::new(OpenAiCompatible::local(address)))
        }
        ProviderKind::Azure => Ok(Arc::new(AzureProvider::from_env(user_api_key)?)),
        ProviderKind::Gemini => {
            let key = key_or_env("GEMINI_API_KEY").ok_or(PipelineError::Auth {
                provider: "gemini",
                message: "GEMINI_API_KEY is not set".into(),
            })?;
            Ok(Arc::new(GeminiProvider::new(key)))
        }
    }
}

/// Parse a `Retry-After` header value as whole seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

/// Map a non-success HTTP status into the error taxonomy.
pub(crate) fn classify_status(
    provider: &'static str,
    status: u16,
    body: String,
    retry_after: Option<std::time::Duration>,
) -> PipelineError {
    match status {
        401 | 403 => PipelineError::Auth {
            provider,
            message: body,
        },
        429 => PipelineError::RateLimited {
            provider,
            message: body,
            retry_after,
        },
        400 | 404 | 422 => PipelineError::BadRequest {
            provider,
            message: body,
        },
        _ => PipelineError::Http { status, body },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_add() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage::new(10, 5, 15));
        total.add(&TokenUsage::new(1, 2, 3));
        assert_eq!(total, TokenUsage::new(11, 7, 18));
    }

    #[test]
    fn test_response_format_openai_wire() {
        assert!(ResponseFormat::Text.to_openai_value().is_none());
        assert_eq!(
            ResponseFormat::JsonObject.to_openai_value().unwrap()["type"],
            "json_object"
        );
        let schema = serde_json::json!({"type": "json_schema", "json_schema": {"schema": {}}});
        assert_eq!(
            ResponseFormat::JsonSchema(schema.clone())
                .to_openai_value()
                .unwrap(),
            schema
        );
    }

    #[test]
    fn test_classify_status_auth() {
        let err = classify_status("openai", 401, "nope".into(), None);
        assert!(matches!(err, PipelineError::Auth { .. }));
    }

    #[test]
    fn test_classify_status_rate_limit_keeps_hint() {
        let err = classify_status(
            "openai",
            429,
            "limited".into(),
            Some(std::time::Duration::from_secs(12)),
        );
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(12)));
    }

    #[test]
    fn test_classify_status_bad_request() {
        let err = classify_status("local", 400, "bad schema".into(), None);
        assert!(matches!(err, PipelineError::BadRequest { .. }));
    }

    #[test]
    fn test_classify_status_other_surfaces() {
        let err = classify_status("openai", 503, "down".into(), None);
        assert!(matches!(err, PipelineError::Http { status: 503, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(
            parse_retry_after("30"),
            Some(std::time::Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
