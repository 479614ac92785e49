//! Adapter for the native Google Gemini (Generative Language) API.
//!
//! Gemini differs from the OpenAI wire format in three ways this adapter
//! owns:
//! - messages become `system_instruction` + `contents` with `user`/`model`
//!   roles;
//! - the OpenAI `response_format` wrapper is rewritten into a
//!   `generationConfig`: `{"type":"json_object"}` becomes schemaless JSON
//!   mode, `{"type":"json_schema", ...}` is unwrapped to the bare schema,
//!   and every `title` key is stripped recursively;
//! - rate-limit errors may carry a `retry_delay` detail, surfaced on the
//!   error so the retry loop can honour it as a floor.

use super::{
    classify_status, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, Provider,
    ResponseBody, ResponseFormat, Role, TokenUsage,
};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Fallback when a job configured an OpenAI embedding model name but routes
/// through Gemini.
const GEMINI_EMBEDDING_MODEL: &str = "gemini-embedding-001";
const OPENAI_EMBEDDING_ALIASES: [&str; 2] = ["text-embedding-3-large", "text-embedding-3-small"];

/// Adapter for Gemini chat and embedding endpoints.
#[derive(Clone)]
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Point at a different endpoint (tests, regional proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_body(request: &ChatRequest) -> Value {
        let system_instruction: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::User { "user" } else { "model" };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({"contents": contents});
        if !system_instruction.is_empty() {
            body["system_instruction"] = json!({"parts": [{"text": system_instruction}]});
        }
        if let Some(generation_config) = generation_config_for(&request.format) {
            body["generationConfig"] = generation_config;
        }
        body
    }

    async fn post(&self, client: &Client, url: &str, body: &Value) -> Result<Value> {
        let resp = client.post(url).json(body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            let retry_after = extract_retry_delay(&text);
            return Err(classify_status("gemini", status, text, retry_after));
        }
        Ok(resp.json().await?)
    }
}

/// Translate the OpenAI-form [`ResponseFormat`] into a Gemini
/// `generationConfig`.
pub(crate) fn generation_config_for(format: &ResponseFormat) -> Option<Value> {
    match format {
        ResponseFormat::Text => None,
        ResponseFormat::JsonObject => Some(json!({"response_mime_type": "application/json"})),
        ResponseFormat::JsonSchema(wire) => {
            let mut config = json!({"response_mime_type": "application/json"});
            if let Some(schema) = normalize_response_format(wire) {
                config["response_schema"] = schema;
            }
            Some(config)
        }
    }
}

/// Unwrap an OpenAI `response_format` value into a bare Gemini schema.
///
/// `{"type":"json_object"}` yields `None` (schemaless JSON mode).
/// `{"type":"json_schema","json_schema":{...}}` is unwrapped — an inner
/// `schema` key is entered, `name`/`strict` metadata is dropped. A value
/// that is already a bare schema passes through. `title` keys are removed
/// recursively in every case.
pub(crate) fn normalize_response_format(wire: &Value) -> Option<Value> {
    let obj = wire.as_object()?;

    if obj.get("type").and_then(Value::as_str) == Some("json_object") {
        return None;
    }

    let mut schema = if obj.get("type").and_then(Value::as_str) == Some("json_schema") {
        let mut inner = obj.get("json_schema")?.clone();
        if let Some(wrapped) = inner.get("schema") {
            inner = wrapped.clone();
        }
        if let Some(map) = inner.as_object_mut() {
            map.remove("name");
            map.remove("strict");
        }
        inner
    } else {
        wire.clone()
    };

    strip_title_keys(&mut schema);
    Some(schema)
}

/// Recursively remove `title` keys, which Gemini's schema validator rejects.
fn strip_title_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("title");
            for child in map.values_mut() {
                strip_title_keys(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_title_keys(item);
            }
        }
        _ => {}
    }
}

/// Pull a `retry_delay` / `retryDelay` hint out of a Gemini error body.
/// Formats seen in the wild: `"7s"`, `"7"`, or a bare integer.
pub(crate) fn extract_retry_delay(body: &str) -> Option<Duration> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let details = parsed["error"]["details"].as_array()?;
    for detail in details {
        let hint = detail
            .get("retryDelay")
            .or_else(|| detail.get("retry_delay"))
            .or_else(|| detail["metadata"].get("retry_delay"));
        if let Some(hint) = hint {
            let secs = match hint {
                Value::String(s) => s.trim_end_matches('s').parse::<u64>().ok()?,
                Value::Number(n) => n.as_u64()?,
                _ => continue,
            };
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

/// Concatenate `candidates[0].content.parts[*].text`.
fn extract_text(json_resp: &Value) -> String {
    json_resp["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .concat()
        })
        .unwrap_or_default()
}

fn extract_usage(json_resp: &Value) -> TokenUsage {
    let usage = &json_resp["usageMetadata"];
    TokenUsage::new(
        usage["promptTokenCount"].as_u64().unwrap_or(0),
        usage["candidatesTokenCount"].as_u64().unwrap_or(0),
        usage["totalTokenCount"].as_u64().unwrap_or(0),
    )
}

/// Replace OpenAI embedding model names (or an empty name) with the Gemini
/// default.
pub(crate) fn resolve_embedding_model(model: &str) -> &str {
    if model.is_empty() || OPENAI_EMBEDDING_ALIASES.contains(&model) {
        GEMINI_EMBEDDING_MODEL
    } else {
        model
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn chat(&self, client: &Client, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );
        let body = Self::build_body(request);
        let json_resp = self.post(client, &url, &body).await?;

        Ok(ChatResponse {
            body: ResponseBody::Text(extract_text(&json_resp)),
            usage: extract_usage(&json_resp),
        })
    }

    async fn embed(&self, client: &Client, request: &EmbedRequest) -> Result<EmbedResponse> {
        let model = resolve_embedding_model(&request.model);
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, model, self.api_key
        );

        // embedContent takes one input per call.
        let mut vectors = Vec::with_capacity(request.inputs.len());
        for text in &request.inputs {
            let body = json!({"content": {"parts": [{"text": text}]}});
            let json_resp = self.post(client, &url, &body).await?;
            let vector: Vec<f32> = json_resp["embedding"]["values"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                .unwrap_or_default();
            vectors.push(vector);
        }

        // embedContent reports no usage metadata.
        Ok(EmbedResponse {
            vectors,
            usage: TokenUsage::default(),
        })
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn test_build_body_splits_system_instruction() {
        let request = ChatRequest {
            model: "gemini-2.5-flash".into(),
            messages: vec![
                ChatMessage::system("Summarise opinions."),
                ChatMessage::user("Here they are."),
            ],
            format: ResponseFormat::Text,
        };
        let body = GeminiProvider::build_body(&request);
        assert_eq!(
            body["system_instruction"]["parts"][0]["text"],
            "Summarise opinions."
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
    }

    #[test]
    fn test_normalize_json_object_means_schemaless() {
        let wire = json!({"type": "json_object"});
        assert!(normalize_response_format(&wire).is_none());
    }

    #[test]
    fn test_normalize_unwraps_json_schema_wrapper() {
        let wire = json!({
            "type": "json_schema",
            "json_schema": {
                "name": "Reply",
                "strict": true,
                "schema": {
                    "type": "object",
                    "title": "Reply",
                    "properties": {
                        "label": {"type": "string", "title": "Label"}
                    }
                }
            }
        });
        let schema = normalize_response_format(&wire).unwrap();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("title").is_none());
        assert!(schema.get("name").is_none());
        assert!(schema.get("strict").is_none());
        assert!(schema["properties"]["label"].get("title").is_none());
    }

    #[test]
    fn test_normalize_bare_schema_passthrough() {
        let wire = json!({"type": "object", "properties": {"x": {"type": "number", "title": "X"}}});
        let schema = normalize_response_format(&wire).unwrap();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["x"].get("title").is_none());
    }

    #[test]
    fn test_generation_config_json_mode() {
        let config = generation_config_for(&ResponseFormat::JsonObject).unwrap();
        assert_eq!(config["response_mime_type"], "application/json");
        assert!(config.get("response_schema").is_none());
    }

    #[test]
    fn test_extract_retry_delay_string_form() {
        let body = json!({
            "error": {
                "code": 429,
                "status": "RESOURCE_EXHAUSTED",
                "details": [{"retryDelay": "7s"}]
            }
        })
        .to_string();
        assert_eq!(extract_retry_delay(&body), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_extract_retry_delay_metadata_form() {
        let body = json!({
            "error": {"details": [{"metadata": {"retry_delay": 11}}]}
        })
        .to_string();
        assert_eq!(extract_retry_delay(&body), Some(Duration::from_secs(11)));
    }

    #[test]
    fn test_extract_retry_delay_absent() {
        assert_eq!(extract_retry_delay("not json"), None);
        assert_eq!(extract_retry_delay("{\"error\":{}}"), None);
    }

    #[test]
    fn test_extract_text_concatenates_parts() {
        let resp = json!({
            "candidates": [{"content": {"parts": [{"text": "Hello "}, {"text": "world"}]}}]
        });
        assert_eq!(extract_text(&resp), "Hello world");
    }

    #[test]
    fn test_resolve_embedding_model() {
        assert_eq!(
            resolve_embedding_model("text-embedding-3-large"),
            "gemini-embedding-001"
        );
        assert_eq!(resolve_embedding_model(""), "gemini-embedding-001");
        assert_eq!(
            resolve_embedding_model("gemini-embedding-exp"),
            "gemini-embedding-exp"
        );
    }

    #[test]
    fn test_extract_usage() {
        let resp = json!({
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 4, "totalTokenCount": 16}
        });
        assert_eq!(extract_usage(&resp), TokenUsage::new(12, 4, 16));
    }
}
