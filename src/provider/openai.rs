//! Adapter for OpenAI-compatible APIs.
//!
//! [`OpenAiCompatible`] covers three configured vendors with one wire
//! format: OpenAI itself, OpenRouter (model strings are `<vendor>/<name>`),
//! and local OpenAI-compatible servers (Ollama, LM Studio) at `host:port`.
//!
//! Endpoints: `/chat/completions` and `/embeddings` under the base URL.

use super::{
    classify_status, parse_retry_after, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse,
    Provider, ResponseBody, TokenUsage,
};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Adapter for any OpenAI-compatible API, parametrised by base URL.
#[derive(Clone)]
pub struct OpenAiCompatible {
    base_url: String,
    /// If set, sent as `Authorization: Bearer {key}`. Local servers need none.
    api_key: Option<String>,
    name: &'static str,
}

impl std::fmt::Debug for OpenAiCompatible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatible")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .field("name", &self.name)
            .finish()
    }
}

impl OpenAiCompatible {
    /// api.openai.com with a bearer key.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: Some(api_key.into()),
            name: "openai",
        }
    }

    /// openrouter.ai proxy; model strings carry the vendor prefix.
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key: Some(api_key.into()),
            name: "openrouter",
        }
    }

    /// A local OpenAI-compatible server at `host:port` (default port 11434).
    pub fn local(address: &str) -> Self {
        let (host, port) = split_address(address);
        Self {
            base_url: format!("http://{}:{}/v1", host, port),
            api_key: None,
            name: "local",
        }
    }

    /// Any other OpenAI-compatible endpoint.
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: Option<String>,
        name: &'static str,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            name,
        }
    }

    fn build_body(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": 0,
            "n": 1,
            "seed": 0,
        });
        if let Some(format) = request.format.to_openai_value() {
            body["response_format"] = format;
        }
        body
    }

    fn build_http_request(&self, client: &Client, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    async fn check_status(&self, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(self.name, status, text, retry_after));
        }
        Ok(resp.json().await?)
    }

    fn extract_usage(json_resp: &Value) -> TokenUsage {
        let usage = &json_resp["usage"];
        TokenUsage::new(
            usage["prompt_tokens"].as_u64().unwrap_or(0),
            usage["completion_tokens"].as_u64().unwrap_or(0),
            usage["total_tokens"].as_u64().unwrap_or(0),
        )
    }
}

/// Split a `host:port` address, defaulting the port to 11434.
pub(crate) fn split_address(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => {
                tracing::warn!(address, "invalid address format, using default");
                ("localhost".to_string(), 11434)
            }
        },
        None => (address.to_string(), 11434),
    }
}

#[async_trait]
impl Provider for OpenAiCompatible {
    async fn chat(&self, client: &Client, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(request);

        let resp = self.build_http_request(client, &url, &body).send().await?;
        let json_resp = self.check_status(resp).await?;

        let text = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(ChatResponse {
            body: ResponseBody::Text(text),
            usage: Self::extract_usage(&json_resp),
        })
    }

    async fn embed(&self, client: &Client, request: &EmbedRequest) -> Result<EmbedResponse> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": request.model,
            "input": request.inputs,
        });

        let resp = self.build_http_request(client, &url, &body).send().await?;
        let json_resp = self.check_status(resp).await?;

        let vectors = parse_embedding_data(&json_resp);

        Ok(EmbedResponse {
            vectors,
            usage: Self::extract_usage(&json_resp),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Pull `data[*].embedding` out of an OpenAI-style embeddings response,
/// ordered by the `index` field when present.
pub(crate) fn parse_embedding_data(json_resp: &Value) -> Vec<Vec<f32>> {
    let Some(data) = json_resp["data"].as_array() else {
        return Vec::new();
    };
    let mut rows: Vec<(usize, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let idx = item["index"].as_u64().map(|v| v as usize).unwrap_or(i);
            let vector = item["embedding"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                .unwrap_or_default();
            (idx, vector)
        })
        .collect();
    rows.sort_by_key(|(idx, _)| *idx);
    rows.into_iter().map(|(_, v)| v).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ResponseFormat};

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![
                ChatMessage::system("You extract opinions."),
                ChatMessage::user("Why is the sky blue?"),
            ],
            format: ResponseFormat::Text,
        }
    }

    #[test]
    fn test_chat_body_shape() {
        let body = OpenAiCompatible::build_body(&test_request());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0);
        assert_eq!(body["seed"], 0);

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_chat_body_json_mode() {
        let mut request = test_request();
        request.format = ResponseFormat::JsonObject;
        let body = OpenAiCompatible::build_body(&request);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_chat_body_schema_wins() {
        let mut request = test_request();
        request.format = ResponseFormat::JsonSchema(json!({
            "type": "json_schema",
            "json_schema": {"name": "Reply", "schema": {"type": "object"}}
        }));
        let body = OpenAiCompatible::build_body(&request);
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[test]
    fn test_auth_header_present() {
        let provider = OpenAiCompatible::openai("sk-test123");
        let client = Client::new();
        let req = provider
            .build_http_request(&client, "https://api.openai.com/v1/chat/completions", &json!({}))
            .build()
            .expect("build request");
        assert_eq!(
            req.headers().get("Authorization").expect("auth"),
            "Bearer sk-test123"
        );
    }

    #[test]
    fn test_local_has_no_auth_header() {
        let provider = OpenAiCompatible::local("127.0.0.1:1234");
        let client = Client::new();
        let req = provider
            .build_http_request(&client, "http://127.0.0.1:1234/v1/chat/completions", &json!({}))
            .build()
            .expect("build request");
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("localhost:1234"), ("localhost".into(), 1234));
        assert_eq!(split_address("remotebox"), ("remotebox".into(), 11434));
        assert_eq!(split_address("host:notaport"), ("localhost".into(), 11434));
    }

    #[test]
    fn test_local_base_url() {
        let provider = OpenAiCompatible::local("127.0.0.1:1234");
        assert_eq!(provider.base_url, "http://127.0.0.1:1234/v1");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let provider = OpenAiCompatible::openai("sk-1234567890abcdef");
        let debug_output = format!("{:?}", provider);
        assert!(!debug_output.contains("1234567890abcdef"));
        assert!(debug_output.contains("sk-123"));
    }

    #[test]
    fn test_parse_embedding_data_ordering() {
        let resp = json!({
            "data": [
                {"index": 1, "embedding": [3.0, 4.0]},
                {"index": 0, "embedding": [1.0, 2.0]},
            ]
        });
        let vectors = parse_embedding_data(&resp);
        assert_eq!(vectors, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_extract_usage() {
        let resp = json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}});
        let usage = OpenAiCompatible::extract_usage(&resp);
        assert_eq!(usage, TokenUsage::new(7, 3, 10));
    }
}
