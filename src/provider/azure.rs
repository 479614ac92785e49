//! Adapter for Azure OpenAI deployments.
//!
//! Azure routes requests to a named deployment rather than a model field,
//! authenticates with an `api-key` header, and pins an `api-version` query
//! parameter. Chat and embedding use separately configured deployments:
//! `AZURE_CHATCOMPLETION_{ENDPOINT,DEPLOYMENT_NAME,API_KEY,VERSION}` and
//! `AZURE_EMBEDDING_{ENDPOINT,DEPLOYMENT_NAME,API_KEY,VERSION}`.

use super::openai::parse_embedding_data;
use super::{
    classify_status, parse_retry_after, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse,
    Provider, ResponseBody, TokenUsage,
};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// One Azure deployment endpoint (chat or embedding).
#[derive(Clone)]
struct Deployment {
    endpoint: String,
    deployment: String,
    api_key: String,
    api_version: String,
}

impl Deployment {
    fn from_env(prefix: &str, user_api_key: Option<&str>) -> Result<Self> {
        let var = |suffix: &str| -> Result<String> {
            let name = format!("{prefix}_{suffix}");
            std::env::var(&name).map_err(|_| PipelineError::Auth {
                provider: "azure",
                message: format!("{name} is not set"),
            })
        };
        let api_key = match user_api_key {
            Some(key) => key.to_string(),
            None => var("API_KEY")?,
        };
        Ok(Self {
            endpoint: var("ENDPOINT")?.trim_end_matches('/').to_string(),
            deployment: var("DEPLOYMENT_NAME")?,
            api_key,
            api_version: var("VERSION")?,
        })
    }

    fn url(&self, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.endpoint, self.deployment, operation, self.api_version
        )
    }
}

/// Adapter for Azure-hosted OpenAI deployments.
pub struct AzureProvider {
    chat: Deployment,
    embedding: Option<Deployment>,
}

impl std::fmt::Debug for AzureProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureProvider")
            .field("chat_endpoint", &self.chat.endpoint)
            .field("chat_deployment", &self.chat.deployment)
            .field(
                "embedding_deployment",
                &self.embedding.as_ref().map(|d| d.deployment.as_str()),
            )
            .finish()
    }
}

impl AzureProvider {
    /// Build from the `AZURE_CHATCOMPLETION_*` / `AZURE_EMBEDDING_*` env
    /// vars. A missing embedding deployment is tolerated until the first
    /// embed call.
    pub fn from_env(user_api_key: Option<&str>) -> Result<Self> {
        Ok(Self {
            chat: Deployment::from_env("AZURE_CHATCOMPLETION", user_api_key)?,
            embedding: Deployment::from_env("AZURE_EMBEDDING", user_api_key).ok(),
        })
    }

    async fn post(&self, client: &Client, dep: &Deployment, url: &str, body: &Value) -> Result<Value> {
        let resp = client
            .post(url)
            .header("api-key", dep.api_key.as_str())
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status("azure", status, text, retry_after));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Provider for AzureProvider {
    async fn chat(&self, client: &Client, request: &ChatRequest) -> Result<ChatResponse> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        // The deployment decides the model; no model field in the body.
        let mut body = json!({
            "messages": messages,
            "temperature": 0,
            "n": 1,
            "seed": 0,
        });
        if let Some(format) = request.format.to_openai_value() {
            body["response_format"] = format;
        }

        let url = self.chat.url("chat/completions");
        let json_resp = self.post(client, &self.chat, &url, &body).await?;

        let text = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let usage = &json_resp["usage"];

        Ok(ChatResponse {
            body: ResponseBody::Text(text),
            usage: TokenUsage::new(
                usage["prompt_tokens"].as_u64().unwrap_or(0),
                usage["completion_tokens"].as_u64().unwrap_or(0),
                usage["total_tokens"].as_u64().unwrap_or(0),
            ),
        })
    }

    async fn embed(&self, client: &Client, request: &EmbedRequest) -> Result<EmbedResponse> {
        let dep = self.embedding.as_ref().ok_or(PipelineError::Auth {
            provider: "azure",
            message: "AZURE_EMBEDDING_* environment is not configured".into(),
        })?;

        let body = json!({"input": request.inputs});
        let url = dep.url("embeddings");
        let json_resp = self.post(client, dep, &url, &body).await?;

        let usage = &json_resp["usage"];
        Ok(EmbedResponse {
            vectors: parse_embedding_data(&json_resp),
            usage: TokenUsage::new(
                usage["prompt_tokens"].as_u64().unwrap_or(0),
                0,
                usage["total_tokens"].as_u64().unwrap_or(0),
            ),
        })
    }

    fn name(&self) -> &'static str {
        "azure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deployment() -> Deployment {
        Deployment {
            endpoint: "https://example.openai.azure.com".into(),
            deployment: "gpt-4o-mini".into(),
            api_key: "azure-key".into(),
            api_version: "2024-06-01".into(),
        }
    }

    #[test]
    fn test_deployment_url() {
        let dep = test_deployment();
        assert_eq!(
            dep.url("chat/completions"),
            "https://example.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let provider = AzureProvider {
            chat: test_deployment(),
            embedding: None,
        };
        let debug_output = format!("{:?}", provider);
        assert!(!debug_output.contains("azure-key"));
    }
}
