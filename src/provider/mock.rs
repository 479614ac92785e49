//! Mock provider for testing without a live LLM.
//!
//! [`MockProvider`] returns scripted replies in order, allowing the stage
//! and pipeline tests to run deterministically. Failure injection covers
//! the cases the retry loop and the worker pool must tolerate: rate
//! limits, authentication failures, and non-schema output.
//!
//! # Example
//!
//! ```
//! use broadlisten::provider::{MockProvider, MockReply};
//!
//! let mock = MockProvider::new(vec![MockReply::text("Hello, world!")]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, Provider, ResponseBody, TokenUsage,
};
use crate::error::Result;
use crate::PipelineError;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A plain-text body with default token usage.
    Text(String),
    /// A structured body.
    Json(Value),
    /// Fail this call with a rate-limit signal.
    RateLimited { retry_after: Option<Duration> },
    /// Fail this call with an authentication error.
    AuthError,
}

impl MockReply {
    pub fn text(body: impl Into<String>) -> Self {
        MockReply::Text(body.into())
    }

    pub fn json(body: Value) -> Self {
        MockReply::Json(body)
    }
}

type Responder = dyn Fn(&ChatRequest) -> MockReply + Send + Sync;

/// A test provider that returns scripted replies in order.
///
/// Replies cycle back to the beginning when exhausted, so a single reply
/// can serve a whole batch. A responder closure can replace the script to
/// key replies off the request content.
pub struct MockProvider {
    script: Vec<MockReply>,
    index: AtomicUsize,
    responder: Option<Arc<Responder>>,
    /// Fail this many chat calls with a rate limit before consulting the
    /// script. Models a provider that recovers after backoff.
    rate_limits_before_success: AtomicUsize,
    /// Dimensionality of the deterministic embedding vectors.
    embed_dims: usize,
    usage_per_call: TokenUsage,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("script_len", &self.script.len())
            .field("has_responder", &self.responder.is_some())
            .finish()
    }
}

impl MockProvider {
    /// Create a mock provider with the given scripted replies.
    pub fn new(script: Vec<MockReply>) -> Self {
        assert!(
            !script.is_empty(),
            "MockProvider requires at least one reply"
        );
        Self {
            script,
            index: AtomicUsize::new(0),
            responder: None,
            rate_limits_before_success: AtomicUsize::new(0),
            embed_dims: 8,
            usage_per_call: TokenUsage::new(10, 5, 15),
        }
    }

    /// A mock that always returns the same reply.
    pub fn fixed(reply: MockReply) -> Self {
        Self::new(vec![reply])
    }

    /// Key replies off the request instead of a positional script.
    pub fn with_responder<F>(f: F) -> Self
    where
        F: Fn(&ChatRequest) -> MockReply + Send + Sync + 'static,
    {
        Self {
            script: vec![MockReply::text("")],
            index: AtomicUsize::new(0),
            responder: Some(Arc::new(f)),
            rate_limits_before_success: AtomicUsize::new(0),
            embed_dims: 8,
            usage_per_call: TokenUsage::new(10, 5, 15),
        }
    }

    /// Fail the next `n` chat calls with a rate-limit error.
    pub fn rate_limited_times(self, n: usize) -> Self {
        self.rate_limits_before_success.store(n, Ordering::SeqCst);
        self
    }

    /// Override the token usage reported per successful call.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage_per_call = usage;
        self
    }

    /// Number of chat calls served so far (including injected failures).
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &ChatRequest) -> MockReply {
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        if let Some(ref responder) = self.responder {
            return responder(request);
        }
        self.script[idx % self.script.len()].clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn chat(&self, _client: &Client, request: &ChatRequest) -> Result<ChatResponse> {
        let consumed = self
            .rate_limits_before_success
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            self.index.fetch_add(1, Ordering::SeqCst);
            return Err(PipelineError::RateLimited {
                provider: "mock",
                message: "scripted rate limit".into(),
                retry_after: None,
            });
        }

        match self.next_reply(request) {
            MockReply::Text(text) => Ok(ChatResponse {
                body: ResponseBody::Text(text),
                usage: self.usage_per_call,
            }),
            MockReply::Json(value) => Ok(ChatResponse {
                body: ResponseBody::Json(value),
                usage: self.usage_per_call,
            }),
            MockReply::RateLimited { retry_after } => Err(PipelineError::RateLimited {
                provider: "mock",
                message: "scripted rate limit".into(),
                retry_after,
            }),
            MockReply::AuthError => Err(PipelineError::Auth {
                provider: "mock",
                message: "scripted auth failure".into(),
            }),
        }
    }

    /// Deterministic pseudo-embeddings: each vector is derived from a hash
    /// of the input text, so identical texts embed identically and the
    /// clustering stages have stable geometry to work with.
    async fn embed(&self, _client: &Client, request: &EmbedRequest) -> Result<EmbedResponse> {
        let vectors = request
            .inputs
            .iter()
            .map(|text| pseudo_embedding(text, self.embed_dims))
            .collect();
        Ok(EmbedResponse {
            vectors,
            usage: TokenUsage::new(request.inputs.len() as u64, 0, request.inputs.len() as u64),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// FNV-1a over the text, re-hashed per dimension, mapped into [-1, 1].
fn pseudo_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (0..dims)
        .map(|d| {
            let mut h = hash ^ (d as u64).wrapping_mul(0x9e3779b97f4a7c15);
            h ^= h >> 33;
            h = h.wrapping_mul(0xff51afd7ed558ccd);
            h ^= h >> 33;
            ((h % 2000) as f32 / 1000.0) - 1.0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ResponseFormat};

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "mock-model".into(),
            messages: vec![ChatMessage::user("hi")],
            format: ResponseFormat::Text,
        }
    }

    #[tokio::test]
    async fn test_mock_cycles_script() {
        let mock = MockProvider::new(vec![MockReply::text("first"), MockReply::text("second")]);
        let client = Client::new();
        let r1 = mock.chat(&client, &test_request()).await.unwrap();
        let r2 = mock.chat(&client, &test_request()).await.unwrap();
        let r3 = mock.chat(&client, &test_request()).await.unwrap();
        assert_eq!(r1.body.as_text(), "first");
        assert_eq!(r2.body.as_text(), "second");
        assert_eq!(r3.body.as_text(), "first");
    }

    #[tokio::test]
    async fn test_mock_rate_limits_then_succeeds() {
        let mock =
            MockProvider::fixed(MockReply::text("done")).rate_limited_times(2);
        let client = Client::new();
        assert!(mock.chat(&client, &test_request()).await.is_err());
        assert!(mock.chat(&client, &test_request()).await.is_err());
        let ok = mock.chat(&client, &test_request()).await.unwrap();
        assert_eq!(ok.body.as_text(), "done");
    }

    #[tokio::test]
    async fn test_mock_responder_keys_off_request() {
        let mock = MockProvider::with_responder(|req| {
            if req.messages.iter().any(|m| m.content.contains("C3")) {
                MockReply::text("not json at all")
            } else {
                MockReply::json(serde_json::json!({"ok": true}))
            }
        });
        let client = Client::new();

        let mut req = test_request();
        req.messages = vec![ChatMessage::user("comment C3")];
        assert_eq!(
            mock.chat(&client, &req).await.unwrap().body.as_text(),
            "not json at all"
        );
    }

    #[tokio::test]
    async fn test_mock_embeddings_deterministic() {
        let mock = MockProvider::fixed(MockReply::text(""));
        let client = Client::new();
        let req = EmbedRequest {
            model: "mock-embed".into(),
            inputs: vec!["alpha".into(), "beta".into(), "alpha".into()],
        };
        let resp = mock.embed(&client, &req).await.unwrap();
        assert_eq!(resp.vectors.len(), 3);
        assert_eq!(resp.vectors[0].len(), 8);
        assert_eq!(resp.vectors[0], resp.vectors[2]);
        assert_ne!(resp.vectors[0], resp.vectors[1]);
    }

    #[test]
    fn test_pseudo_embedding_bounded() {
        for v in pseudo_embedding("some text", 16) {
            assert!((-1.0..=1.0).contains(&v));
        }
    }
}
