//! Backend for Ollama's native API.
//!
//! Prompts go to `/api/generate`, message lists to `/api/chat`. The output
//! schema, when present, is forwarded as Ollama's `format` so the server
//! constrains decoding. Streaming responses are NDJSON with one token per
//! line and are exposed as a lazy fragment stream.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};

use super::{Backend, BackendInput};
use crate::error::{LmError, Result};
use crate::response::Response;
use crate::streaming::NdjsonDecoder;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Backend for a local or remote Ollama server.
///
/// # Example
///
/// ```
/// use lm_functions::OllamaBackend;
///
/// let backend = OllamaBackend::new("http://localhost:11434", "llama3.2")
///     .with_stream(true)
///     .with_options(serde_json::json!({"temperature": 0.2}));
/// ```
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
    stream: bool,
    options: Option<Value>,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            stream: false,
            options: None,
        }
    }

    /// Read `OLLAMA_HOST` and `OLLAMA_MODEL`, falling back to the local
    /// default server and model.
    pub fn from_env() -> Self {
        let base_url = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into());
        Self::new(base_url, model)
    }

    /// Set the HTTP client. Cheap to clone, so share one across backends.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Request streamed NDJSON instead of a single JSON body.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Ollama `options` object (temperature, num_predict, seed, ...).
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Endpoint path and JSON body for `input`.
    fn build_request(&self, input: &BackendInput, schema: Option<&Value>) -> (&'static str, Value) {
        let (path, mut body) = match input {
            BackendInput::Prompt(prompt) => (
                "/api/generate",
                json!({"model": self.model, "prompt": prompt, "stream": self.stream}),
            ),
            BackendInput::Messages(messages) => (
                "/api/chat",
                json!({"model": self.model, "messages": messages, "stream": self.stream}),
            ),
        };
        if let Some(ref options) = self.options {
            body["options"] = options.clone();
        }
        if let Some(schema) = schema {
            body["format"] = schema.clone();
        }
        (path, body)
    }

    /// Completion text carried by one generate or chat payload.
    fn token(value: &Value) -> Option<&str> {
        value
            .get("response")
            .or_else(|| value.get("message").and_then(|m| m.get("content")))
            .and_then(Value::as_str)
    }
}

struct StreamState {
    bytes: BoxStream<'static, std::result::Result<Vec<u8>, reqwest::Error>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<String>>,
    finished: bool,
    failed: bool,
}

impl StreamState {
    fn push(&mut self, value: &Value) {
        if self.failed {
            return;
        }
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            self.pending.push_back(Err(LmError::Backend {
                backend: "ollama".into(),
                message: error.to_string(),
            }));
            self.failed = true;
            self.finished = true;
            return;
        }
        match OllamaBackend::token(value) {
            Some(token) if !token.is_empty() => self.pending.push_back(Ok(token.to_string())),
            _ => {}
        }
    }

    async fn next_fragment(mut self) -> Option<(Result<String>, Self)> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some((item, self));
            }
            if self.finished {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    for value in self.decoder.decode(&chunk) {
                        self.push(&value);
                    }
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some((Err(LmError::Request(err)), self));
                }
                None => {
                    self.finished = true;
                    if let Some(value) = self.decoder.flush() {
                        self.push(&value);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn invoke(&self, input: &BackendInput, schema: Option<&Value>) -> Result<Response> {
        let (path, body) = self.build_request(input, schema);
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        tracing::debug!(url = %url, model = %self.model, stream = self.stream, "invoking ollama");

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if !self.stream {
            let payload: Value = resp.json().await?;
            if let Some(error) = payload.get("error").and_then(Value::as_str) {
                return Err(LmError::Backend {
                    backend: "ollama".into(),
                    message: error.to_string(),
                });
            }
            let text = Self::token(&payload).unwrap_or_default().to_string();
            return Ok(Response::from_text(text));
        }

        let state = StreamState {
            bytes: resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
            decoder: NdjsonDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
            failed: false,
        };
        Ok(Response::from_stream(stream::unfold(state, StreamState::next_fragment)))
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }
}
