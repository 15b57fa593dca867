//! Backend trait and the input it receives.
//!
//! The [`Backend`] trait abstracts over completion providers. A language
//! function hands it either a rendered prompt or a list of chat messages,
//! plus the declared output schema, and gets back a [`Response`] that may
//! still be streaming.
//!
//! ## Architecture
//!
//! ```text
//! LanguageFunction ──► BackendInput ──► Backend::invoke() ──► Response
//!                                              │
//!                                   ┌──────────┴──────────┐
//!                              OllamaBackend          MockBackend
//!                             /api/generate        canned responses
//!                             /api/chat
//!                             NDJSON streaming
//! ```

pub mod mock;
pub mod ollama;

pub use mock::{Chunking, MockBackend};
pub use ollama::OllamaBackend;

use crate::error::Result;
use crate::message::Message;
use crate::response::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a backend is asked to complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendInput {
    /// A rendered metaprompt.
    Prompt(String),
    /// Chat messages passed through without templating.
    Messages(Vec<Message>),
}

impl BackendInput {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn as_prompt(&self) -> Option<&str> {
        match self {
            BackendInput::Prompt(p) => Some(p),
            BackendInput::Messages(_) => None,
        }
    }
}

/// Abstraction over completion providers.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start a completion. `schema` is the JSON Schema the output must
    /// follow, when the function declares one.
    async fn invoke(&self, input: &BackendInput, schema: Option<&Value>) -> Result<Response>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Model identifier, if the backend has one.
    fn model(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_input_values() {
        assert_eq!(BackendInput::Prompt("p".into()).to_value(), json!("p"));
        let messages = BackendInput::Messages(vec![Message::user("hi")]);
        assert_eq!(messages.to_value(), json!([{"role": "user", "content": "hi"}]));
        assert_eq!(messages.as_prompt(), None);
    }
}
