//! Mock backend for testing without a live model.
//!
//! [`MockBackend`] returns pre-configured responses in order, allowing
//! deterministic tests of the whole call pipeline.
//!
//! # Example
//!
//! ```
//! use lm_functions::backend::{Chunking, MockBackend};
//!
//! let mock = MockBackend::new(vec![r#"{"output": 42}"#.to_string()])
//!     .with_chunking(Chunking::Tokens);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Backend, BackendInput};
use crate::error::{LmError, Result};
use crate::response::Response;

/// How a canned response is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Chunking {
    /// As a completed text (processed character by character).
    #[default]
    Whole,
    /// As a stream of single characters.
    Chars,
    /// As a stream of fixed-size character chunks.
    Fixed(usize),
    /// As a stream split after each whitespace run.
    Tokens,
}

impl Chunking {
    fn split(self, text: &str) -> Vec<String> {
        match self {
            Chunking::Whole => vec![text.to_string()],
            Chunking::Chars => text.chars().map(String::from).collect(),
            Chunking::Fixed(n) => {
                let chars: Vec<char> = text.chars().collect();
                chars.chunks(n.max(1)).map(|c| c.iter().collect()).collect()
            }
            Chunking::Tokens => {
                let mut out = Vec::new();
                let mut current = String::new();
                let mut in_space = false;
                for ch in text.chars() {
                    if in_space && !ch.is_whitespace() {
                        out.push(std::mem::take(&mut current));
                    }
                    in_space = ch.is_whitespace();
                    current.push(ch);
                }
                if !current.is_empty() {
                    out.push(current);
                }
                out
            }
        }
    }
}

/// A test backend that returns canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
/// Can be told to fail its first N invocations, or every invocation.
#[derive(Debug)]
pub struct MockBackend {
    responses: Vec<String>,
    index: AtomicUsize,
    calls: AtomicUsize,
    chunking: Chunking,
    fail_first: usize,
    inputs: Mutex<Vec<BackendInput>>,
}

impl MockBackend {
    /// Create a mock backend with the given canned responses.
    ///
    /// Responses are returned in order. When exhausted, cycles from the
    /// beginning. An empty list makes every call fail.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            index: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            chunking: Chunking::Whole,
            fail_first: 0,
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Create a mock whose every invocation fails.
    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }

    /// Fail the first `n` invocations before serving responses.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Number of invocations so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every input received, in order.
    pub fn inputs(&self) -> Vec<BackendInput> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn next_response(&self) -> Option<String> {
        if self.responses.is_empty() {
            return None;
        }
        let idx = self.index.fetch_add(1, Ordering::SeqCst) % self.responses.len();
        Some(self.responses[idx].clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn invoke(&self, input: &BackendInput, _schema: Option<&Value>) -> Result<Response> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input.clone());
        }
        let failure = || LmError::Backend {
            backend: "mock".into(),
            message: format!("mock invocation {} failed", call + 1),
        };
        if call < self.fail_first {
            return Err(failure());
        }
        let text = self.next_response().ok_or_else(failure)?;
        Ok(match self.chunking {
            Chunking::Whole => Response::from_text(text),
            other => Response::from_fragments(other.split(&text)),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> Option<&str> {
        Some("mock")
    }
}
