//! Backend responses and the incremental brace-depth parser.
//!
//! A [`Response`] wraps either a completed text or a lazy stream of
//! fragments. [`Response::process`] consumes that source once, firing a
//! callback per fragment, and turns the accumulated text into a value:
//!
//! - When the schema's `type` is `"object"`, fragments are only kept from
//!   the first `{` onward. Brace depth is tracked textually and the buffer
//!   is decoded as soon as depth returns to zero. A span that fails to
//!   decode is discarded and scanning resumes at the next `{`.
//! - Otherwise every fragment is kept.
//!
//! Braces inside JSON string literals are counted like any other brace, so
//! a quoted `{` or `}` inside the object corrupts depth tracking.

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{LmError, Result};
use crate::message::{Message, Role};

/// Per-fragment data handed to the `on_fragment` callback.
///
/// `depth` and `in_json` are the parser state *before* this fragment
/// was applied.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub token_or_char: &'a str,
    pub depth: i64,
    pub in_json: bool,
    pub open_braces: usize,
    pub closed_braces: usize,
    pub json_object: bool,
}

enum Source {
    Complete(String),
    Stream(BoxStream<'static, Result<String>>),
}

/// A backend's answer: a completed text or a single-pass fragment stream.
pub struct Response {
    role: Role,
    source: Option<Source>,
    text: String,
}

impl Response {
    /// A fully materialized completion, processed one character at a time.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::with_source(Source::Complete(text.into()))
    }

    /// A completion delivered as a fixed sequence of fragments.
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments: Vec<Result<String>> = fragments.into_iter().map(|s| Ok(s.into())).collect();
        Self::from_stream(stream::iter(fragments))
    }

    /// A live fragment stream, e.g. tokens arriving over HTTP.
    pub fn from_stream<S>(fragments: S) -> Self
    where
        S: futures::Stream<Item = Result<String>> + Send + 'static,
    {
        Self::with_source(Source::Stream(fragments.boxed()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            role: Role::Assistant,
            source: Some(source),
            text: String::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Text accumulated by [`process`](Self::process) so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Alias of [`text`](Self::text).
    pub fn content(&self) -> &str {
        &self.text
    }

    pub fn into_message(self) -> Message {
        Message::new(self.role, self.text)
    }

    /// Consume the source and produce the parsed value.
    ///
    /// Idempotent: once text has been accumulated, later calls decode the
    /// cached text and never touch the source again. If `cancel` trips
    /// between fragments, returns [`LmError::Interrupted`] carrying the
    /// partial text.
    pub async fn process(
        &mut self,
        schema: Option<&Value>,
        cancel: Option<&AtomicBool>,
        on_fragment: &mut (dyn FnMut(&Fragment<'_>) -> Result<()> + Send),
    ) -> Result<Value> {
        if !self.text.is_empty() {
            return self.finalize(schema);
        }

        let json_object = schema
            .and_then(|s| s.get("type"))
            .and_then(Value::as_str)
            == Some("object");
        let mut state = ParserState::new(json_object);

        match self.source.take() {
            Some(Source::Complete(full)) => {
                let mut buf = [0u8; 4];
                for ch in full.chars() {
                    check_cancel(cancel, &self.text)?;
                    let fragment = ch.encode_utf8(&mut buf);
                    if let Some(value) = state.feed(&mut self.text, fragment, on_fragment)? {
                        return Ok(value);
                    }
                }
            }
            Some(Source::Stream(mut fragments)) => {
                loop {
                    check_cancel(cancel, &self.text)?;
                    let Some(fragment) = fragments.next().await else {
                        break;
                    };
                    if let Some(value) = state.feed(&mut self.text, &fragment?, on_fragment)? {
                        return Ok(value);
                    }
                }
            }
            None => {}
        }

        self.finalize(schema)
    }

    fn finalize(&self, schema: Option<&Value>) -> Result<Value> {
        if expects_json(schema) {
            serde_json::from_str(&self.text).map_err(|source| LmError::MalformedOutput {
                source,
                text: self.text.clone(),
            })
        } else {
            Ok(Value::String(self.text.clone()))
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            Some(Source::Complete(_)) => "complete",
            Some(Source::Stream(_)) => "stream",
            None => "consumed",
        };
        f.debug_struct("Response")
            .field("role", &self.role)
            .field("source", &source)
            .field("text", &self.text)
            .finish()
    }
}

/// A non-empty schema whose type is not `"string"` asks for decoded JSON.
fn expects_json(schema: Option<&Value>) -> bool {
    match schema {
        Some(Value::Object(map)) if !map.is_empty() => {
            map.get("type").and_then(Value::as_str) != Some("string")
        }
        _ => false,
    }
}

fn check_cancel(cancel: Option<&AtomicBool>, partial: &str) -> Result<()> {
    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        return Err(LmError::Interrupted {
            partial: partial.to_string(),
        });
    }
    Ok(())
}

struct ParserState {
    json_object: bool,
    in_json: bool,
    depth: i64,
}

impl ParserState {
    fn new(json_object: bool) -> Self {
        Self {
            json_object,
            in_json: false,
            depth: 0,
        }
    }

    /// Apply one fragment. Returns the decoded object once a balanced span
    /// parses.
    fn feed(
        &mut self,
        text: &mut String,
        fragment: &str,
        on_fragment: &mut (dyn FnMut(&Fragment<'_>) -> Result<()> + Send),
    ) -> Result<Option<Value>> {
        let open_braces = fragment.matches('{').count();
        let closed_braces = fragment.matches('}').count();

        if !self.json_object || self.in_json || open_braces > 0 {
            text.push_str(fragment);
            on_fragment(&Fragment {
                token_or_char: fragment,
                depth: self.depth,
                in_json: self.in_json,
                open_braces,
                closed_braces,
                json_object: self.json_object,
            })?;
        }

        if !self.json_object {
            return Ok(None);
        }

        if !self.in_json {
            if open_braces > 0 {
                // The first `{` opens the span; other braces in the same
                // fragment are not counted.
                self.in_json = true;
                self.depth = 1;
            }
            return Ok(None);
        }

        self.depth += open_braces as i64 - closed_braces as i64;
        if self.depth == 0 {
            match serde_json::from_str::<Value>(text) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => {
                    text.clear();
                    self.in_json = false;
                }
            }
        }
        Ok(None)
    }
}
