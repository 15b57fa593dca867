//! Metaprompt compilation and rendering.
//!
//! A metaprompt is plain text with `{name}` placeholders. Use `{{` to insert
//! a literal `{` and `}}` to insert a literal `}`. Unknown placeholders are
//! kept verbatim.
//!
//! | Placeholder       | Bound                                  |
//! |-------------------|----------------------------------------|
//! | `{description}`   | once, at compile time                  |
//! | `{input_schema}`  | once, compact JSON or `null`           |
//! | `{output_schema}` | once, compact JSON or `null`           |
//! | `{input}`         | per attempt                            |
//! | `{examples}`      | per attempt                            |
//!
//! Substitution is single-pass: braces inside substituted values are never
//! interpreted as placeholders.

use serde_json::Value;

/// The metaprompt used when a language function does not set its own.
pub const DEFAULT_METAPROMPT: &str = "You are a function implemented by a language model.
Function description: {description}
Input JSON schema: {input_schema}
Output JSON schema: {output_schema}
If the output schema is not null, answer with one JSON object that conforms to it and nothing else.
{examples}Input: {input}
Output: ";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Input,
    Examples,
}

/// A metaprompt with its static placeholders already bound.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    /// Parse `metaprompt` and bind the description and both schemas.
    pub fn compile(
        metaprompt: &str,
        description: &str,
        input_schema: Option<&Value>,
        output_schema: Option<&Value>,
    ) -> Self {
        let mut builder = SegmentBuilder::default();
        let mut rest = metaprompt;

        while let Some(pos) = rest.find(['{', '}']) {
            builder.literal(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("{{") {
                builder.literal("{");
                rest = &tail[2..];
            } else if tail.starts_with("}}") {
                builder.literal("}");
                rest = &tail[2..];
            } else if let Some(name) = placeholder_name(tail) {
                match name {
                    "description" => builder.literal(description),
                    "input_schema" => builder.literal(&schema_text(input_schema)),
                    "output_schema" => builder.literal(&schema_text(output_schema)),
                    "input" => builder.push(Segment::Input),
                    "examples" => builder.push(Segment::Examples),
                    _ => builder.literal(&tail[..name.len() + 2]),
                }
                rest = &tail[name.len() + 2..];
            } else {
                builder.literal(&tail[..1]);
                rest = &tail[1..];
            }
        }
        builder.literal(rest);

        Self {
            segments: builder.segments,
        }
    }

    /// Fill the per-attempt placeholders.
    pub fn render(&self, input: &str, examples: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Input => out.push_str(input),
                Segment::Examples => out.push_str(examples),
            }
        }
        out
    }
}

#[derive(Default)]
struct SegmentBuilder {
    segments: Vec<Segment>,
}

impl SegmentBuilder {
    fn literal(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Literal(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Literal(text.to_string()));
        }
    }

    fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }
}

/// `{identifier}` at the start of `text`, without the braces.
fn placeholder_name(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('{')?;
    let end = inner.find('}')?;
    let name = &inner[..end];
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

fn schema_text(schema: Option<&Value>) -> String {
    schema.map_or_else(|| "null".to_string(), Value::to_string)
}

/// Render a value the way it appears inside a prompt.
///
/// `null` becomes the marker `null`, strings appear raw, everything else
/// as compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render demonstration pairs as an `Examples:` block.
///
/// Returns an empty string when there are no examples, so templates can
/// place `{examples}` directly before other text.
pub fn render_examples(examples: &[(Value, Value)]) -> String {
    if examples.is_empty() {
        return String::new();
    }
    let mut out = String::from("Examples:\n");
    for (input, output) in examples {
        out.push_str("Input: ");
        out.push_str(&render_value(input));
        out.push_str("\nOutput: ");
        out.push_str(&render_value(output));
        out.push_str("\n\n");
    }
    out
}
