//! The serializable language function value.
//!
//! A [`LanguageFunction`] is plain data: a name, a description, optional
//! input and output JSON schemas and the metaprompt. Everything derived from
//! those fields (compiled schemas, the compiled template) lives in a lazily
//! built view that every setter discards.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LmError, Result};
use crate::prompt::{CompiledTemplate, DEFAULT_METAPROMPT};
use crate::schema::{kind_of, Schema, SchemaRegistry};
use crate::signature::Signature;

/// Serialization format of a language function document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Yaml,
    Json,
}

impl Format {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        ext.parse()
    }
}

impl FromStr for Format {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            other => Err(LmError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Yaml => "yaml",
            Format::Json => "json",
        })
    }
}

/// Compiled schemas and template, built on first use.
#[derive(Debug)]
pub(crate) struct CompiledView {
    pub(crate) input: Option<Arc<Schema>>,
    pub(crate) output: Option<Arc<Schema>>,
    pub(crate) template: CompiledTemplate,
}

fn default_metaprompt() -> String {
    DEFAULT_METAPROMPT.to_string()
}

/// A function whose body is a language model call.
///
/// Build one from a [`Signature`], with [`lmdef!`](crate::lmdef), or load
/// it from a YAML/JSON document.
///
/// # Example
///
/// ```
/// use lm_functions::function::Format;
/// use lm_functions::LanguageFunction;
/// use serde_json::json;
///
/// let f = LanguageFunction::new("sentiment")
///     .with_description("Classify the sentiment of the text.")
///     .with_output_schema(json!({
///         "properties": {"label": {"type": "string"}},
///         "required": ["label"],
///         "title": "Sentiment",
///         "type": "object"
///     }));
/// let yaml = f.dumps(Format::Yaml).unwrap();
/// assert_eq!(LanguageFunction::from_string(&yaml, Format::Yaml).unwrap(), f);
/// ```
#[derive(Serialize, Deserialize)]
pub struct LanguageFunction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Option<Value>,
    #[serde(default)]
    output_schema: Option<Value>,
    #[serde(default = "default_metaprompt")]
    metaprompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_wrapper: Option<String>,
    #[serde(skip)]
    compiled: OnceLock<Arc<CompiledView>>,
}

impl LanguageFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: None,
            output_schema: None,
            metaprompt: default_metaprompt(),
            output_wrapper: None,
            compiled: OnceLock::new(),
        }
    }

    /// Derive a function from an explicit signature.
    pub fn from_signature(signature: &Signature) -> Result<Self> {
        let derived = signature.derive()?;
        let mut f = Self::new(derived.name).with_description(derived.description);
        f.input_schema = derived.input_schema;
        f.output_schema = derived.output_schema;
        f.output_wrapper = derived.output_wrapper;
        Ok(f)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.set_description(description);
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.set_input_schema(Some(schema));
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.set_output_schema(Some(schema));
        self
    }

    pub fn with_metaprompt(mut self, metaprompt: impl Into<String>) -> Self {
        self.set_metaprompt(metaprompt);
        self
    }

    /// Mark the output schema as a synthetic record wrapping `field`.
    pub fn with_output_wrapper(mut self, field: impl Into<String>) -> Self {
        self.set_output_wrapper(Some(field.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> Option<&Value> {
        self.input_schema.as_ref()
    }

    pub fn output_schema(&self) -> Option<&Value> {
        self.output_schema.as_ref()
    }

    pub fn metaprompt(&self) -> &str {
        &self.metaprompt
    }

    pub fn output_wrapper(&self) -> Option<&str> {
        self.output_wrapper.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.invalidate();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.invalidate();
    }

    pub fn set_input_schema(&mut self, schema: Option<Value>) {
        self.input_schema = schema;
        self.invalidate();
    }

    pub fn set_output_schema(&mut self, schema: Option<Value>) {
        self.output_schema = schema;
        self.invalidate();
    }

    pub fn set_metaprompt(&mut self, metaprompt: impl Into<String>) {
        self.metaprompt = metaprompt.into();
        self.invalidate();
    }

    pub fn set_output_wrapper(&mut self, field: Option<String>) {
        self.output_wrapper = field;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.compiled = OnceLock::new();
    }

    /// The compiled view, built on first use.
    pub(crate) fn compiled(&self) -> Result<Arc<CompiledView>> {
        if let Some(view) = self.compiled.get() {
            return Ok(Arc::clone(view));
        }
        let registry = SchemaRegistry::global();
        let input = self
            .input_schema
            .as_ref()
            .map(|s| registry.compile(s))
            .transpose()?;
        let output = self
            .output_schema
            .as_ref()
            .map(|s| registry.compile(s))
            .transpose()?;
        let template = CompiledTemplate::compile(
            &self.metaprompt,
            &self.description,
            self.input_schema.as_ref(),
            self.output_schema.as_ref(),
        );
        tracing::debug!(function = %self.name, "compiled language function view");
        let view = Arc::new(CompiledView {
            input,
            output,
            template,
        });
        // A concurrent first use may have won the race; both views are equal.
        Ok(Arc::clone(self.compiled.get_or_init(|| view)))
    }

    /// Serialize to a YAML or JSON document.
    pub fn dumps(&self, format: Format) -> Result<String> {
        Ok(match format {
            Format::Yaml => serde_yaml::to_string(self)?,
            Format::Json => serde_json::to_string_pretty(self)?,
        })
    }

    /// Replace every field with the ones in `text`.
    pub fn loads(&mut self, text: &str, format: Format) -> Result<()> {
        *self = Self::from_string(text, format)?;
        Ok(())
    }

    pub fn from_string(text: &str, format: Format) -> Result<Self> {
        Ok(match format {
            Format::Yaml => serde_yaml::from_str(text)?,
            Format::Json => serde_json::from_str(text)?,
        })
    }

    /// Merge the keys of a mapping over the current fields.
    ///
    /// Keys absent from `data` keep their current values.
    pub fn load(&mut self, data: Value) -> Result<()> {
        let Value::Object(data) = data else {
            return Err(LmError::Construction(format!(
                "expected a mapping to load into '{}', got {}",
                self.name,
                kind_of(&data)
            )));
        };
        let mut merged: Map<String, Value> = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merged.extend(data);
        *self = serde_json::from_value(Value::Object(merged))?;
        Ok(())
    }

    /// Read a document, choosing the format from the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = Format::from_path(path)?;
        let text = std::fs::read_to_string(path)?;
        Self::from_string(&text, format)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = self.dumps(Format::from_path(path)?)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

impl Clone for LanguageFunction {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            metaprompt: self.metaprompt.clone(),
            output_wrapper: self.output_wrapper.clone(),
            compiled: self.compiled.clone(),
        }
    }
}

impl PartialEq for LanguageFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.input_schema == other.input_schema
            && self.output_schema == other.output_schema
            && self.metaprompt == other.metaprompt
            && self.output_wrapper == other.output_wrapper
    }
}

impl fmt::Debug for LanguageFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .field("output_wrapper", &self.output_wrapper)
            .field("compiled", &self.compiled.get().is_some())
            .finish()
    }
}
