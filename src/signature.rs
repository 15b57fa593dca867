//! Explicit function signatures and schema derivation.
//!
//! A [`Signature`] records what a reflective language would read off a
//! function: its name, doc lines, typed parameters with optional defaults,
//! and its return type. [`Signature::derive`] turns that into the input and
//! output schemas a [`LanguageFunction`](crate::LanguageFunction) carries.
//!
//! The [`lmdef!`](crate::lmdef) macro builds the signature from a bodiless
//! function declaration.

use serde_json::Value;

use crate::error::{LmError, Result};
use crate::schema::{FieldSchema, ObjectSchema, Schema, Structural};

/// Title of the synthetic input record built from several parameters.
pub const INPUT_WRAPPER: &str = "InputWrapper";
/// Title of the synthetic single-field output record.
pub const OUTPUT_WRAPPER: &str = "OutputWrapper";
/// The field a synthetic output record wraps.
pub const OUTPUT_FIELD: &str = "output";

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub schema: Schema,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Returns {
    /// No declared return type.
    Nothing,
    Schema(Schema),
    /// The chat message type, always passed through raw.
    Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    name: String,
    doc: Vec<String>,
    params: Vec<Param>,
    returns: Returns,
}

/// Schemas derived from a [`Signature`].
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub name: String,
    pub description: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    /// Set when the output schema is a synthetic wrapper around this field.
    pub output_wrapper: Option<String>,
}

impl Signature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: Vec::new(),
            params: Vec::new(),
            returns: Returns::Nothing,
        }
    }

    /// Append a doc line. Lines are joined and whitespace-collapsed.
    pub fn doc(mut self, line: impl Into<String>) -> Self {
        self.doc.push(line.into());
        self
    }

    pub fn param<T: Structural>(self, name: impl Into<String>) -> Self {
        self.param_schema(name, T::schema(), None)
    }

    pub fn param_with_default<T: Structural>(self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.param_schema(name, T::schema(), Some(default.into()))
    }

    /// A parameter without a declared type; treated as a string.
    pub fn param_untyped(self, name: impl Into<String>) -> Self {
        self.param_schema(name, Schema::String, None)
    }

    pub fn param_schema(mut self, name: impl Into<String>, schema: Schema, default: Option<Value>) -> Self {
        self.params.push(Param {
            name: name.into(),
            schema,
            default,
        });
        self
    }

    pub fn returns<T: Structural>(mut self) -> Self {
        self.returns = if T::is_message() {
            Returns::Message
        } else {
            Returns::Schema(T::schema())
        };
        self
    }

    pub fn returns_schema(mut self, schema: Schema) -> Self {
        self.returns = Returns::Schema(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Doc lines joined with runs of whitespace collapsed to one space.
    pub fn description(&self) -> String {
        self.doc
            .iter()
            .flat_map(|line| line.split_whitespace())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(LmError::Construction(format!(
                "'{}' is not a valid function name",
                self.name
            )));
        }
        for (i, param) in self.params.iter().enumerate() {
            if !is_identifier(&param.name) {
                return Err(LmError::Construction(format!(
                    "'{}' is not a valid parameter name",
                    param.name
                )));
            }
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return Err(LmError::Construction(format!(
                    "duplicate parameter '{}' in '{}'",
                    param.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Derive name, description and schemas.
    ///
    /// Input: none for zero parameters or a single string parameter; the
    /// parameter's own schema for a single object parameter; otherwise a
    /// synthetic record of all parameters in declaration order.
    ///
    /// Output: the declared object schema as-is; none for message returns,
    /// and for string returns without a description; otherwise a synthetic
    /// record with a single `output` field.
    pub fn derive(&self) -> Result<Derived> {
        self.validate()?;
        let description = self.description();

        let input_schema = match self.params.as_slice() {
            [] => None,
            [only] if only.schema == Schema::String => None,
            [only] if matches!(only.schema, Schema::Object(_)) => Some(only.schema.to_json_schema()),
            params => {
                let wrapper = params.iter().fold(ObjectSchema::new(INPUT_WRAPPER), |obj, p| {
                    let field = FieldSchema::new(p.name.clone(), p.schema.clone());
                    obj.field(match p.default {
                        Some(ref d) => field.with_default(d.clone()),
                        None => field,
                    })
                });
                Some(Schema::Object(wrapper).to_json_schema())
            }
        };

        let wrap = |schema: Schema| {
            let wrapper = ObjectSchema::new(OUTPUT_WRAPPER).field(FieldSchema::new(OUTPUT_FIELD, schema));
            (
                Some(Schema::Object(wrapper).to_json_schema()),
                Some(OUTPUT_FIELD.to_string()),
            )
        };
        let (output_schema, output_wrapper) = match &self.returns {
            Returns::Message => (None, None),
            Returns::Schema(Schema::String) if description.is_empty() => (None, None),
            Returns::Schema(schema @ Schema::Object(_)) => (Some(schema.to_json_schema()), None),
            Returns::Schema(schema) => wrap(schema.clone()),
            Returns::Nothing => wrap(Schema::Null),
        };

        Ok(Derived {
            name: self.name.clone(),
            description,
            input_schema,
            output_schema,
            output_wrapper,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Declare language functions from bodiless, doc-commented signatures.
///
/// Each declaration becomes a constructor returning
/// `Result<LanguageFunction>`. The doc comment becomes the description.
///
/// ```
/// use lm_functions::lmdef;
///
/// lmdef! {
///     /// Add two numbers.
///     pub fn add(x: i64, y: i64) -> i64;
///
///     /// Write a haiku about the topic.
///     fn haiku(topic: String) -> String;
/// }
///
/// let add = add().unwrap();
/// assert_eq!(add.description(), "Add two numbers.");
/// assert!(add.input_schema().is_some());
/// assert!(haiku().unwrap().input_schema().is_none());
/// ```
#[macro_export]
macro_rules! lmdef {
    ($(
        $(#[doc = $doc:expr])*
        $vis:vis fn $name:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) $( -> $ret:ty )? ;
    )+) => {$(
        $(#[doc = $doc])*
        $vis fn $name() -> $crate::Result<$crate::LanguageFunction> {
            let sig = $crate::signature::Signature::new(stringify!($name))
                $( .doc($doc) )*
                $( .param::<$ty>(stringify!($arg)) )*
                $( .returns::<$ret>() )?;
            $crate::LanguageFunction::from_signature(&sig)
        }
    )+};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    #[test]
    fn test_description_collapses_whitespace() {
        let sig = Signature::new("f").doc("  Summarize   the\n\ttext. ").doc("Be brief.");
        assert_eq!(sig.description(), "Summarize the text. Be brief.");
    }

    #[test]
    fn test_no_params_no_input_schema() {
        let d = Signature::new("f").returns::<i64>().derive().unwrap();
        assert_eq!(d.input_schema, None);
    }

    #[test]
    fn test_single_string_param_no_input_schema() {
        let d = Signature::new("f").param::<String>("text").derive().unwrap();
        assert_eq!(d.input_schema, None);
        let d = Signature::new("f").param_untyped("text").derive().unwrap();
        assert_eq!(d.input_schema, None);
    }

    #[test]
    fn test_single_object_param_used_directly() {
        let point = Schema::Object(ObjectSchema::new("Point").field(FieldSchema::new("x", Schema::Integer)));
        let d = Signature::new("f")
            .param_schema("p", point.clone(), None)
            .derive()
            .unwrap();
        assert_eq!(d.input_schema, Some(point.to_json_schema()));
    }

    #[test]
    fn test_multiple_params_wrapped_in_order() {
        let d = Signature::new("f")
            .param::<i64>("x")
            .param_with_default::<i64>("y", 2)
            .derive()
            .unwrap();
        assert_eq!(
            d.input_schema,
            Some(json!({
                "properties": {
                    "x": {"title": "X", "type": "integer"},
                    "y": {"default": 2, "title": "Y", "type": "integer"}
                },
                "required": ["x"],
                "title": "InputWrapper",
                "type": "object"
            }))
        );
    }

    #[test]
    fn test_single_non_string_param_wrapped() {
        let d = Signature::new("f").param::<i64>("n").derive().unwrap();
        let schema = d.input_schema.unwrap();
        assert_eq!(schema["title"], "InputWrapper");
        assert_eq!(schema["properties"]["n"]["type"], "integer");
    }

    #[test]
    fn test_scalar_return_wrapped_with_marker() {
        let d = Signature::new("f").returns::<i64>().derive().unwrap();
        assert_eq!(d.output_wrapper.as_deref(), Some("output"));
        let schema = d.output_schema.unwrap();
        assert_eq!(schema["title"], "OutputWrapper");
        assert_eq!(schema["properties"]["output"]["type"], "integer");
    }

    #[test]
    fn test_string_return_without_description_is_raw() {
        let d = Signature::new("f").returns::<String>().derive().unwrap();
        assert_eq!((d.output_schema, d.output_wrapper), (None, None));
    }

    #[test]
    fn test_string_return_with_description_is_wrapped() {
        let d = Signature::new("f").doc("Greet.").returns::<String>().derive().unwrap();
        assert_eq!(d.output_wrapper.as_deref(), Some("output"));
    }

    #[test]
    fn test_message_return_is_raw() {
        let d = Signature::new("f").doc("Chat.").returns::<Message>().derive().unwrap();
        assert_eq!((d.output_schema, d.output_wrapper), (None, None));
    }

    #[test]
    fn test_missing_return_wraps_null() {
        let d = Signature::new("f").derive().unwrap();
        let schema = d.output_schema.unwrap();
        assert_eq!(schema["properties"]["output"]["type"], "null");
    }

    #[test]
    fn test_object_return_used_directly() {
        let rec = Schema::Object(ObjectSchema::new("Rec").field(FieldSchema::new("a", Schema::String)));
        let d = Signature::new("f").returns_schema(rec.clone()).derive().unwrap();
        assert_eq!(d.output_schema, Some(rec.to_json_schema()));
        assert_eq!(d.output_wrapper, None);
    }

    #[test]
    fn test_construction_errors() {
        let dup = Signature::new("f").param::<i64>("x").param::<i64>("x").derive();
        assert!(matches!(dup, Err(LmError::Construction(_))));
        let bad = Signature::new("not valid").derive();
        assert!(matches!(bad, Err(LmError::Construction(_))));
        let bad_param = Signature::new("f").param::<i64>("1x").derive();
        assert!(matches!(bad_param, Err(LmError::Construction(_))));
    }
}
