//! Structural schema intermediate representation.
//!
//! [`Schema`] is the typed form of the JSON Schema documents stored on a
//! [`LanguageFunction`](crate::LanguageFunction). Rust types describe
//! themselves through the [`Structural`] trait; stored JSON Schema is
//! compiled back into a [`Schema`] through the process-wide
//! [`SchemaRegistry`] so each distinct document is compiled only once.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{LmError, Result};

/// Tagged union of the shapes a language function can exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Unconstrained value.
    Any,
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array(Box<Schema>),
    /// String-keyed mapping with uniform values.
    Map(Box<Schema>),
    /// The inner schema or `null`.
    Optional(Box<Schema>),
    Enum(Vec<Value>),
    Object(ObjectSchema),
}

/// A named record type with ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub title: String,
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl FieldSchema {
    /// A field is required unless its schema is optional.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        let required = !matches!(schema, Schema::Optional(_));
        Self {
            name: name.into(),
            schema,
            required,
            default: None,
            description: None,
        }
    }

    /// Attach a default value. Fields with defaults are never required.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl ObjectSchema {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

impl Schema {
    /// The JSON Schema `type` keyword this schema emits, if any.
    pub fn type_name(&self) -> Option<&'static str> {
        match self {
            Schema::Null => Some("null"),
            Schema::Boolean => Some("boolean"),
            Schema::Integer => Some("integer"),
            Schema::Number => Some("number"),
            Schema::String => Some("string"),
            Schema::Array(_) => Some("array"),
            Schema::Map(_) | Schema::Object(_) => Some("object"),
            Schema::Any | Schema::Optional(_) | Schema::Enum(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectSchema> {
        match self {
            Schema::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Render as a JSON Schema document.
    ///
    /// Object schemas are emitted as `properties`, `required`, `title`,
    /// `type` in that order. Each property carries a title derived from its
    /// field name and lists its keys sorted. Nested objects are inlined and
    /// keep their own title.
    pub fn to_json_schema(&self) -> Value {
        match self {
            Schema::Any => json!({}),
            Schema::Array(items) => json!({"items": items.to_json_schema(), "type": "array"}),
            Schema::Map(values) => json!({
                "additionalProperties": values.to_json_schema(),
                "type": "object",
            }),
            Schema::Optional(inner) => json!({"anyOf": [inner.to_json_schema(), {"type": "null"}]}),
            Schema::Enum(values) => json!({ "enum": values }),
            Schema::Object(obj) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in &obj.fields {
                    let mut prop: BTreeMap<String, Value> = match field.schema.to_json_schema() {
                        Value::Object(map) => map.into_iter().collect(),
                        _ => BTreeMap::new(),
                    };
                    if let Some(ref default) = field.default {
                        prop.insert("default".into(), default.clone());
                    }
                    if let Some(ref description) = field.description {
                        prop.insert("description".into(), json!(description));
                    }
                    if !prop.contains_key("$ref") {
                        prop.entry("title".into()).or_insert_with(|| json!(field_title(&field.name)));
                    }
                    properties.insert(field.name.clone(), Value::Object(prop.into_iter().collect()));
                    if field.required {
                        required.push(json!(field.name));
                    }
                }
                let mut out = Map::new();
                out.insert("properties".into(), Value::Object(properties));
                if !required.is_empty() {
                    out.insert("required".into(), Value::Array(required));
                }
                out.insert("title".into(), json!(obj.title));
                out.insert("type".into(), json!("object"));
                Value::Object(out)
            }
            primitive => json!({ "type": primitive.type_name().unwrap_or("null") }),
        }
    }

    /// Compile a JSON Schema document.
    ///
    /// Supports `type` (string or list), `properties`, `required`,
    /// `default`, `description`, `items`, `additionalProperties`, `enum`,
    /// `anyOf` and local `$ref` into `$defs`/`definitions`.
    pub fn from_json_schema(doc: &Value) -> Result<Schema> {
        Self::compile_node(doc, doc, 0)
    }

    fn compile_node(node: &Value, root: &Value, depth: usize) -> Result<Schema> {
        if depth > 64 {
            return Err(LmError::Construction(
                "schema nesting too deep (recursive $ref?)".into(),
            ));
        }
        let map = match node {
            Value::Object(map) => map,
            Value::Bool(true) => return Ok(Schema::Any),
            other => {
                return Err(LmError::Construction(format!(
                    "expected a schema object, found {}",
                    other
                )))
            }
        };

        if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
            let target = resolve_ref(reference, root).ok_or_else(|| {
                LmError::Construction(format!("unresolved schema reference '{}'", reference))
            })?;
            return Self::compile_node(target, root, depth + 1);
        }

        if let Some(values) = map.get("enum").and_then(Value::as_array) {
            return Ok(Schema::Enum(values.clone()));
        }

        if let Some(variants) = map.get("anyOf").and_then(Value::as_array) {
            let non_null: Vec<&Value> = variants
                .iter()
                .filter(|v| v.get("type").and_then(Value::as_str) != Some("null"))
                .collect();
            return match (non_null.len(), variants.len()) {
                (1, 2) => Ok(Schema::Optional(Box::new(Self::compile_node(
                    non_null[0],
                    root,
                    depth + 1,
                )?))),
                (1, 1) => Self::compile_node(non_null[0], root, depth + 1),
                _ => Ok(Schema::Any),
            };
        }

        match map.get("type") {
            Some(Value::String(ty)) => Self::compile_typed(ty, map, root, depth),
            Some(Value::Array(types)) => {
                let names: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
                let non_null: Vec<&str> = names.iter().copied().filter(|t| *t != "null").collect();
                match non_null.as_slice() {
                    [only] if names.len() == 2 => Ok(Schema::Optional(Box::new(
                        Self::compile_typed(only, map, root, depth)?,
                    ))),
                    [only] => Self::compile_typed(only, map, root, depth),
                    _ => Ok(Schema::Any),
                }
            }
            _ if map.contains_key("properties") => Self::compile_typed("object", map, root, depth),
            _ => Ok(Schema::Any),
        }
    }

    fn compile_typed(
        ty: &str,
        map: &Map<String, Value>,
        root: &Value,
        depth: usize,
    ) -> Result<Schema> {
        Ok(match ty {
            "null" => Schema::Null,
            "boolean" => Schema::Boolean,
            "integer" => Schema::Integer,
            "number" => Schema::Number,
            "string" => Schema::String,
            "array" => match map.get("items") {
                Some(items) => Schema::Array(Box::new(Self::compile_node(items, root, depth + 1)?)),
                None => Schema::Array(Box::new(Schema::Any)),
            },
            "object" => match map.get("properties").and_then(Value::as_object) {
                Some(properties) => {
                    let required: Vec<&str> = map
                        .get("required")
                        .and_then(Value::as_array)
                        .map(|r| r.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default();
                    let mut obj = ObjectSchema::new(
                        map.get("title").and_then(Value::as_str).unwrap_or("Object"),
                    );
                    for (name, prop) in properties {
                        let mut field =
                            FieldSchema::new(name.clone(), Self::compile_node(prop, root, depth + 1)?);
                        field.required = required.contains(&name.as_str());
                        field.default = prop.get("default").cloned();
                        field.description = prop
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        obj.fields.push(field);
                    }
                    Schema::Object(obj)
                }
                None => match map.get("additionalProperties") {
                    Some(values @ Value::Object(_)) => {
                        Schema::Map(Box::new(Self::compile_node(values, root, depth + 1)?))
                    }
                    _ => Schema::Map(Box::new(Schema::Any)),
                },
            },
            other => {
                return Err(LmError::Construction(format!(
                    "unsupported schema type '{}'",
                    other
                )))
            }
        })
    }

    /// Instantiate `value` as this schema.
    ///
    /// Checks types recursively, fills declared defaults, drops undeclared
    /// object keys and accepts integral floats for integer fields. The
    /// error string names the offending path.
    pub fn validate(&self, value: &Value) -> std::result::Result<Value, String> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> std::result::Result<Value, String> {
        let mismatch = |expected: &str| {
            Err(format!("{}: expected {}, found {}", path, expected, kind_of(value)))
        };
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Null => match value {
                Value::Null => Ok(Value::Null),
                _ => mismatch("null"),
            },
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => mismatch("boolean"),
            },
            Schema::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(json!(f as i64)),
                    _ => mismatch("integer"),
                },
                _ => mismatch("integer"),
            },
            Schema::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                _ => mismatch("number"),
            },
            Schema::String => match value {
                Value::String(_) => Ok(value.clone()),
                _ => mismatch("string"),
            },
            Schema::Optional(inner) => match value {
                Value::Null => Ok(Value::Null),
                other => inner.validate_at(other, path),
            },
            Schema::Enum(values) => {
                if values.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(format!("{}: {} is not one of {}", path, value, Value::Array(values.clone())))
                }
            }
            Schema::Array(items) => match value {
                Value::Array(elements) => elements
                    .iter()
                    .enumerate()
                    .map(|(i, el)| items.validate_at(el, &format!("{}[{}]", path, i)))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(Value::Array),
                _ => mismatch("array"),
            },
            Schema::Map(values) => match value {
                Value::Object(entries) => {
                    let mut out = Map::new();
                    for (key, el) in entries {
                        out.insert(key.clone(), values.validate_at(el, &format!("{}.{}", path, key))?);
                    }
                    Ok(Value::Object(out))
                }
                _ => mismatch("object"),
            },
            Schema::Object(obj) => {
                let entries = match value {
                    Value::Object(entries) => entries,
                    _ => return mismatch(&format!("object '{}'", obj.title)),
                };
                let mut out = Map::new();
                for field in &obj.fields {
                    let field_path = format!("{}.{}", path, field.name);
                    match (entries.get(&field.name), &field.default) {
                        (Some(v), _) => {
                            out.insert(field.name.clone(), field.schema.validate_at(v, &field_path)?);
                        }
                        (None, Some(default)) => {
                            out.insert(field.name.clone(), default.clone());
                        }
                        (None, None) if field.required => {
                            return Err(format!("{}: missing required field", field_path));
                        }
                        (None, None) => {}
                    }
                }
                Ok(Value::Object(out))
            }
        }
    }
}

/// `first_name` becomes `First Name`.
fn field_title(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_cased = false;
    for ch in name.chars() {
        if ch == '_' {
            out.push(' ');
        } else if prev_cased {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        prev_cased = ch.is_alphabetic();
    }
    out
}

/// JSON type name of a value, for error messages.
pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn resolve_ref<'a>(reference: &str, root: &'a Value) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    root.pointer(pointer)
}

/// Types that can describe their own shape as a [`Schema`].
///
/// Implemented for primitives, `String`, collections and `serde_json::Value`.
/// Record types implement it by hand or through [`structural!`](crate::structural).
pub trait Structural {
    fn schema() -> Schema;

    /// Whether this type is the chat [`Message`](crate::Message) type, which
    /// is always returned raw.
    fn is_message() -> bool {
        false
    }
}

macro_rules! impl_structural {
    ($schema:expr => $($ty:ty),+) => {
        $(impl Structural for $ty {
            fn schema() -> Schema {
                $schema
            }
        })+
    };
}

impl_structural!(Schema::String => String, &str, char);
impl_structural!(Schema::Boolean => bool);
impl_structural!(Schema::Integer => i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
impl_structural!(Schema::Number => f32, f64);
impl_structural!(Schema::Any => Value);
impl_structural!(Schema::Null => ());

impl<T: Structural> Structural for Vec<T> {
    fn schema() -> Schema {
        Schema::Array(Box::new(T::schema()))
    }
}

impl<T: Structural> Structural for Option<T> {
    fn schema() -> Schema {
        Schema::Optional(Box::new(T::schema()))
    }
}

impl<T: Structural> Structural for HashMap<String, T> {
    fn schema() -> Schema {
        Schema::Map(Box::new(T::schema()))
    }
}

impl<T: Structural> Structural for BTreeMap<String, T> {
    fn schema() -> Schema {
        Schema::Map(Box::new(T::schema()))
    }
}

/// Declare a record struct together with its [`Structural`] impl.
///
/// Attributes (including serde derives) pass through unchanged. Field
/// order in the schema follows declaration order.
///
/// ```
/// use lm_functions::structural;
/// use lm_functions::schema::{Schema, Structural};
/// use serde::{Deserialize, Serialize};
///
/// structural! {
///     #[derive(Debug, Serialize, Deserialize)]
///     pub struct Recipe {
///         pub title: String,
///         pub minutes: u32,
///         pub tags: Option<Vec<String>>,
///     }
/// }
///
/// let schema = Recipe::schema();
/// let obj = schema.as_object().unwrap();
/// assert_eq!(obj.title, "Recipe");
/// assert!(obj.get("title").unwrap().required);
/// assert!(!obj.get("tags").unwrap().required);
/// ```
#[macro_export]
macro_rules! structural {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $fty ),*
        }

        impl $crate::schema::Structural for $name {
            fn schema() -> $crate::schema::Schema {
                let mut obj = $crate::schema::ObjectSchema::new(stringify!($name));
                $(
                    obj = obj.field($crate::schema::FieldSchema::new(
                        stringify!($field),
                        <$fty as $crate::schema::Structural>::schema(),
                    ));
                )*
                $crate::schema::Schema::Object(obj)
            }
        }
    };
}

/// Memoizes JSON Schema compilation, keyed by the document's canonical text.
///
/// The process-wide instance lives for the whole process and is never reset;
/// compiled schemas are immutable.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    compiled: Mutex<HashMap<String, Arc<Schema>>>,
}

static GLOBAL_REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared registry used by compiled language function views.
    pub fn global() -> &'static SchemaRegistry {
        GLOBAL_REGISTRY.get_or_init(SchemaRegistry::new)
    }

    /// Compile `doc`, reusing an earlier compilation of an identical document.
    pub fn compile(&self, doc: &Value) -> Result<Arc<Schema>> {
        let key = doc.to_string();
        if let Some(hit) = self.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }
        let schema = Arc::new(Schema::from_json_schema(doc)?);
        self.lock().entry(key).or_insert_with(|| Arc::clone(&schema));
        Ok(schema)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Schema>>> {
        self.compiled.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
