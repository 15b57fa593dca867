//! Calling a language function.
//!
//! [`LanguageFunction::call`] runs the pipeline: normalize the arguments,
//! render the prompt, invoke the backend, parse the response while
//! streaming fragments to the event bus, validate and unwrap the output.
//! Steps from rendering to output construction run inside the retry loop.
//!
//! ```text
//! call_start ─► assemble ─┬─► prompt_render ─► input_render ─► invoke ─► token_or_char* ─► success
//!                         │          ▲                                        │
//!                         │          └──────────── retry (sleep) ◄────────────┤ retryable error
//!                         │                                                   ▼
//!                         └──────────────────────────────────────────► exception (once)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::backend::{Backend, BackendInput};
use crate::error::{LmError, Result};
use crate::events::{Dispatch, Event, EventBus, EventKind};
use crate::function::{CompiledView, LanguageFunction};
use crate::message::Message;
use crate::prompt::{render_examples, render_value};
use crate::response::{Fragment, Response};
use crate::retry::{RetryPolicy, RetryState};
use crate::runtime::Runtime;
use crate::schema::Schema;

/// One call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    /// A structured object, used directly when it is the only argument.
    Model(Value),
    /// Chat messages, sent to the backend without templating when they are
    /// the only argument.
    Messages(Vec<Message>),
}

impl Arg {
    pub fn to_value(&self) -> Value {
        match self {
            Arg::Value(v) | Arg::Model(v) => v.clone(),
            Arg::Messages(m) => serde_json::to_value(m).unwrap_or(Value::Null),
        }
    }
}

/// Arguments and per-call settings for one invocation.
///
/// # Example
///
/// ```
/// use lm_functions::{Call, RetryPolicy};
///
/// let call = Call::new()
///     .arg(1)
///     .kwarg("y", 2)
///     .example(serde_json::json!({"x": 2, "y": 2}), 4)
///     .retry_policy(RetryPolicy::none());
/// ```
#[derive(Default)]
pub struct Call {
    args: Vec<Arg>,
    kwargs: Vec<(String, Arg)>,
    examples: Vec<(Value, Value)>,
    extras: Map<String, Value>,
    backend: Option<Arc<dyn Backend>>,
    retry_policy: Option<RetryPolicy>,
    event_bus: Option<EventBus>,
}

impl Call {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(Arg::Value(value.into()));
        self
    }

    /// Append a structured object as a positional argument.
    pub fn model<T: Serialize>(mut self, model: &T) -> Result<Self> {
        self.args.push(Arg::Model(serde_json::to_value(model)?));
        Ok(self)
    }

    /// Append a message list as a positional argument.
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.args.push(Arg::Messages(messages));
        self
    }

    /// Set a keyword argument. A repeated name replaces the earlier value.
    pub fn kwarg(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwarg_arg(name, Arg::Value(value.into()))
    }

    pub fn kwarg_model<T: Serialize>(self, name: impl Into<String>, model: &T) -> Result<Self> {
        Ok(self.kwarg_arg(name, Arg::Model(serde_json::to_value(model)?)))
    }

    pub fn kwarg_arg(mut self, name: impl Into<String>, arg: Arg) -> Self {
        let name = name.into();
        match self.kwargs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = arg,
            None => self.kwargs.push((name, arg)),
        }
        self
    }

    /// Add a demonstration pair rendered into `{examples}`.
    pub fn example(mut self, input: impl Into<Value>, output: impl Into<Value>) -> Self {
        self.examples.push((input.into(), output.into()));
        self
    }

    /// Attach a value every event of this call carries.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn kwargs(&self) -> &[(String, Arg)] {
        &self.kwargs
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("examples", &self.examples.len())
            .field("extras", &self.extras)
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("retry_policy", &self.retry_policy)
            .field("event_bus", &self.event_bus)
            .finish()
    }
}

/// The single input value a call's arguments normalize to.
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    Empty,
    Text(String),
    Messages(Vec<Message>),
    Model(Value),
    /// A lone argument for a function without named input fields.
    Value(Value),
    /// Arguments bound to the input schema's fields.
    Fields(Map<String, Value>),
}

impl CallInput {
    /// Normalize arguments.
    ///
    /// A lone string, message list or structured object is used directly.
    /// Otherwise positional arguments are bound to the input schema's field
    /// names in order and keyword arguments are applied on top. Declared
    /// fields are type-checked and come first in schema order; undeclared
    /// keywords follow as given. Omitted fields stay omitted.
    pub fn assemble(input_schema: Option<&Schema>, args: &[Arg], kwargs: &[(String, Arg)]) -> Result<Self> {
        if args.is_empty() && kwargs.is_empty() {
            return Ok(CallInput::Empty);
        }
        let object = input_schema.and_then(Schema::as_object);

        if args.len() + kwargs.len() == 1 {
            let only = args.first().or_else(|| kwargs.first().map(|(_, a)| a));
            match only {
                Some(Arg::Value(Value::String(s))) => return Ok(CallInput::Text(s.clone())),
                Some(Arg::Messages(m)) => return Ok(CallInput::Messages(m.clone())),
                Some(Arg::Model(v)) => return Ok(CallInput::Model(v.clone())),
                Some(Arg::Value(v)) if object.is_none() => return Ok(CallInput::Value(v.clone())),
                _ => {}
            }
        }

        let names: Vec<&str> = object.map(|o| o.field_names().collect()).unwrap_or_default();
        let mut fields = Map::new();
        for (index, arg) in args.iter().enumerate() {
            match names.get(index) {
                Some(name) => {
                    fields.insert((*name).to_string(), arg.to_value());
                }
                None => tracing::warn!(index, "dropping positional argument with no matching input field"),
            }
        }
        for (name, arg) in kwargs {
            fields.insert(name.clone(), arg.to_value());
        }

        let Some(object) = object else {
            return Ok(CallInput::Fields(fields));
        };
        let mut bound = Map::with_capacity(fields.len());
        for field in &object.fields {
            let Some(value) = fields.get(&field.name) else {
                continue;
            };
            let value = field.schema.validate(value).map_err(|reason| LmError::SchemaMismatch {
                schema: object.title.clone(),
                reason: format!("{}: {}", field.name, reason.trim_start_matches("$: ")),
            })?;
            bound.insert(field.name.clone(), value);
        }
        let undeclared: Map<String, Value> = fields.into_iter().filter(|(k, _)| object.get(k).is_none()).collect();
        if !undeclared.is_empty() {
            tracing::debug!(keys = ?undeclared.keys().collect::<Vec<_>>(), "passing undeclared keyword arguments");
        }
        bound.extend(undeclared);
        Ok(CallInput::Fields(bound))
    }

    pub fn to_value(&self) -> Value {
        match self {
            CallInput::Empty => Value::Null,
            CallInput::Text(s) => Value::String(s.clone()),
            CallInput::Messages(m) => serde_json::to_value(m).unwrap_or(Value::Null),
            CallInput::Model(v) | CallInput::Value(v) => v.clone(),
            CallInput::Fields(fields) => Value::Object(fields.clone()),
        }
    }

    /// Text substituted for `{input}`.
    pub fn render(&self) -> String {
        render_value(&self.to_value())
    }
}

/// Result of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Value(Value),
    /// The raw assistant message, for functions without a description or
    /// output schema.
    Raw(Message),
    /// Retries were exhausted and nothing re-raised the failure.
    NoResult,
}

impl Output {
    pub fn is_no_result(&self) -> bool {
        matches!(self, Output::NoResult)
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Output::Raw(m) => Some(m),
            _ => None,
        }
    }

    /// JSON form: raw messages become their text, no result becomes null.
    pub fn to_value(&self) -> Value {
        match self {
            Output::Value(v) => v.clone(),
            Output::Raw(m) => Value::String(m.content.clone()),
            Output::NoResult => Value::Null,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Output::Value(v) => v,
            Output::Raw(m) => Value::String(m.content),
            Output::NoResult => Value::Null,
        }
    }

    /// Deserialize the output into a typed `T`.
    pub fn parse_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_value()).map_err(|e| LmError::SchemaMismatch {
            schema: std::any::type_name::<T>().to_string(),
            reason: e.to_string(),
        })
    }
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

struct Emitter<'a> {
    bus: &'a EventBus,
    function: &'a str,
    call_id: u64,
    extras: Arc<Map<String, Value>>,
}

impl Emitter<'_> {
    fn emit(&self, kind: EventKind) -> Result<Dispatch> {
        let event = Event::new(self.function, Arc::clone(&self.extras), kind).with_call_id(self.call_id);
        self.bus.emit(&event)
    }
}

/// What one attempt got to before it failed.
#[derive(Default)]
struct AttemptState {
    backend_input: Option<BackendInput>,
    completion: Option<String>,
    handler_failed: bool,
}

impl AttemptState {
    fn fire(&mut self, emitter: &Emitter<'_>, kind: EventKind) -> Result<()> {
        emitter.emit(kind).map(drop).map_err(|e| {
            self.handler_failed = true;
            e
        })
    }
}

impl LanguageFunction {
    /// Call the function.
    ///
    /// Failure handling once the retry loop gives up, after the `exception`
    /// event has fired:
    /// - non-retryable errors and `reraise = true` return the last error;
    /// - `reraise = false` returns [`LmError::RetryExhausted`] when the bus
    ///   re-raises on `exception`, [`Output::NoResult`] otherwise.
    ///
    /// An event handler error aborts the call at once with that error.
    pub async fn call(&self, rt: &Runtime, call: Call) -> Result<Output> {
        let backend = call.backend.clone().unwrap_or_else(|| Arc::clone(&rt.backend));
        let span = tracing::info_span!("lmfunc.call", function = %self.name(), backend = backend.name());
        self.run(rt, &call, backend.as_ref()).instrument(span).await
    }

    /// Call and deserialize the output into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, rt: &Runtime, call: Call) -> Result<T> {
        self.call(rt, call).await?.parse_as()
    }

    /// HTTP route this function is served under.
    pub fn route(&self) -> String {
        format!("/{}", self.name())
    }

    /// Serve one request body: an object binds keyword arguments, anything
    /// else is the single positional argument.
    pub async fn handle(&self, rt: &Runtime, body: Value) -> Result<Value> {
        let call = match body {
            Value::Object(map) => map.into_iter().fold(Call::new(), |c, (k, v)| c.kwarg(k, v)),
            other => Call::new().arg(other),
        };
        Ok(self.call(rt, call).await?.into_value())
    }

    async fn run(&self, rt: &Runtime, call: &Call, backend: &dyn Backend) -> Result<Output> {
        let policy = call.retry_policy.as_ref().unwrap_or(&rt.retry_policy).compile();
        let emitter = Emitter {
            bus: call.event_bus.as_ref().unwrap_or(&rt.event_bus),
            function: self.name(),
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            extras: Arc::new(call.extras.clone()),
        };
        let view = self.compiled()?;

        emitter.emit(EventKind::CallStart {
            args: call.args.iter().map(Arg::to_value).collect(),
            kwargs: call
                .kwargs
                .iter()
                .map(|(k, a)| (k.clone(), a.to_value()))
                .collect(),
            examples: call.examples.len(),
            backend: backend.name().to_string(),
        })?;

        let input = match CallInput::assemble(view.input.as_deref(), &call.args, &call.kwargs) {
            Ok(input) => input,
            Err(err) => {
                emitter.emit(EventKind::Exception {
                    attempt: 0,
                    error: err.to_string(),
                    retryable: false,
                    completion: None,
                    backend_input: None,
                })?;
                return Err(err);
            }
        };

        let started = Instant::now();
        let mut attempt = 0;
        let (err, state) = loop {
            attempt += 1;
            let mut state = AttemptState::default();
            let result = match rt.check_cancelled() {
                Ok(()) => {
                    self.attempt(&view, &input, call, backend, &emitter, rt.cancel_flag(), attempt, &mut state)
                        .await
                }
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(output) => return Ok(output),
                Err(err) if state.handler_failed => return Err(err),
                Err(err) => err,
            };

            let elapsed = started.elapsed();
            if !err.is_retryable() || policy.should_stop(attempt, elapsed) {
                break (err, state);
            }
            let retry = RetryState {
                attempt,
                elapsed,
                wait: policy.delay_for_attempt(attempt),
            };
            tracing::warn!(attempt, error = %err, wait_ms = retry.wait.as_millis() as u64, "attempt failed, retrying");
            emitter.emit(EventKind::Retry {
                attempt: retry.attempt,
                wait: retry.wait,
                elapsed: retry.elapsed,
                reason: err.to_string(),
            })?;
            if !retry.wait.is_zero() {
                tokio::time::sleep(retry.wait).await;
            }
        };

        let retryable = err.is_retryable();
        let dispatch = emitter.emit(EventKind::Exception {
            attempt,
            error: err.to_string(),
            retryable,
            completion: state.completion,
            backend_input: state.backend_input,
        })?;
        if !retryable || policy.reraise {
            return Err(err);
        }
        match dispatch {
            Dispatch::Raise => Err(LmError::RetryExhausted {
                attempts: attempt,
                last: Box::new(err),
            }),
            Dispatch::Continue => {
                tracing::warn!(attempts = attempt, error = %err, "retries exhausted, returning no result");
                Ok(Output::NoResult)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        view: &CompiledView,
        input: &CallInput,
        call: &Call,
        backend: &dyn Backend,
        emitter: &Emitter<'_>,
        cancel: Option<&AtomicBool>,
        attempt: u32,
        state: &mut AttemptState,
    ) -> Result<Output> {
        let backend_input = match input {
            CallInput::Messages(messages) => BackendInput::Messages(messages.clone()),
            other => {
                let prompt = view
                    .template
                    .render(&other.render(), &render_examples(&call.examples));
                tracing::debug!(attempt, chars = prompt.len(), "rendered prompt");
                state.fire(
                    emitter,
                    EventKind::PromptRender {
                        attempt,
                        prompt: prompt.clone(),
                    },
                )?;
                BackendInput::Prompt(prompt)
            }
        };
        state.backend_input = Some(backend_input.clone());
        state.fire(
            emitter,
            EventKind::InputRender {
                attempt,
                input: input.to_value(),
                backend_input: backend_input.clone(),
            },
        )?;

        let mut response = backend.invoke(&backend_input, self.output_schema()).await?;
        let mut handler_failed = false;
        let parsed = {
            let mut on_fragment = |f: &Fragment<'_>| -> Result<()> {
                emitter
                    .emit(EventKind::TokenOrChar {
                        token_or_char: f.token_or_char.to_string(),
                        depth: f.depth,
                        in_json: f.in_json,
                        open_braces: f.open_braces,
                        closed_braces: f.closed_braces,
                    })
                    .map(drop)
                    .map_err(|e| {
                        handler_failed = true;
                        e
                    })
            };
            response
                .process(self.output_schema(), cancel, &mut on_fragment)
                .await
        };
        state.handler_failed |= handler_failed;
        let completion = response.text().to_string();
        state.completion = Some(completion.clone());
        let parsed = parsed?;
        tracing::debug!(attempt, chars = completion.len(), "response processed");

        let output = self.build_output(view, &parsed, response)?;
        state.fire(
            emitter,
            EventKind::Success {
                attempt,
                input: input.to_value(),
                backend_input,
                completion,
                parsed,
                output: output.to_value(),
            },
        )?;
        Ok(output)
    }

    fn build_output(&self, view: &CompiledView, parsed: &Value, response: Response) -> Result<Output> {
        if self.description().is_empty() && self.output_schema().is_none() {
            return Ok(Output::Raw(response.into_message()));
        }
        let (Value::Object(_), Some(schema)) = (parsed, view.output.as_deref()) else {
            return Ok(Output::Value(parsed.clone()));
        };
        let instance = schema.validate(parsed).map_err(|reason| LmError::SchemaMismatch {
            schema: schema
                .as_object()
                .map(|o| o.title.clone())
                .unwrap_or_else(|| schema.type_name().unwrap_or("schema").to_string()),
            reason,
        })?;
        Ok(Output::Value(match self.output_wrapper() {
            Some(field) => instance.get(field).cloned().unwrap_or(Value::Null),
            None => instance,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Chunking, MockBackend};
    use crate::events::{EXCEPTION, RETRY, SUCCESS, TOKEN_OR_CHAR};
    use crate::schema::{FieldSchema, ObjectSchema};
    use crate::signature::Signature;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn add() -> LanguageFunction {
        let sig = Signature::new("add")
            .doc("Add two integers.")
            .param::<i64>("x")
            .param::<i64>("y")
            .returns::<i64>();
        LanguageFunction::from_signature(&sig).unwrap()
    }

    fn runtime(mock: &Arc<MockBackend>) -> Runtime {
        Runtime::builder(mock.clone())
            .retry_policy(RetryPolicy::default())
            .build()
    }

    fn recorder() -> (EventBus, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for name in [
            "call_start",
            "prompt_render",
            "input_render",
            "token_or_char",
            "retry",
            "success",
            "exception",
        ] {
            let seen = seen.clone();
            bus = bus.on_fn(name, move |e| {
                seen.lock().unwrap().push(e.name().to_string());
                Ok(())
            });
        }
        (bus, seen)
    }

    fn point_schema() -> Schema {
        Schema::Object(
            ObjectSchema::new("Pair")
                .field(FieldSchema::new("x", Schema::Integer))
                .field(FieldSchema::new("y", Schema::Integer).with_default(json!(0))),
        )
    }

    #[test]
    fn test_assemble_lone_values() {
        assert_eq!(CallInput::assemble(None, &[], &[]).unwrap(), CallInput::Empty);
        let text = CallInput::assemble(None, &[Arg::Value(json!("hi"))], &[]).unwrap();
        assert_eq!(text, CallInput::Text("hi".into()));
        let msgs = vec![Message::user("hi")];
        let input = CallInput::assemble(Some(&point_schema()), &[Arg::Messages(msgs.clone())], &[]).unwrap();
        assert_eq!(input, CallInput::Messages(msgs));
        let model = CallInput::assemble(Some(&point_schema()), &[Arg::Model(json!({"x": 1}))], &[]).unwrap();
        assert_eq!(model, CallInput::Model(json!({"x": 1})));
        let lone = CallInput::assemble(None, &[Arg::Value(json!(5))], &[]).unwrap();
        assert_eq!(lone.render(), "5");
    }

    #[test]
    fn test_assemble_binds_fields_in_schema_order() {
        let schema = point_schema();
        let kw = |k: &str, v: Value| (k.to_string(), Arg::Value(v));
        let positional = CallInput::assemble(Some(&schema), &[Arg::Value(json!(1)), Arg::Value(json!(2))], &[]).unwrap();
        let keywords = CallInput::assemble(Some(&schema), &[], &[kw("y", json!(2)), kw("x", json!(1))]).unwrap();
        let mixed = CallInput::assemble(Some(&schema), &[Arg::Value(json!(1))], &[kw("y", json!(2))]).unwrap();
        assert_eq!(positional.render(), r#"{"x":1,"y":2}"#);
        assert_eq!(keywords.render(), positional.render());
        assert_eq!(mixed.render(), positional.render());
    }

    #[test]
    fn test_assemble_drops_extra_positionals() {
        let schema = point_schema();
        let input = CallInput::assemble(
            Some(&schema),
            &[Arg::Value(json!(1)), Arg::Value(json!(2)), Arg::Value(json!(3))],
            &[],
        )
        .unwrap();
        assert_eq!(input.to_value(), json!({"x": 1, "y": 2}));
        let only_x = CallInput::assemble(Some(&schema), &[], &[("x".into(), Arg::Value(json!(7)))]).unwrap();
        assert_eq!(only_x.render(), r#"{"x":7}"#);
    }

    #[test]
    fn test_assemble_keeps_undeclared_keywords() {
        let schema = point_schema();
        let kw = |k: &str, v: Value| (k.to_string(), Arg::Value(v));
        let input = CallInput::assemble(
            Some(&schema),
            &[Arg::Value(json!(1))],
            &[kw("z", json!(9)), kw("y", json!(2.0))],
        )
        .unwrap();
        assert_eq!(input.render(), r#"{"x":1,"y":2,"z":9}"#);
    }

    #[test]
    fn test_assemble_rejects_bad_fields() {
        let err = CallInput::assemble(Some(&point_schema()), &[Arg::Value(json!(1)), Arg::Value(json!("b"))], &[]);
        assert!(matches!(err, Err(LmError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_output_accessors() {
        assert_eq!(Output::Value(json!(3)).parse_as::<i64>().unwrap(), 3);
        let raw = Output::Raw(Message::assistant("hello"));
        assert_eq!(raw.to_value(), json!("hello"));
        assert_eq!(raw.as_message().unwrap().content, "hello");
        assert!(Output::NoResult.is_no_result());
        assert!(Output::Value(json!("x")).parse_as::<i64>().is_err());
    }

    #[test]
    fn test_call_builder_kwarg_replaces() {
        let call = Call::new().kwarg("x", 1).kwarg("x", 2);
        assert_eq!(call.kwargs().len(), 1);
        assert_eq!(call.kwargs()[0].1, Arg::Value(json!(2)));
    }

    #[tokio::test]
    async fn test_call_unwraps_output() {
        let mock = Arc::new(MockBackend::fixed(r#"Sure! {"output": 42} done"#));
        let out = add().call(&runtime(&mock), Call::new().arg(40).arg(2)).await.unwrap();
        assert_eq!(out, Output::Value(json!(42)));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_prompt_contains_input_and_examples() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
        let call = Call::new().arg(1).arg(2).example(json!({"x": 2, "y": 2}), 4);
        add().call(&runtime(&mock), call).await.unwrap();
        let inputs = mock.inputs();
        let prompt = inputs[0].as_prompt().unwrap();
        assert!(prompt.contains(r#"Input: {"x":1,"y":2}"#));
        assert!(prompt.contains("Examples:\nInput: {\"x\":2,\"y\":2}\nOutput: 4"));
        assert!(prompt.contains("Add two integers."));
    }

    #[tokio::test]
    async fn test_event_order_on_success() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
        let (bus, seen) = recorder();
        add()
            .call(&runtime(&mock), Call::new().arg(1).arg(2).event_bus(bus))
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[..3], ["call_start", "prompt_render", "input_render"]);
        assert_eq!(seen.last().map(String::as_str), Some(SUCCESS));
        let tokens = seen.iter().filter(|n| *n == TOKEN_OR_CHAR).count();
        assert_eq!(tokens, r#"{"output": 3}"#.chars().count());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#).failing_first(2));
        let (bus, seen) = recorder();
        let out = add()
            .call(&runtime(&mock), Call::new().arg(1).arg(2).event_bus(bus))
            .await
            .unwrap();
        assert_eq!(out, Output::Value(json!(3)));
        assert_eq!(mock.calls(), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|n| *n == RETRY).count(), 2);
        assert!(!seen.iter().any(|n| n == EXCEPTION));
    }

    #[tokio::test]
    async fn test_malformed_output_is_retried() {
        let mock = Arc::new(MockBackend::new(vec![
            r#"{"output": }"#.into(),
            "no json at all".into(),
            r#"{"output": 5}"#.into(),
        ]));
        let out = add().call(&runtime(&mock), Call::new().arg(2).arg(3)).await.unwrap();
        assert_eq!(out, Output::Value(json!(5)));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_retried() {
        let mock = Arc::new(MockBackend::new(vec![r#"{"output": "five"}"#.into(), r#"{"output": 5}"#.into()]));
        let out = add().call(&runtime(&mock), Call::new().arg(2).arg(3)).await.unwrap();
        assert_eq!(out, Output::Value(json!(5)));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_reraises_original() {
        let mock = Arc::new(MockBackend::failing());
        let (bus, seen) = recorder();
        let err = add()
            .call(&runtime(&mock), Call::new().arg(1).arg(2).event_bus(bus))
            .await
            .unwrap_err();
        assert!(matches!(err, LmError::Backend { .. }));
        assert_eq!(mock.calls(), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|n| *n == EXCEPTION).count(), 1);
        assert_eq!(seen.last().map(String::as_str), Some(EXCEPTION));
    }

    #[tokio::test]
    async fn test_no_reraise_without_raise_handler_returns_no_result() {
        let mock = Arc::new(MockBackend::failing());
        let call = Call::new()
            .arg(1)
            .arg(2)
            .retry_policy(RetryPolicy::default().with_reraise(false))
            .event_bus(EventBus::new());
        let out = add().call(&runtime(&mock), call).await.unwrap();
        assert!(out.is_no_result());
    }

    #[tokio::test]
    async fn test_no_reraise_with_raise_handler_wraps_error() {
        let mock = Arc::new(MockBackend::failing());
        let call = Call::new()
            .arg(1)
            .arg(2)
            .retry_policy(RetryPolicy::default().with_reraise(false));
        let err = add().call(&runtime(&mock), call).await.unwrap_err();
        match err {
            LmError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, LmError::Backend { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exception_event_carries_context() {
        let mock = Arc::new(MockBackend::fixed("nothing useful"));
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let bus = EventBus::new().on_fn(EXCEPTION, move |e| {
            *sink.lock().unwrap() = Some(e.context());
            Ok(())
        });
        let call = Call::new()
            .arg(1)
            .arg(2)
            .extra("request_id", "r-1")
            .retry_policy(RetryPolicy::none())
            .event_bus(bus);
        assert!(add().call(&runtime(&mock), call).await.is_err());
        let ctx = captured.lock().unwrap().clone().unwrap();
        assert_eq!(ctx["attempt"], json!(1));
        assert_eq!(ctx["completion"], json!(""));
        assert!(ctx["backend_input"].as_str().unwrap().contains("Add two integers."));
        assert_eq!(ctx["extras"]["request_id"], json!("r-1"));
    }

    #[tokio::test]
    async fn test_handler_error_aborts_without_retry() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
        let bus = EventBus::default().on_fn(SUCCESS, |_| Err(LmError::Handler("boom".into())));
        let err = add()
            .call(&runtime(&mock), Call::new().arg(1).arg(2).event_bus(bus))
            .await
            .unwrap_err();
        assert!(matches!(err, LmError::Handler(_)));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_messages_bypass_template() {
        let chat = LanguageFunction::new("chat");
        let mock = Arc::new(MockBackend::fixed("Hello there"));
        let msgs = vec![Message::system("Be kind."), Message::user("Hi")];
        let out = chat
            .call(&runtime(&mock), Call::new().messages(msgs.clone()))
            .await
            .unwrap();
        assert_eq!(out, Output::Raw(Message::assistant("Hello there")));
        assert_eq!(mock.inputs(), vec![BackendInput::Messages(msgs)]);
    }

    #[tokio::test]
    async fn test_description_without_schema_returns_text() {
        let f = LanguageFunction::new("poem").with_description("Write a poem.");
        let mock = Arc::new(MockBackend::fixed("roses {are} red"));
        let out = f.call(&runtime(&mock), Call::new().arg("roses")).await.unwrap();
        assert_eq!(out, Output::Value(json!("roses {are} red")));
    }

    #[tokio::test]
    async fn test_object_output_validated_not_unwrapped() {
        let schema = json!({
            "properties": {"label": {"type": "string"}, "score": {"type": "number", "default": 0.5}},
            "required": ["label"],
            "title": "Sentiment",
            "type": "object"
        });
        let f = LanguageFunction::new("sentiment")
            .with_description("Classify.")
            .with_output_schema(schema);
        let mock = Arc::new(MockBackend::fixed(r#"{"label": "pos", "extra": 1}"#));
        let out = f.call(&runtime(&mock), Call::new().arg("great")).await.unwrap();
        assert_eq!(out.to_value(), json!({"label": "pos", "score": 0.5}));
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let flag = Arc::new(AtomicBool::new(true));
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
        let rt = Runtime::builder(mock.clone()).cancellation(Some(flag.clone())).build();
        let err = add().call(&rt, Call::new().arg(1).arg(2)).await.unwrap_err();
        assert!(matches!(err, LmError::Cancelled));
        assert_eq!(mock.calls(), 0);
        flag.store(false, Ordering::Relaxed);
        assert!(add().call(&rt, Call::new().arg(1).arg(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_interrupted_mid_stream_keeps_partial_text() {
        let flag = Arc::new(AtomicBool::new(false));
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#).with_chunking(Chunking::Chars));
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let trip = flag.clone();
        let bus = EventBus::default()
            .on_fn(TOKEN_OR_CHAR, move |_| {
                trip.store(true, Ordering::Relaxed);
                Ok(())
            })
            .on_fn(EXCEPTION, move |e| {
                *sink.lock().unwrap() = Some(e.context());
                Ok(())
            });
        let rt = Runtime::builder(mock.clone())
            .retry_policy(RetryPolicy::default().with_max_attempts(3))
            .event_bus(bus)
            .cancellation(Some(flag))
            .build();
        let err = add().call(&rt, Call::new().arg(1).arg(2)).await.unwrap_err();
        let LmError::Interrupted { partial } = err else {
            panic!("expected interruption, got {err:?}");
        };
        assert_eq!(partial, "{");
        assert_eq!(mock.calls(), 1);
        let ctx = captured.lock().unwrap().clone().unwrap();
        assert_eq!(ctx["completion"], json!(partial));
    }

    #[tokio::test]
    async fn test_undeclared_keyword_reaches_prompt() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
        add()
            .call(&runtime(&mock), Call::new().arg(1).arg(2).kwarg("z", 9))
            .await
            .unwrap();
        let prompt = match mock.inputs().remove(0) {
            BackendInput::Prompt(p) => p,
            BackendInput::Messages(_) => panic!("expected a rendered prompt"),
        };
        assert!(prompt.contains(r#"Input: {"x":1,"y":2,"z":9}"#));
    }

    #[tokio::test]
    async fn test_invalid_input_fires_exception_and_fails() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
        let (bus, seen) = recorder();
        let err = add()
            .call(&runtime(&mock), Call::new().arg(1).arg("two").event_bus(bus))
            .await
            .unwrap_err();
        assert!(matches!(err, LmError::SchemaMismatch { .. }));
        assert_eq!(mock.calls(), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["call_start", "exception"]);
    }

    #[tokio::test]
    async fn test_per_call_backend_override() {
        let default = Arc::new(MockBackend::fixed(r#"{"output": 1}"#));
        let other = Arc::new(MockBackend::fixed(r#"{"output": 2}"#));
        let out = add()
            .call(&runtime(&default), Call::new().arg(1).arg(1).backend(other.clone()))
            .await
            .unwrap();
        assert_eq!(out, Output::Value(json!(2)));
        assert_eq!((default.calls(), other.calls()), (0, 1));
    }

    #[tokio::test]
    async fn test_call_as_and_handle() {
        let mock = Arc::new(MockBackend::fixed(r#"{"output": 7}"#));
        let rt = runtime(&mock);
        let f = add();
        assert_eq!(f.route(), "/add");
        let n: i64 = f.call_as(&rt, Call::new().arg(3).arg(4)).await.unwrap();
        assert_eq!(n, 7);
        let body = f.handle(&rt, json!({"x": 3, "y": 4})).await.unwrap();
        assert_eq!(body, json!(7));
        let last = mock.inputs().pop().unwrap();
        assert!(last.as_prompt().unwrap().contains(r#"Input: {"x":3,"y":4}"#));
    }
}
