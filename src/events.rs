//! Event bus for language function lifecycle hooks.
//!
//! An [`EventBus`] maps event names to ordered handler lists. Handlers run
//! synchronously in registration order and are not isolated from each
//! other: the first handler error stops dispatch and propagates to the
//! caller. Buses compose with `+`, concatenating handler lists per name.
//!
//! | Name            | Fired                                          |
//! |-----------------|------------------------------------------------|
//! | `call_start`    | before input assembly                          |
//! | `prompt_render` | after the metaprompt is rendered               |
//! | `input_render`  | after the backend input is ready, every attempt|
//! | `token_or_char` | once per kept response fragment                |
//! | `retry`         | before sleeping between attempts               |
//! | `success`       | after the output is built                      |
//! | `exception`     | once, when the call fails after retries        |

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendInput;
use crate::error::Result;

pub const CALL_START: &str = "call_start";
pub const PROMPT_RENDER: &str = "prompt_render";
pub const INPUT_RENDER: &str = "input_render";
pub const TOKEN_OR_CHAR: &str = "token_or_char";
pub const RETRY: &str = "retry";
pub const SUCCESS: &str = "success";
pub const EXCEPTION: &str = "exception";

/// A lifecycle event together with the call it belongs to.
#[derive(Debug, Clone)]
pub struct Event {
    /// Name of the language function being called.
    pub function: String,
    /// Identifies the call within the process; every event of one call
    /// shares it. Zero for events built outside a call.
    pub call_id: u64,
    /// Free-form values supplied by the caller for handlers.
    pub extras: Arc<Map<String, Value>>,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    CallStart {
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        examples: usize,
        backend: String,
    },
    PromptRender {
        attempt: u32,
        prompt: String,
    },
    InputRender {
        attempt: u32,
        input: Value,
        backend_input: BackendInput,
    },
    TokenOrChar {
        token_or_char: String,
        depth: i64,
        in_json: bool,
        open_braces: usize,
        closed_braces: usize,
    },
    Retry {
        /// The attempt that just failed (1-indexed).
        attempt: u32,
        /// Pending wait before the next attempt.
        wait: Duration,
        /// Time since the first attempt started.
        elapsed: Duration,
        reason: String,
    },
    Success {
        attempt: u32,
        input: Value,
        backend_input: BackendInput,
        completion: String,
        parsed: Value,
        output: Value,
    },
    Exception {
        attempt: u32,
        error: String,
        retryable: bool,
        /// Completion text accumulated before the failure, if any.
        completion: Option<String>,
        backend_input: Option<BackendInput>,
    },
}

impl Event {
    pub fn new(function: impl Into<String>, extras: Arc<Map<String, Value>>, kind: EventKind) -> Self {
        Self {
            function: function.into(),
            call_id: 0,
            extras,
            kind,
        }
    }

    pub fn with_call_id(mut self, call_id: u64) -> Self {
        self.call_id = call_id;
        self
    }

    /// The bus channel this event is dispatched on.
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::CallStart { .. } => CALL_START,
            EventKind::PromptRender { .. } => PROMPT_RENDER,
            EventKind::InputRender { .. } => INPUT_RENDER,
            EventKind::TokenOrChar { .. } => TOKEN_OR_CHAR,
            EventKind::Retry { .. } => RETRY,
            EventKind::Success { .. } => SUCCESS,
            EventKind::Exception { .. } => EXCEPTION,
        }
    }

    /// Flat map of the named values carried by this event.
    ///
    /// Always contains `event` and `function`, then the event's own fields,
    /// then `extras` when non-empty.
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        ctx.insert("event".into(), json!(self.name()));
        ctx.insert("function".into(), json!(self.function));
        let fields = match &self.kind {
            EventKind::CallStart {
                args,
                kwargs,
                examples,
                backend,
            } => json!({"args": args, "kwargs": kwargs, "examples": examples, "backend": backend}),
            EventKind::PromptRender { attempt, prompt } => {
                json!({"attempt": attempt, "prompt": prompt})
            }
            EventKind::InputRender {
                attempt,
                input,
                backend_input,
            } => json!({"attempt": attempt, "input": input, "backend_input": backend_input.to_value()}),
            EventKind::TokenOrChar {
                token_or_char,
                depth,
                in_json,
                open_braces,
                closed_braces,
            } => json!({
                "token_or_char": token_or_char,
                "depth": depth,
                "in_json": in_json,
                "open_braces": open_braces,
                "closed_braces": closed_braces,
            }),
            EventKind::Retry {
                attempt,
                wait,
                elapsed,
                reason,
            } => json!({
                "attempt": attempt,
                "wait": wait.as_secs_f64(),
                "elapsed": elapsed.as_secs_f64(),
                "reason": reason,
            }),
            EventKind::Success {
                attempt,
                input,
                backend_input,
                completion,
                parsed,
                output,
            } => json!({
                "attempt": attempt,
                "input": input,
                "backend_input": backend_input.to_value(),
                "completion": completion,
                "parsed": parsed,
                "output": output,
            }),
            EventKind::Exception {
                attempt,
                error,
                retryable,
                completion,
                backend_input,
            } => json!({
                "attempt": attempt,
                "error": error,
                "retryable": retryable,
                "completion": completion,
                "backend_input": backend_input.as_ref().map(BackendInput::to_value),
            }),
        };
        if let Value::Object(fields) = fields {
            ctx.extend(fields);
        }
        if !self.extras.is_empty() {
            ctx.insert("extras".into(), Value::Object((*self.extras).clone()));
        }
        ctx
    }
}

/// Handler for lifecycle events.
///
/// Returning an error stops dispatch and fails the operation that fired
/// the event.
///
/// # Example
///
/// ```
/// use lm_functions::events::{Event, EventHandler, EventKind};
///
/// struct PrintTokens;
///
/// impl EventHandler for PrintTokens {
///     fn on_event(&self, event: &Event) -> lm_functions::Result<()> {
///         if let EventKind::TokenOrChar { token_or_char, .. } = &event.kind {
///             print!("{}", token_or_char);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event) -> Result<()>;
}

/// An [`EventHandler`] backed by a closure.
pub struct FnEventHandler<F: Fn(&Event) -> Result<()> + Send + Sync>(pub F);

impl<F: Fn(&Event) -> Result<()> + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: &Event) -> Result<()> {
        (self.0)(event)
    }
}

/// One entry in a handler list.
#[derive(Clone)]
pub enum Handler {
    Callback(Arc<dyn EventHandler>),
    /// Terminal handler: stop dispatch and tell the caller to re-raise the
    /// error that triggered the event. Only meaningful on `exception`.
    Raise,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Callback(_) => f.write_str("Callback"),
            Handler::Raise => f.write_str("Raise"),
        }
    }
}

/// Outcome of a dispatch that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Every handler ran.
    Continue,
    /// A [`Handler::Raise`] was reached.
    Raise,
}

/// Named-channel handler registry.
///
/// [`EventBus::default`] re-raises on `exception`; [`EventBus::new`] is
/// empty.
#[derive(Clone)]
pub struct EventBus {
    handlers: HashMap<String, Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Append `handler` to the list for `event`.
    pub fn on(mut self, event: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.push(event, Handler::Callback(Arc::new(handler)));
        self
    }

    /// Append a closure handler to the list for `event`.
    pub fn on_fn<F>(self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.on(event, FnEventHandler(f))
    }

    /// Append the re-raise terminal to the list for `event`.
    pub fn raise_on(mut self, event: impl Into<String>) -> Self {
        self.push(event, Handler::Raise);
        self
    }

    pub fn push(&mut self, event: impl Into<String>, handler: Handler) {
        self.handlers.entry(event.into()).or_default().push(handler);
    }

    pub fn handlers(&self, event: &str) -> &[Handler] {
        self.handlers.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the `event` list contains the re-raise terminal.
    pub fn raises_on(&self, event: &str) -> bool {
        self.handlers(event).iter().any(|h| matches!(h, Handler::Raise))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }

    /// Run the handlers registered for `event.name()` in order.
    pub fn emit(&self, event: &Event) -> Result<Dispatch> {
        let handlers = self.handlers(event.name());
        if handlers.is_empty() {
            return Ok(Dispatch::Continue);
        }
        tracing::trace!(event = event.name(), handlers = handlers.len(), "dispatching event");
        for handler in handlers {
            match handler {
                Handler::Callback(h) => h.on_event(event)?,
                Handler::Raise => return Ok(Dispatch::Raise),
            }
        }
        Ok(Dispatch::Continue)
    }

    /// A new bus with `other`'s handlers appended after `self`'s, per name.
    pub fn compose(mut self, other: EventBus) -> EventBus {
        for (event, handlers) in other.handlers {
            self.handlers.entry(event).or_default().extend(handlers);
        }
        self
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new().raise_on(EXCEPTION)
    }
}

impl Add for EventBus {
    type Output = EventBus;

    fn add(self, rhs: EventBus) -> EventBus {
        self.compose(rhs)
    }
}

impl AddAssign for EventBus {
    fn add_assign(&mut self, rhs: EventBus) {
        let lhs = std::mem::take(&mut self.handlers);
        *self = EventBus { handlers: lhs }.compose(rhs);
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        f.debug_map().entries(names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LmError;
    use std::sync::Mutex;

    fn event(name: &str) -> Event {
        let kind = match name {
            EXCEPTION => EventKind::Exception {
                attempt: 1,
                error: "boom".into(),
                retryable: true,
                completion: None,
                backend_input: None,
            },
            _ => EventKind::PromptRender {
                attempt: 1,
                prompt: "p".into(),
            },
        };
        Event::new("f", Arc::new(Map::new()), kind)
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl EventHandler {
        let log = Arc::clone(log);
        FnEventHandler(move |_: &Event| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new()
            .on(PROMPT_RENDER, recorder(&log, "a"))
            .on(PROMPT_RENDER, recorder(&log, "b"));
        assert_eq!(bus.emit(&event(PROMPT_RENDER)).unwrap(), Dispatch::Continue);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_compose_concatenates_left_then_right() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let left = EventBus::new().on(PROMPT_RENDER, recorder(&log, "h1"));
        let right = EventBus::new()
            .on(PROMPT_RENDER, recorder(&log, "h2"))
            .on(SUCCESS, recorder(&log, "s"));
        let bus = left + right;
        bus.emit(&event(PROMPT_RENDER)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2"]);
        assert_eq!(bus.handlers(SUCCESS).len(), 1);
    }

    #[test]
    fn test_add_assign() {
        let mut bus = EventBus::new();
        bus += EventBus::default();
        assert!(bus.raises_on(EXCEPTION));
    }

    #[test]
    fn test_handler_error_stops_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new()
            .on_fn(PROMPT_RENDER, |_| Err(LmError::Handler("nope".into())))
            .on(PROMPT_RENDER, recorder(&log, "never"));
        let err = bus.emit(&event(PROMPT_RENDER)).unwrap_err();
        assert!(matches!(err, LmError::Handler(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_bus_raises_on_exception() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(&event(EXCEPTION)).unwrap(), Dispatch::Raise);
        assert_eq!(bus.emit(&event(PROMPT_RENDER)).unwrap(), Dispatch::Continue);
    }

    #[test]
    fn test_raise_stops_later_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new()
            .on(EXCEPTION, recorder(&log, "before"))
            .raise_on(EXCEPTION)
            .on(EXCEPTION, recorder(&log, "after"));
        assert_eq!(bus.emit(&event(EXCEPTION)).unwrap(), Dispatch::Raise);
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
    }

    #[test]
    fn test_context_contains_fields_and_extras() {
        let mut extras = Map::new();
        extras.insert("user".into(), json!("ada"));
        let ev = Event::new(
            "greet",
            Arc::new(extras),
            EventKind::TokenOrChar {
                token_or_char: "{".into(),
                depth: 0,
                in_json: false,
                open_braces: 1,
                closed_braces: 0,
            },
        );
        let ctx = ev.context();
        assert_eq!(ctx["event"], "token_or_char");
        assert_eq!(ctx["function"], "greet");
        assert_eq!(ctx["open_braces"], 1);
        assert_eq!(ctx["extras"]["user"], "ada");
    }
}
