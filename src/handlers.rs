//! Standard event handlers and ready-made bus presets.
//!
//! Presets other than [`time_events`] carry no re-raise terminal. Put them
//! *before* a re-raising bus so their `exception` handlers still run:
//!
//! ```
//! use lm_functions::{handlers, EventBus};
//!
//! let bus = handlers::console_log() + EventBus::default();
//! assert!(bus.raises_on("exception"));
//! ```

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::Level;

use crate::error::{LmError, Result};
use crate::events::{
    Event, EventBus, EventHandler, EventKind, Handler, CALL_START, EXCEPTION, PROMPT_RENDER, RETRY, SUCCESS,
    TOKEN_OR_CHAR,
};

/// Writes each fragment to stdout as it arrives.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenPrinter;

impl EventHandler for TokenPrinter {
    fn on_event(&self, event: &Event) -> Result<()> {
        if let EventKind::TokenOrChar { token_or_char, .. } = &event.kind {
            let mut out = std::io::stdout().lock();
            out.write_all(token_or_char.as_bytes())?;
            out.flush()?;
        }
        Ok(())
    }
}

fn select(event: &Event, keys: &[String]) -> Map<String, Value> {
    let mut ctx = event.context();
    keys.iter()
        .filter_map(|k| ctx.remove(k).map(|v| (k.clone(), v)))
        .collect()
}

/// Logs a message plus selected context keys through `tracing`.
#[derive(Debug, Clone)]
pub struct LogHandler {
    level: Level,
    message: String,
    keys: Vec<String>,
}

impl LogHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            level: Level::INFO,
            message: message.into(),
            keys: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Context keys to include, in output order. Missing keys are skipped.
    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

impl EventHandler for LogHandler {
    fn on_event(&self, event: &Event) -> Result<()> {
        let vars = Value::Object(select(event, &self.keys)).to_string();
        let function = event.function.as_str();
        let name = event.name();
        let message = self.message.as_str();
        match self.level {
            Level::ERROR => tracing::error!(function, event = name, %vars, "{}", message),
            Level::WARN => tracing::warn!(function, event = name, %vars, "{}", message),
            Level::INFO => tracing::info!(function, event = name, %vars, "{}", message),
            Level::DEBUG => tracing::debug!(function, event = name, %vars, "{}", message),
            _ => tracing::trace!(function, event = name, %vars, "{}", message),
        }
        Ok(())
    }
}

/// Appends one line per event to a file:
/// `<unix seconds> - <function> - <LEVEL> - <message> <json vars>`.
#[derive(Debug)]
pub struct FileLogHandler {
    file: Mutex<File>,
    level: Level,
    message: String,
    keys: Vec<String>,
}

impl FileLogHandler {
    pub fn open(path: impl AsRef<Path>, message: impl Into<String>, keys: &[&str]) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            level: Level::INFO,
            message: message.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        })
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

impl EventHandler for FileLogHandler {
    fn on_event(&self, event: &Event) -> Result<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let vars = Value::Object(select(event, &self.keys));
        let line = format!(
            "{:.3} - {} - {} - {} {}\n",
            stamp, event.function, self.level, self.message, vars
        );
        let mut file = self
            .file
            .lock()
            .map_err(|_| LmError::Handler("log file lock poisoned".into()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Timing statistics for one successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStats {
    pub prompt_chars: usize,
    pub completion_chars: usize,
    pub time_to_prompt_render: Duration,
    pub time_to_first_token: Option<Duration>,
    /// First fragment measured from the last prompt render.
    pub time_to_first_token_backend_only: Option<Duration>,
    pub backend_time: Duration,
    pub total_time: Duration,
}

impl CallStats {
    pub fn completion_chars_per_second(&self) -> Option<f64> {
        let secs = self.total_time.as_secs_f64();
        (secs > 0.0).then(|| self.completion_chars as f64 / secs)
    }
}

#[derive(Debug, Default)]
struct Timeline {
    first: HashMap<&'static str, Instant>,
    last: HashMap<&'static str, Instant>,
    prompt_chars: usize,
}

impl Timeline {
    fn mark(&mut self, name: &'static str, at: Instant) {
        self.first.entry(name).or_insert(at);
        self.last.insert(name, at);
    }

    /// Earliest `to` minus latest `from`.
    fn between(&self, to: &str, from: &str) -> Option<Duration> {
        let end = self.first.get(to)?;
        let start = self.last.get(from)?;
        Some(end.saturating_duration_since(*start))
    }
}

/// Records event timestamps per call and reports [`CallStats`] on success.
///
/// Timelines are keyed by [`Event::call_id`], so concurrent calls sharing a
/// bus are timed independently. Stats are logged at `INFO` and the most
/// recent ones kept for [`last_stats`](Self::last_stats).
#[derive(Debug, Default)]
pub struct TimingHandler {
    timelines: Mutex<HashMap<u64, Timeline>>,
    last: Mutex<Option<CallStats>>,
}

impl TimingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_stats(&self) -> Option<CallStats> {
        self.last.lock().ok().and_then(|s| s.clone())
    }

    /// Calls started but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.timelines.lock().map(|t| t.len()).unwrap_or_default()
    }
}

impl EventHandler for TimingHandler {
    fn on_event(&self, event: &Event) -> Result<()> {
        let now = Instant::now();
        let mut timelines = self
            .timelines
            .lock()
            .map_err(|_| LmError::Handler("timing state lock poisoned".into()))?;
        if let EventKind::CallStart { .. } = event.kind {
            timelines.insert(event.call_id, Timeline::default());
        }
        let timeline = timelines.entry(event.call_id).or_default();
        timeline.mark(event.name(), now);

        match &event.kind {
            EventKind::PromptRender { prompt, .. } => {
                timeline.prompt_chars = prompt.chars().count();
            }
            EventKind::Success { completion, .. } => {
                let stats = CallStats {
                    prompt_chars: timeline.prompt_chars,
                    completion_chars: completion.chars().count(),
                    time_to_prompt_render: timeline
                        .between(PROMPT_RENDER, CALL_START)
                        .unwrap_or_default(),
                    time_to_first_token: timeline.between(TOKEN_OR_CHAR, CALL_START),
                    time_to_first_token_backend_only: timeline.between(TOKEN_OR_CHAR, PROMPT_RENDER),
                    backend_time: timeline.between(SUCCESS, PROMPT_RENDER).unwrap_or_default(),
                    total_time: timeline.between(SUCCESS, CALL_START).unwrap_or_default(),
                };
                timelines.remove(&event.call_id);
                tracing::info!(
                    function = %event.function,
                    call_id = event.call_id,
                    prompt_chars = stats.prompt_chars,
                    completion_chars = stats.completion_chars,
                    time_to_prompt_render = ?stats.time_to_prompt_render,
                    time_to_first_token = ?stats.time_to_first_token,
                    backend_time = ?stats.backend_time,
                    total_time = ?stats.total_time,
                    "call stats"
                );
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(stats);
                }
            }
            EventKind::Exception { .. } => {
                timelines.remove(&event.call_id);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Print fragments to stdout as they arrive.
pub fn token_stream() -> EventBus {
    EventBus::new().on(TOKEN_OR_CHAR, TokenPrinter)
}

type LogEntry = (&'static str, &'static str, &'static [&'static str], Level);

const LOG_ENTRIES: [LogEntry; 6] = [
    (CALL_START, "Call started", &["args", "kwargs", "examples", "backend"], Level::INFO),
    (PROMPT_RENDER, "Prompt rendered", &["prompt"], Level::INFO),
    (TOKEN_OR_CHAR, "New token/char processed", &["token_or_char"], Level::INFO),
    (RETRY, "Retrying", &["attempt", "wait", "elapsed", "reason"], Level::INFO),
    (EXCEPTION, "Exception occurred", &["attempt", "error"], Level::ERROR),
    (SUCCESS, "Call succeeded", &["input", "completion", "parsed", "output"], Level::INFO),
];

/// Log lifecycle events through `tracing`; exceptions at `ERROR`.
pub fn console_log() -> EventBus {
    LOG_ENTRIES
        .iter()
        .fold(EventBus::new(), |bus, (event, message, keys, level)| {
            bus.on(*event, LogHandler::new(*message).with_keys(keys).with_level(*level))
        })
}

/// Append lifecycle events to `path`.
pub fn file_log(path: impl AsRef<Path>) -> Result<EventBus> {
    let path = path.as_ref();
    let mut bus = EventBus::new();
    for (event, message, keys, level) in LOG_ENTRIES {
        bus = bus.on(event, FileLogHandler::open(path, message, keys)?.with_level(level));
    }
    Ok(bus)
}

/// Time each call and log [`CallStats`] on success; re-raises on exception.
///
/// The returned handler can be queried after a call.
pub fn time_events() -> (EventBus, Arc<TimingHandler>) {
    let timing = Arc::new(TimingHandler::new());
    let mut bus = EventBus::new();
    for event in [CALL_START, PROMPT_RENDER, TOKEN_OR_CHAR, SUCCESS, EXCEPTION] {
        bus.push(event, Handler::Callback(timing.clone()));
    }
    (bus.raise_on(EXCEPTION), timing)
}
