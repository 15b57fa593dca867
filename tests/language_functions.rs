use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use lm_functions::events::{Dispatch, CALL_START, EXCEPTION, SUCCESS};
use lm_functions::schema::Structural;
use lm_functions::signature::Signature;
use lm_functions::{
    handlers, lmdef, structural, BackendInput, Call, Event, EventBus, EventKind, Format, LanguageFunction, LmError,
    MockBackend, Output, Response, RetryPolicy, Runtime,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

structural! {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Recipe {
        pub title: String,
        pub minutes: u32,
        pub steps: Vec<String>,
        pub vegetarian: Option<bool>,
    }
}

lmdef! {
    /// Add two integers
    /// and return their sum.
    fn add(x: i64, y: i64) -> i64;

    /// Invent a recipe for the dish.
    fn invent(dish: String) -> Recipe;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn object_schema() -> Value {
    json!({"properties": {"a": {"type": "integer"}}, "title": "A", "type": "object"})
}

fn counting_stream(fragments: &[&str], pulled: Arc<AtomicUsize>) -> Response {
    let owned: Vec<String> = fragments.iter().map(|s| s.to_string()).collect();
    Response::from_stream(stream::iter(owned).map(move |f| {
        pulled.fetch_add(1, Ordering::SeqCst);
        Ok::<_, LmError>(f)
    }))
}

#[test]
fn serialization_round_trip_is_byte_identical() {
    let f = invent().unwrap();
    assert_eq!(f.description(), "Invent a recipe for the dish.");
    assert_eq!(f.output_schema(), Some(&Recipe::schema().to_json_schema()));
    assert_eq!(f.output_wrapper(), None);

    for format in [Format::Yaml, Format::Json] {
        let first = f.dumps(format).unwrap();
        let back = LanguageFunction::from_string(&first, format).unwrap();
        assert_eq!(back, f);
        assert_eq!(back.dumps(format).unwrap(), first, "{format} round trip");
    }
}

#[test]
fn doc_lines_collapse_into_description() {
    let f = add().unwrap();
    assert_eq!(f.description(), "Add two integers and return their sum.");
    assert_eq!(f.output_wrapper(), Some("output"));
}

#[tokio::test]
async fn parse_is_idempotent() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let mut response = counting_stream(&["{\"a\":", " 1}"], pulled.clone());
    let schema = object_schema();
    let first = response.process(Some(&schema), None, &mut |_| Ok(())).await.unwrap();
    let mut calls = 0;
    let second = response
        .process(Some(&schema), None, &mut |_| {
            calls += 1;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(first, json!({"a": 1}));
    assert_eq!(second, first);
    assert_eq!(calls, 0);
    assert_eq!(pulled.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn brace_depth_extraction_stops_at_balanced_object() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let fragments = ["noise ", "{\"a\":", "{\"b\":1}", "}", " tail", " more"];
    let mut response = counting_stream(&fragments, pulled.clone());
    let schema = json!({"type": "object"});
    let value = response.process(Some(&schema), None, &mut |_| Ok(())).await.unwrap();
    assert_eq!(value, json!({"a": {"b": 1}}));
    assert_eq!(response.text(), "{\"a\":{\"b\":1}}");
    assert_eq!(pulled.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn parser_recovers_after_invalid_span() {
    let mut response = Response::from_text("{bad} then {\"ok\": true}");
    let schema = json!({"type": "object"});
    let value = response.process(Some(&schema), None, &mut |_| Ok(())).await.unwrap();
    assert_eq!(value, json!({"ok": true}));
}

#[tokio::test]
async fn whitespace_only_response_fails_to_parse() {
    let mut response = Response::from_text("   \n ");
    let schema = object_schema();
    let err = response.process(Some(&schema), None, &mut |_| Ok(())).await.unwrap_err();
    assert!(matches!(err, LmError::MalformedOutput { .. }));
}

#[tokio::test]
async fn positional_and_keyword_inputs_normalize_identically() {
    init_tracing();
    let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
    let rt = Runtime::new(mock.clone());
    let f = add().unwrap();

    for call in [
        Call::new().arg(1).arg(2),
        Call::new().kwarg("x", 1).kwarg("y", 2),
        Call::new().arg(1).kwarg("y", 2),
    ] {
        assert_eq!(f.call(&rt, call).await.unwrap(), Output::Value(json!(3)));
    }

    let prompts: Vec<String> = mock
        .inputs()
        .into_iter()
        .filter_map(|i| match i {
            BackendInput::Prompt(p) => Some(p),
            BackendInput::Messages(_) => None,
        })
        .collect();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].contains(r#"Input: {"x":1,"y":2}"#));
    assert!(prompts.iter().all(|p| *p == prompts[0]));
}

#[tokio::test]
async fn synthetic_wrapper_is_unwrapped() {
    let f = add().unwrap();
    let rt = Runtime::new(Arc::new(MockBackend::fixed(r#"{"output": 42}"#)));
    let out = f.call(&rt, Call::new().arg(40).arg(2)).await.unwrap();
    assert_eq!(out.into_value(), json!(42));
}

#[tokio::test]
async fn structured_output_parses_into_record() {
    let completion = r#"Here you go: {"title": "Dal", "minutes": 30, "steps": ["soak", "boil"]}"#;
    let rt = Runtime::new(Arc::new(MockBackend::fixed(completion)));
    let recipe: Recipe = invent().unwrap().call_as(&rt, Call::new().arg("lentils")).await.unwrap();
    assert_eq!(recipe.title, "Dal");
    assert_eq!(recipe.steps.len(), 2);
    assert_eq!(recipe.vegetarian, None);
}

#[tokio::test]
async fn retry_exhaustion_propagates_original_error() {
    init_tracing();
    let mock = Arc::new(MockBackend::failing());
    let rt = Runtime::builder(mock.clone())
        .retry_policy(RetryPolicy::default().with_max_attempts(3))
        .build();
    let err = add().unwrap().call(&rt, Call::new().arg(1).arg(2)).await.unwrap_err();
    assert!(matches!(err, LmError::Backend { .. }));
    assert_eq!(mock.calls(), 3);
}

#[test]
fn composed_buses_run_left_before_right() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tag = |label: &'static str| {
        let seen = seen.clone();
        EventBus::new().on_fn(CALL_START, move |_| {
            seen.lock().unwrap().push(label);
            Ok(())
        })
    };
    let bus = tag("a") + tag("b");
    let event = Event::new(
        "f",
        Arc::new(Map::new()),
        EventKind::CallStart {
            args: vec![],
            kwargs: Map::new(),
            examples: 0,
            backend: "mock".into(),
        },
    );
    assert_eq!(bus.emit(&event).unwrap(), Dispatch::Continue);
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);

    let mut bus = tag("c");
    bus += EventBus::default();
    assert!(bus.raises_on(EXCEPTION));
    assert_eq!(bus.handlers(CALL_START).len(), 1);
}

#[tokio::test]
async fn timing_preset_records_stats() {
    let (bus, timing) = handlers::time_events();
    let mock = Arc::new(MockBackend::fixed(r#"{"output": 3}"#));
    let rt = Runtime::builder(mock).event_bus(bus).build();
    add().unwrap().call(&rt, Call::new().arg(1).arg(2)).await.unwrap();
    let stats = timing.last_stats().expect("stats after success");
    assert_eq!(stats.completion_chars, r#"{"output": 3}"#.len());
    assert!(stats.prompt_chars > 0);
}

#[tokio::test]
async fn console_log_preset_does_not_raise() {
    init_tracing();
    let rt = Runtime::builder(Arc::new(MockBackend::failing()))
        .retry_policy(RetryPolicy::none().with_reraise(false))
        .event_bus(handlers::console_log())
        .build();
    let out = add().unwrap().call(&rt, Call::new().arg(1).arg(2)).await.unwrap();
    assert!(out.is_no_result());
}

#[tokio::test]
async fn handle_serves_unwrapped_output() {
    let rt = Runtime::new(Arc::new(MockBackend::fixed(r#"{"output": 9}"#)));
    let f = add().unwrap();
    assert_eq!(f.route(), "/add");
    assert_eq!(f.handle(&rt, json!({"x": 4, "y": 5})).await.unwrap(), json!(9));

    let echo = LanguageFunction::from_signature(&Signature::new("echo").param::<String>("text").returns::<String>())
        .unwrap();
    let rt = Runtime::new(Arc::new(MockBackend::fixed("hello back")));
    assert_eq!(echo.handle(&rt, json!("hello")).await.unwrap(), json!("hello back"));
}

#[tokio::test]
async fn success_event_carries_completion() {
    let captured = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    let bus = EventBus::default().on_fn(SUCCESS, move |e| {
        *sink.lock().unwrap() = Some(e.context());
        Ok(())
    });
    let rt = Runtime::builder(Arc::new(MockBackend::fixed(r#"ok {"output": 3} bye"#)))
        .event_bus(bus)
        .build();
    add().unwrap().call(&rt, Call::new().arg(1).arg(2)).await.unwrap();
    let ctx = captured.lock().unwrap().clone().unwrap();
    assert_eq!(ctx["completion"], json!(r#"{"output": 3}"#));
    assert_eq!(ctx["parsed"], json!({"output": 3}));
    assert_eq!(ctx["output"], json!(3));
    assert_eq!(ctx["input"], json!({"x": 1, "y": 2}));
}
