//! # LM Functions
//!
//! Functions whose body is a language model call.
//!
//! A [`LanguageFunction`] is declared by its signature and description. The
//! crate derives JSON schemas for its input and output, renders a
//! metaprompt, calls a [`Backend`], extracts the first balanced JSON object
//! from the (possibly streamed) completion, validates it and unwraps
//! synthetic wrappers, retrying on failure and reporting every step on an
//! [`EventBus`].
//!
//! ## Core Concepts
//!
//! - **[`Signature`](signature::Signature)** / **[`lmdef!`]**: explicit
//!   reflection; parameters and return type become schemas.
//! - **[`LanguageFunction`]**: serializable value (YAML/JSON) with a lazily
//!   compiled view.
//! - **[`Runtime`]**: backend, retry policy, event bus and cancellation
//!   shared across calls; [`Call`] carries arguments and per-call overrides.
//! - **[`Response`]**: completion text or fragment stream plus the
//!   brace-depth streaming parser.
//! - **[`EventBus`]**: named lifecycle hooks, composable with `+`; the
//!   [`handlers`] module has logging, timing and token-printing presets.
//! - **[`RetryPolicy`]**: stop and wait strategies compiled for the retry
//!   loop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use lm_functions::{handlers, lmdef, Call, EventBus, OllamaBackend, Runtime};
//!
//! lmdef! {
//!     /// Translate the text into the target language.
//!     fn translate(text: String, language: String) -> String;
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rt = Runtime::builder(Arc::new(OllamaBackend::from_env().with_stream(true)))
//!         .event_bus(handlers::token_stream() + EventBus::default())
//!         .build();
//!
//!     let translate = translate()?;
//!     let text: String = translate
//!         .call_as(&rt, Call::new().arg("Good morning").kwarg("language", "French"))
//!         .await?;
//!     println!("{text}");
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without a model
//!
//! ```
//! use std::sync::Arc;
//! use lm_functions::{lmdef, Call, MockBackend, Output, Runtime};
//!
//! lmdef! {
//!     /// Add two numbers.
//!     fn add(x: i64, y: i64) -> i64;
//! }
//!
//! # tokio_test::block_on(async {
//! let rt = Runtime::new(Arc::new(MockBackend::fixed(r#"{"output": 3}"#)));
//! let out = add().unwrap().call(&rt, Call::new().arg(1).arg(2)).await.unwrap();
//! assert_eq!(out, Output::Value(serde_json::json!(3)));
//! # });
//! ```

pub mod backend;
pub mod call;
pub mod error;
pub mod events;
pub mod function;
pub mod handlers;
pub mod message;
pub mod prompt;
pub mod response;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod signature;
pub mod store;
pub mod streaming;

pub use backend::{Backend, BackendInput, Chunking, MockBackend, OllamaBackend};
pub use call::{Arg, Call, CallInput, Output};
pub use error::{LmError, Result};
pub use events::{Event, EventBus, EventHandler, EventKind, FnEventHandler, Handler};
pub use function::{Format, LanguageFunction};
pub use message::{Message, Role};
pub use response::{Fragment, Response};
pub use retry::{RetryParameters, RetryPolicy, StopType, WaitType};
pub use runtime::{Runtime, RuntimeBuilder};
pub use schema::{Schema, SchemaRegistry, Structural};
pub use signature::Signature;
pub use store::{FileStore, ObjectStore};
