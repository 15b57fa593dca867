use thiserror::Error;

/// Errors produced by language functions and their collaborators.
#[derive(Error, Debug)]
pub enum LmError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// HTTP error with status code and response body.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider answers with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Any other failure raised while invoking a backend.
    #[error("backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// The completion could not be decoded as JSON when a structured
    /// value was required.
    #[error("malformed model output: {source}")]
    MalformedOutput {
        #[source]
        source: serde_json::Error,
        /// Accumulated completion text that failed to decode.
        text: String,
    },

    /// The decoded value does not satisfy the declared output schema.
    #[error("output does not match schema '{schema}': {reason}")]
    SchemaMismatch { schema: String, reason: String },

    /// Invalid function signature or definition. Raised before any call.
    #[error("invalid language function definition: {0}")]
    Construction(String),

    /// Serialization was requested in a format that is not supported.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// JSON (de)serialization failed outside of output parsing.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event handler failed while processing an event.
    #[error("event handler failed: {0}")]
    Handler(String),

    /// The call was cancelled before an attempt started.
    #[error("call was cancelled")]
    Cancelled,

    /// Fragment iteration was interrupted; `partial` holds the text
    /// accumulated up to that point.
    #[error("response interrupted after {} characters", partial.chars().count())]
    Interrupted { partial: String },

    /// Every attempt failed and the retry policy does not re-raise the
    /// original error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<LmError>,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl LmError {
    /// Whether the retry loop may attempt the call again after this error.
    ///
    /// Backend, transport, malformed-output and schema-mismatch failures are
    /// retryable. Definition errors, cancellation and interruption are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LmError::Construction(_)
                | LmError::UnsupportedFormat(_)
                | LmError::Cancelled
                | LmError::Interrupted { .. }
                | LmError::RetryExhausted { .. }
        )
    }
}

impl From<anyhow::Error> for LmError {
    fn from(err: anyhow::Error) -> Self {
        LmError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LmError>;
