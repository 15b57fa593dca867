//! Runtime shared across language function calls.
//!
//! [`Runtime`] carries the backend, retry policy, event bus and an optional
//! cancellation flag. Build it once and pass it to every call; a
//! [`Call`](crate::Call) may override the first three per invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{LmError, Result};
use crate::events::EventBus;
use crate::retry::RetryPolicy;

/// Shared configuration for language function calls.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lm_functions::{handlers, EventBus, MockBackend, RetryPolicy, Runtime};
///
/// let rt = Runtime::builder(Arc::new(MockBackend::fixed("hi")))
///     .retry_policy(RetryPolicy::default().with_max_attempts(5))
///     .event_bus(handlers::token_stream() + EventBus::default())
///     .build();
/// assert!(!rt.is_cancelled());
/// ```
pub struct Runtime {
    pub backend: Arc<dyn Backend>,
    pub retry_policy: RetryPolicy,
    /// Default: re-raise on `exception`.
    pub event_bus: EventBus,
    /// Checked before each attempt and between fragments.
    pub cancellation: Option<Arc<AtomicBool>>,
}

impl Runtime {
    /// A runtime with the default retry policy and event bus.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::builder(backend).build()
    }

    pub fn builder(backend: Arc<dyn Backend>) -> RuntimeBuilder {
        RuntimeBuilder {
            backend,
            retry_policy: None,
            event_bus: None,
            cancellation: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(LmError::Cancelled);
        }
        Ok(())
    }

    pub fn cancel_flag(&self) -> Option<&AtomicBool> {
        self.cancellation.as_deref()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.name())
            .field("model", &self.backend.model())
            .field("retry_policy", &self.retry_policy)
            .field("event_bus", &self.event_bus)
            .field("has_cancellation", &self.cancellation.is_some())
            .finish()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    backend: Arc<dyn Backend>,
    retry_policy: Option<RetryPolicy>,
    event_bus: Option<EventBus>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl RuntimeBuilder {
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Replace the default bus. Compose with `EventBus::default()` to keep
    /// errors propagating.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = cancel;
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            backend: self.backend,
            retry_policy: self.retry_policy.unwrap_or_default(),
            event_bus: self.event_bus.unwrap_or_default(),
            cancellation: self.cancellation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::events::EXCEPTION;

    #[test]
    fn test_defaults() {
        let rt = Runtime::new(Arc::new(MockBackend::fixed("x")));
        assert_eq!(rt.retry_policy, RetryPolicy::default());
        assert!(rt.event_bus.raises_on(EXCEPTION));
        assert!(rt.check_cancelled().is_ok());
    }

    #[test]
    fn test_cancellation_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let rt = Runtime::builder(Arc::new(MockBackend::fixed("x")))
            .cancellation(Some(flag.clone()))
            .build();
        assert!(!rt.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(rt.check_cancelled(), Err(LmError::Cancelled)));
    }

    #[test]
    fn test_debug_names_backend() {
        let rt = Runtime::new(Arc::new(MockBackend::fixed("x")));
        let debug = format!("{rt:?}");
        assert!(debug.contains("mock"));
    }
}
