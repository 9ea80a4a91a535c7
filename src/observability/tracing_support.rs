//! Tracing integration for structured logging and spans.

use crate::store::ObjectId;
use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span per manager operation (put, get, create, release).
    pub operation_spans: bool,
    /// Whether to create spans around individual store calls.
    pub store_spans: bool,
    /// Level of operation spans.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            operation_spans: true,
            store_spans: false,
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// All spans, at debug level.
    pub fn all() -> Self {
        Self {
            operation_spans: true,
            store_spans: true,
            level: Level::DEBUG,
        }
    }

    /// Operation spans only.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            operation_spans: false,
            store_spans: false,
            level: Level::INFO,
        }
    }

    /// Span for a manager operation, or a disabled span.
    pub fn operation(&self, operation: &'static str, id: ObjectId) -> Span {
        if !self.operation_spans {
            return Span::none();
        }
        if self.level == Level::DEBUG || self.level == Level::TRACE {
            span!(Level::DEBUG, "exchange", op = operation, id = %id)
        } else {
            span_operation(operation, id)
        }
    }

    /// Span for a store call, or a disabled span.
    pub fn store_call(&self, call: &'static str, id: ObjectId) -> Span {
        if self.store_spans {
            span_store_call(call, id)
        } else {
            Span::none()
        }
    }
}

/// Create a span for a manager operation.
///
/// # Example
///
/// ```rust
/// use shmtensor::observability::span_operation;
/// use shmtensor::store::ObjectId;
///
/// let span = span_operation("put", ObjectId::from_name("x"));
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_operation(operation: &'static str, id: ObjectId) -> Span {
    span!(Level::INFO, "exchange", op = operation, id = %id)
}

/// Create a span for a single store call.
#[inline]
pub fn span_store_call(call: &'static str, id: ObjectId) -> Span {
    span!(Level::TRACE, "store", call = call, id = %id)
}

/// Log a not-found delete that was ignored on purpose.
#[inline]
pub fn trace_ignored_not_found(id: ObjectId) {
    tracing::debug!(%id, "no existing object to delete before create");
}

/// Log a failure in a deleter that could not propagate it.
#[inline]
pub fn trace_deleter_failure(id: Option<ObjectId>, error: &dyn std::error::Error) {
    tracing::error!(?id, error = %error, "tensor deleter failed");
}
