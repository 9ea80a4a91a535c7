//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `shmtensor_puts` | Counter | Tensors written to the store |
//! | `shmtensor_gets` | Counter | Tensors fetched from the store |
//! | `shmtensor_creates` | Counter | Store-owned tensors allocated without payload |
//! | `shmtensor_releases` | Counter | Local mappings released |
//! | `shmtensor_deletes` | Counter | Objects deleted |
//! | `shmtensor_bytes_put` | Counter | Payload bytes copied in |
//! | `shmtensor_bytes_got` | Counter | Payload bytes mapped out |
//! | `shmtensor_copy_time_ns` | Histogram | Payload copy time per put |
//! | `shmtensor_failures` | Counter | Failures, labelled by operation and error kind |
//!
//! Every metric carries an `endpoint` label naming the store.
//!
//! ## Tracing
//!
//! One span per manager operation (`put`, `get`, `create`, `release`,
//! `delete`), debug events for store calls, warnings for ignored failures
//! and errors from deleters that run during drop.
//!
//! ## Example
//!
//! ```rust
//! use shmtensor::observability::init_metrics;
//!
//! // Call once at startup; install any metrics exporter to collect values.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use self::metrics::{ExchangeMetrics, TimerGuard, init_metrics, record_delete, record_failure, record_release};
pub use self::tracing_support::{
    TracingConfig, span_operation, span_store_call, trace_deleter_failure, trace_ignored_not_found,
};
