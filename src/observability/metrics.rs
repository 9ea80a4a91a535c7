//! Metrics collection using metrics-rs.

use crate::error::ErrorKind;
use metrics::{Counter, Histogram, Unit, counter, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const PUTS: &str = "shmtensor_puts";
const GETS: &str = "shmtensor_gets";
const CREATES: &str = "shmtensor_creates";
const RELEASES: &str = "shmtensor_releases";
const DELETES: &str = "shmtensor_deletes";
const BYTES_PUT: &str = "shmtensor_bytes_put";
const BYTES_GOT: &str = "shmtensor_bytes_got";
const COPY_TIME_NS: &str = "shmtensor_copy_time_ns";
const FAILURES: &str = "shmtensor_failures";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(PUTS, Unit::Count, "Tensors written to the store");
    metrics::describe_counter!(GETS, Unit::Count, "Tensors fetched from the store");
    metrics::describe_counter!(CREATES, Unit::Count, "Store-owned tensors allocated without payload");
    metrics::describe_counter!(RELEASES, Unit::Count, "Local store mappings released");
    metrics::describe_counter!(DELETES, Unit::Count, "Store objects deleted");
    metrics::describe_counter!(BYTES_PUT, Unit::Bytes, "Payload bytes copied into the store");
    metrics::describe_counter!(BYTES_GOT, Unit::Bytes, "Payload bytes mapped from the store");
    metrics::describe_histogram!(
        COPY_TIME_NS,
        Unit::Nanoseconds,
        "Time to copy one payload into a store buffer"
    );
    metrics::describe_counter!(FAILURES, Unit::Count, "Failed exchange operations by error kind");
}

/// Record a released mapping.
#[inline]
pub fn record_release(endpoint: &str) {
    counter!(RELEASES, "endpoint" => endpoint.to_string()).increment(1);
}

/// Record a deleted object.
#[inline]
pub fn record_delete(endpoint: &str) {
    counter!(DELETES, "endpoint" => endpoint.to_string()).increment(1);
}

/// Record a failed operation.
#[inline]
pub fn record_failure(endpoint: &str, operation: &'static str, kind: ErrorKind) {
    counter!(
        FAILURES,
        "endpoint" => endpoint.to_string(),
        "operation" => operation,
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Metrics collector for one exchange manager.
///
/// Handles are registered once with the endpoint label so the hot path only
/// increments.
#[derive(Clone)]
pub struct ExchangeMetrics {
    endpoint: String,
    puts: Counter,
    gets: Counter,
    creates: Counter,
    bytes_put: Counter,
    bytes_got: Counter,
    copy_time: Histogram,
}

impl ExchangeMetrics {
    /// Create a collector labelled with `endpoint`.
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            puts: counter!(PUTS, "endpoint" => endpoint.to_string()),
            gets: counter!(GETS, "endpoint" => endpoint.to_string()),
            creates: counter!(CREATES, "endpoint" => endpoint.to_string()),
            bytes_put: counter!(BYTES_PUT, "endpoint" => endpoint.to_string()),
            bytes_got: counter!(BYTES_GOT, "endpoint" => endpoint.to_string()),
            copy_time: histogram!(COPY_TIME_NS, "endpoint" => endpoint.to_string()),
        }
    }

    /// Record a completed put.
    #[inline]
    pub fn record_put(&self, bytes: usize) {
        self.puts.increment(1);
        self.bytes_put.increment(bytes as u64);
    }

    /// Record a completed get.
    #[inline]
    pub fn record_get(&self, bytes: usize) {
        self.gets.increment(1);
        self.bytes_got.increment(bytes as u64);
    }

    /// Record a completed create.
    #[inline]
    pub fn record_create(&self) {
        self.creates.increment(1);
    }

    /// Record payload copy time.
    #[inline]
    pub fn record_copy_time(&self, duration: Duration) {
        self.copy_time.record(duration.as_nanos() as f64);
    }

    /// Record a failure of `operation`.
    #[inline]
    pub fn record_failure(&self, operation: &'static str, kind: ErrorKind) {
        record_failure(&self.endpoint, operation, kind);
    }

    /// Start a timer that records copy time when dropped.
    pub fn start_copy_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// The endpoint label.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Guard that records copy time when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a ExchangeMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_copy_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_exchange_metrics() {
        let metrics = ExchangeMetrics::new("/tmp/test-store");
        metrics.record_put(1024);
        metrics.record_get(1024);
        metrics.record_create();
        metrics.record_failure("put", ErrorKind::ObjectExists);
        {
            let _timer = metrics.start_copy_timer();
        }
        assert_eq!(metrics.endpoint(), "/tmp/test-store");
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed; these must be no-ops.
        record_release("ep");
        record_delete("ep");
        record_failure("ep", "get", ErrorKind::Timeout);
    }
}
