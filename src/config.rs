//! Configuration for the exchange manager.
//!
//! # Example
//!
//! ```rust
//! use shmtensor::config::ExchangeConfig;
//! use shmtensor::exchange::DeletionPolicy;
//! use std::time::Duration;
//!
//! let config = ExchangeConfig::new("/tmp/plasma")
//!     .with_get_timeout(Duration::from_millis(250))
//!     .with_memcopy_threads(8)
//!     .with_default_policy(DeletionPolicy::ReleaseAndDelete);
//! assert_eq!(config.memcopy_threads, 8);
//! ```

use crate::exchange::DeletionPolicy;
use crate::observability::TracingConfig;
use std::time::Duration;

pub use crate::store::LocalStoreConfig;

/// Default store endpoint.
pub const DEFAULT_ENDPOINT: &str = "/tmp/shmtensor";

/// Configuration for an [`ExchangeManager`](crate::exchange::ExchangeManager).
#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    /// Store endpoint to connect to.
    pub endpoint: String,
    /// Deadline for establishing the store session.
    pub connect_timeout: Duration,
    /// Wait used by [`rebuild`](crate::exchange::ExchangeManager::rebuild).
    pub get_timeout: Duration,
    /// Worker threads for host-to-host payload copies.
    pub memcopy_threads: usize,
    /// Copies at least this large (bytes) are split across workers.
    pub memcopy_threshold: usize,
    /// Deleter policy used by `share` and `create`.
    pub default_policy: DeletionPolicy,
    /// Delete an existing object before `share` writes under its id.
    pub delete_before_create: bool,
    /// Span configuration.
    pub tracing: TracingConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(10),
            get_timeout: Duration::from_millis(1000),
            memcopy_threads: 4,
            memcopy_threshold: 1024 * 1024, // 1 MB
            default_policy: DeletionPolicy::ReleaseOnly,
            delete_before_create: true,
            tracing: TracingConfig::default(),
        }
    }
}

impl ExchangeConfig {
    /// Defaults, connecting to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Copies stay on the calling thread.
    pub fn single_threaded() -> Self {
        Self {
            memcopy_threads: 1,
            ..Self::default()
        }
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default get wait.
    pub fn with_get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }

    /// Set the memcpy worker count.
    pub fn with_memcopy_threads(mut self, threads: usize) -> Self {
        self.memcopy_threads = threads;
        self
    }

    /// Set the parallel memcpy threshold.
    pub fn with_memcopy_threshold(mut self, bytes: usize) -> Self {
        self.memcopy_threshold = bytes;
        self
    }

    /// Set the default deleter policy.
    pub fn with_default_policy(mut self, policy: DeletionPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Set delete-before-create for `share`.
    pub fn with_delete_before_create(mut self, enabled: bool) -> Self {
        self.delete_before_create = enabled;
        self
    }

    /// Set the span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}
