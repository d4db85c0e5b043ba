//! Engine configuration.
//!
//! [`Config`] holds the values that drive the dispatch loop. Use
//! [`ConfigBuilder`] for discoverable setters with `build()`-time
//! validation; `Config::default()` is a reasonable starting point for
//! servers.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `task_queue_limit` | 16 |
//! | `backlog_capacity` | 256 |
//! | `poll_timeout` | 1 s |
//! | `max_descriptors` | `None` (use `RLIMIT_NOFILE`) |

use std::thread;
use std::time::Duration;

/// Configuration for a [`Reactor`](crate::Reactor).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads started by
    /// [`service::start`](crate::service::start). Additional threads can be
    /// added later with [`Reactor::add_thread`](crate::Reactor::add_thread).
    pub worker_threads: usize,
    /// Deferred-task queue depth above which a worker drains one task before
    /// it is allowed to poll, bounding queue growth under I/O-heavy load.
    pub task_queue_limit: usize,
    /// Maximum number of readiness events collected by one multiplexer wait.
    pub backlog_capacity: usize,
    /// Upper bound on one blocking multiplexer wait, so the loop observes the
    /// end flag even when no events arrive.
    pub poll_timeout: Duration,
    /// Override for the handler-table size. `None` sizes the table from the
    /// process descriptor limit at construction.
    pub max_descriptors: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism().map_or(1, usize::from),
            task_queue_limit: 16,
            backlog_capacity: 256,
            poll_timeout: Duration::from_secs(1),
            max_descriptors: None,
        }
    }
}

impl Config {
    /// Returns a builder initialized with the defaults.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`] with `build()` validation.
#[derive(Debug, Default, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a builder initialized with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the number of worker threads started by `service::start`.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Sets the deferred-task drain threshold.
    #[must_use]
    pub fn task_queue_limit(mut self, n: usize) -> Self {
        self.config.task_queue_limit = n;
        self
    }

    /// Sets the event backlog capacity for one wait call.
    #[must_use]
    pub fn backlog_capacity(mut self, n: usize) -> Self {
        self.config.backlog_capacity = n;
        self
    }

    /// Bounds one blocking multiplexer wait.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    /// Overrides the handler-table size.
    #[must_use]
    pub fn max_descriptors(mut self, n: usize) -> Self {
        self.config.max_descriptors = Some(n);
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field when a value is out of
    /// range (zero workers, zero backlog, zero poll timeout, or a descriptor
    /// override of zero).
    pub fn build(self) -> Result<Config, String> {
        let c = &self.config;
        if c.worker_threads == 0 {
            return Err("worker_threads must be at least 1".into());
        }
        if c.backlog_capacity == 0 {
            return Err("backlog_capacity must be at least 1".into());
        }
        if c.poll_timeout.is_zero() {
            return Err("poll_timeout must be non-zero".into());
        }
        if c.max_descriptors == Some(0) {
            return Err("max_descriptors must be at least 1 when set".into());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConfigBuilder::new().build().expect("defaults must build");
        assert!(config.worker_threads >= 1);
        assert_eq!(config.task_queue_limit, 16);
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(ConfigBuilder::new().worker_threads(0).build().is_err());
    }

    #[test]
    fn rejects_zero_poll_timeout() {
        let result = ConfigBuilder::new()
            .poll_timeout(Duration::from_millis(0))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn descriptor_override_applies() {
        let config = Config::builder().max_descriptors(512).build().unwrap();
        assert_eq!(config.max_descriptors, Some(512));
    }
}
