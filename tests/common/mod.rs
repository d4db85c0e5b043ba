//! Shared test helpers.

use std::sync::Once;
use std::time::{Duration, Instant};

/// Installs a tracing subscriber once per test binary; `RUST_LOG` controls
/// verbosity.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds an engine configuration tuned for fast test shutdown.
#[allow(dead_code)]
pub fn test_config(workers: usize) -> swell::Config {
    swell::Config::builder()
        .worker_threads(workers)
        .poll_timeout(Duration::from_millis(100))
        .build()
        .expect("test config")
}

/// Polls `cond` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
