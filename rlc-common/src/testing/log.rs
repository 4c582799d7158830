//! Structured test logging.
//!
//! Tests open a [`TestGuard`] through the [`test_guard!`](crate::test_guard)
//! macro. The guard installs a test-writer tracing subscriber once per
//! process and logs `TEST START` / `TEST PASS` / `TEST FAIL` lines around the
//! test, so the reconciler logs emitted during a failing test are readable
//! in `cargo test` output.
//!
//! Logging is on in CI (`CI` set) or when `RLC_TEST_LOG` is set; set
//! `RLC_TEST_LOG=0` to silence it.

use std::sync::Once;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a test-writer subscriber. Safe to call many times.
///
/// `RLC_TEST_LOG_LEVEL` sets the level for the workspace crates (default `debug`).
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let level = std::env::var("RLC_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = EnvFilter::try_new(format!("rlc_common={level},rlcd={level},test={level}"))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init();
    });
}

struct TestLogger {
    test_name: String,
    started: Instant,
}

/// RAII guard logging the start and outcome of a test.
pub struct TestGuard {
    inner: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        if !Self::is_enabled() {
            return Self { inner: None };
        }
        init_test_logging();
        tracing::info!(target: "test", "TEST START: {}", test_name);
        Self {
            inner: Some(TestLogger {
                test_name: test_name.to_string(),
                started: Instant::now(),
            }),
        }
    }

    fn is_enabled() -> bool {
        match std::env::var("RLC_TEST_LOG") {
            Ok(value) => !matches!(value.as_str(), "0" | "false" | "off" | ""),
            Err(_) => std::env::var_os("CI").is_some(),
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            let elapsed_ms = logger.started.elapsed().as_millis();
            if std::thread::panicking() {
                tracing::error!(target: "test", "TEST FAIL: {} ({}ms)", logger.test_name, elapsed_ms);
            } else {
                tracing::info!(target: "test", "TEST PASS: {} ({}ms)", logger.test_name, elapsed_ms);
            }
        }
    }
}

/// Create a TestGuard named after the enclosing test function.
///
/// ```ignore
/// #[test]
/// fn test_something() {
///     let _guard = rlc_common::test_guard!();
/// }
/// ```
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
