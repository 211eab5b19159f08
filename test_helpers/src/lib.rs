//! Utilities for tests across the workspace.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Once;

pub use tempfile;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the RUST_LOG environment variable is set.
/// Set `RUST_LOG=debug` (or a finer filter) to see log output from a test run.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start logging based on the `RUST_LOG` environment variable filter.
/// Safe to call from multiple tests; only the first call installs the
/// subscriber.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        // route `log` records from dependencies through `tracing`
        let _ = tracing_log::LogTracer::init();

        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        observability_deps::tracing::subscriber::set_global_default(subscriber)
            .expect("subscriber installed twice");
    });
}

/// Asserts that `haystack` contains `needle`, with a useful failure message.
#[macro_export]
macro_rules! assert_contains {
    ($haystack:expr, $needle:expr) => {{
        let haystack_value = $haystack.to_string();
        let needle_value = $needle.to_string();
        assert!(
            haystack_value.contains(&needle_value),
            "Can not find\n\n{:?}\n\nin\n\n{:?}",
            needle_value,
            haystack_value,
        );
    }};
}
