//! Diagnostic logging.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global tracing subscriber.
///
/// Diagnostics go to stderr so that zone output on stdout stays clean.
/// Repeated calls are fine; only the first one installs the subscriber,
/// which keeps tests that run multiple commands in one process working.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .try_init();
    });
}
