//! Test-side tracing setup.

use tracing_subscriber::EnvFilter;

/// Install a subscriber routed through the libtest capture writer, filtered
/// by `RUST_LOG` (default `info`).
///
/// Idempotent: the first caller in the process wins, later calls are no-ops,
/// so every test can call this unconditionally.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
