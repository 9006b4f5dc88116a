//! Diagnostic tracing for fixloop runs.
//!
//! Logs go to stderr and are for operators only. Outcomes users need to see
//! are posted as issue and pull request comments.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` (e.g. `fixloop=info`).
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=fixloop=debug fixloop code --issue 12
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
