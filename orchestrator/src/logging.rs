//! Development-time tracing for the orchestrator.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is not the
//! product trail: entity JSON, the attempt journal and tickets under
//! `.orchestrator/` are always written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. Defaults to `warn` when `RUST_LOG`
/// is unset.
///
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator run task-123
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
