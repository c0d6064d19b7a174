//! Shared `tracing` subscriber setup for both the router and connector binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes a process-wide subscriber.
///
/// `default_directive` is used only when `RUST_LOG` is unset, e.g.
/// `"cranker_router=info,cranker_core=info"`.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Like [`init`] but returns an error instead of panicking if already initialized.
pub fn try_init(default_directive: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
}
