//! Logging bootstrap for hosting runners.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global subscriber honouring `RUST_LOG` with the configured
/// fallback level. Safe to call once per process; later calls are ignored.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
