//! Tracing bootstrap for binaries and demos.

use tracing_subscriber::EnvFilter;

/// Installs a compact subscriber honoring `RUST_LOG`, falling back to the
/// given level. Safe to call more than once; later calls are no-ops.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
