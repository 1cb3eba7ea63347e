//! Tracing subscriber setup for binaries embedding the kernel.

use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug`
/// when `verbose`. Calling this twice is harmless.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
