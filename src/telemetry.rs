//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive, e.g. `nodevec=debug`.
pub const LOG_ENV: &str = "NODEVEC_LOG";

/// Install the global `tracing` subscriber.
///
/// `NODEVEC_LOG` wins when set; otherwise the level is `debug` when `verbose`
/// and `info` when not. Safe to call more than once: later calls are ignored.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
