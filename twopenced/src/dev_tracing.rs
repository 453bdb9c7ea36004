//! Logging setup for the daemon.
//!
//! The teacher gates this behind `RUST_LOG` as a bench/test convenience;
//! here it is the daemon's only logging surface, so it always installs a
//! subscriber and just lets `RUST_LOG` (if set) control verbosity.

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber. `default_level` is used when
/// `RUST_LOG` is unset; otherwise `RUST_LOG` wins entirely.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
