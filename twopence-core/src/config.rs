//! Runtime configuration, built from the environment and overridable
//! by the daemon binary's CLI flags.

use std::path::PathBuf;
use std::time::Duration;

/// Socket path used when neither `TWOPENCE_SOCKET` nor a CLI flag sets
/// one.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/twopence/twopence.sock";

/// Mirrors the original server's `DEFAULT_COMMAND_TIMEOUT`.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u32 = 60;

/// Soft cap on a connection's queued-but-unsent outbound bytes before
/// its source channels stop reading.
pub const DEFAULT_HWM_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_path: PathBuf,
    pub keepalive: Option<Duration>,
    pub default_command_timeout_secs: u32,
    pub outbound_high_water_bytes: usize,
    pub max_packet_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            keepalive: None,
            default_command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            outbound_high_water_bytes: DEFAULT_HWM_BYTES,
            max_packet_payload: crate::codec::MAX_PAYLOAD_LEN,
        }
    }
}

impl Config {
    /// Build a `Config` from the environment, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = std::env::var("TWOPENCE_SOCKET") {
            cfg.bind_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("TWOPENCE_COMMAND_TIMEOUT") {
            if let Ok(secs) = secs.parse::<u32>() {
                cfg.default_command_timeout_secs = secs;
            }
        }
        if let Ok(bytes) = std::env::var("TWOPENCE_HWM_BYTES") {
            if let Ok(bytes) = bytes.parse::<usize>() {
                cfg.outbound_high_water_bytes = bytes;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_is_absent() {
        std::env::remove_var("TWOPENCE_SOCKET");
        std::env::remove_var("TWOPENCE_COMMAND_TIMEOUT");
        std::env::remove_var("TWOPENCE_HWM_BYTES");
        let cfg = Config::from_env();
        assert_eq!(cfg.bind_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(cfg.default_command_timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
        assert_eq!(cfg.outbound_high_water_bytes, DEFAULT_HWM_BYTES);
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("TWOPENCE_SOCKET", "/tmp/custom.sock");
        std::env::set_var("TWOPENCE_COMMAND_TIMEOUT", "120");
        std::env::set_var("TWOPENCE_HWM_BYTES", "4096");
        let cfg = Config::from_env();
        assert_eq!(cfg.bind_path, PathBuf::from("/tmp/custom.sock"));
        assert_eq!(cfg.default_command_timeout_secs, 120);
        assert_eq!(cfg.outbound_high_water_bytes, 4096);
        std::env::remove_var("TWOPENCE_SOCKET");
        std::env::remove_var("TWOPENCE_COMMAND_TIMEOUT");
        std::env::remove_var("TWOPENCE_HWM_BYTES");
    }
}
