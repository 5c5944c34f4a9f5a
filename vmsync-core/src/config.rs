//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! idle_timeout = 1200     # seconds without an exchange before eviction
//! sweep_interval = 60     # seconds between idle sweeps
//! codec = "json"          # or "msgpack"
//! max_frame_bytes = 1048576
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::transport::FrameCodec;

/// Default idle timeout: 20 minutes.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 20 * 60;

/// Default interval between idle sweeps: 1 minute.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default maximum inbound frame size: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Seconds without an exchange before an instance is evicted.
    pub idle_timeout: u64,
    /// Seconds between idle sweeps.
    pub sweep_interval: u64,
    pub codec: FrameCodec,
    /// Inbound frames larger than this are dropped.
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            codec: FrameCodec::Json,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.idle_timeout(), Duration::from_secs(1200));
    }

    #[test]
    fn fields_override_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            idle_timeout = 30
            codec = "msgpack"
            "#,
        )
        .unwrap();

        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.codec, FrameCodec::MessagePack);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(SyncConfig::from_toml_str("idle_timeot = 30").is_err());
    }
}
