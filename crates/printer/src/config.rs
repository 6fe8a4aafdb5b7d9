//! Transfer settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size of a single read frame on the IN endpoint
pub const READ_FRAME_SIZE: usize = 64;

/// Bulk transfer timeouts
///
/// A timeout of 0 means "wait forever" (libusb semantics). Opening the
/// device never times out regardless of these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Timeout for bulk OUT transfers in milliseconds
    #[serde(default = "TransferConfig::default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Timeout for bulk IN transfers in milliseconds
    #[serde(default = "TransferConfig::default_read_timeout")]
    pub read_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: Self::default_write_timeout(),
            read_timeout_ms: Self::default_read_timeout(),
        }
    }
}

impl TransferConfig {
    fn default_write_timeout() -> u64 {
        5000
    }

    fn default_read_timeout() -> u64 {
        // Printers rarely have status data pending; keep reads short.
        100
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.write_timeout(), Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransferConfig = toml::from_str("write_timeout_ms = 0").unwrap();
        assert_eq!(config.write_timeout_ms, 0);
        assert_eq!(config.read_timeout_ms, 100);
    }
}
