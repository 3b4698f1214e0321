//! Relay configuration types.

use serde::{Deserialize, Serialize};

use rangesync_core::sync::SyncConfig;
use rangesync_core::wire::DEFAULT_RANGES_MAX_SIZE;

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Byte budget for the ranges section of one reconciliation frame.
    pub ranges_max_size: usize,
    /// Hard bound on reconciliation rounds per session.
    pub max_rounds: u32,
    /// Bounded outbound channel capacity per connection.
    pub outbound_channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ranges_max_size: DEFAULT_RANGES_MAX_SIZE,
            max_rounds: 64,
            outbound_channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// The reconciliation driver view of this configuration.
    #[must_use]
    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            ranges_max_size: self.ranges_max_size,
            max_rounds: self.max_rounds,
            ..SyncConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.ranges_max_size, 1024 * 1024);
        assert_eq!(config.max_rounds, 64);
        assert_eq!(config.outbound_channel_capacity, 256);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: RelayConfig = serde_json::from_str(r#"{"max_rounds": 8}"#).unwrap();
        assert_eq!(config.max_rounds, 8);
        assert_eq!(config.outbound_channel_capacity, 256);
    }
}
