//! Protocol configuration
//!
//! Tunable knobs for the codec and its asynchronous collaborators. Defaults
//! match the behavior of official clients where one is known.

use core::time::Duration;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Protocol Configuration
// ----------------------------------------------------------------------------

/// Configuration for the message codec and its async collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Per-fragment budget for awaiting a send receipt, in milliseconds.
    /// Total timeout for a chain split into N fragments is N times this.
    pub ack_timeout_per_fragment_ms: u64,
    /// Chunk size for the resumable bundle upload, in bytes
    pub upload_chunk_size: usize,
    /// Payloads below this size are stored with the raw (0x00) compression
    /// flag instead of being deflated
    pub compression_threshold: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout_per_fragment_ms: 3_000, // official client waits 3s per fragment
            upload_chunk_size: 8192,
            compression_threshold: 64,
        }
    }
}

impl ProtocolConfig {
    /// Per-fragment receipt budget as a Duration
    pub fn ack_timeout_per_fragment(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_per_fragment_ms)
    }

    /// Total receipt budget for a chain split into `fragments` wire messages
    pub fn ack_timeout_for(&self, fragments: usize) -> Duration {
        Duration::from_millis(self.ack_timeout_per_fragment_ms * fragments.max(1) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_scales_with_fragment_count() {
        let config = ProtocolConfig::default();
        assert_eq!(config.ack_timeout_for(1), Duration::from_millis(3_000));
        assert_eq!(config.ack_timeout_for(2), Duration::from_millis(6_000));
        // A zero fragment count never produces a zero timeout
        assert_eq!(config.ack_timeout_for(0), Duration::from_millis(3_000));
    }
}
