//! Core types for the QChat message codec
//!
//! This module defines the fundamental identifier types used throughout the
//! codec, using newtype patterns for semantic validation and type safety.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// User Identifier
// ----------------------------------------------------------------------------

/// Numeric account identifier of a user (sender or direct-message target)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserId(pub u64);

impl UserId {
    /// Get the raw numeric value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Low 32 bits, as carried in fixed-width wire attribute blocks
    pub const fn truncated(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Group Identifier
// ----------------------------------------------------------------------------

/// Numeric identifier of a group conversation
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupId(pub u64);

impl GroupId {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GroupId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Unix timestamp in seconds, as used by message heads and source records
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp from unix seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Get the raw unix seconds value
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(secs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Correlation Identifiers
// ----------------------------------------------------------------------------

/// Client-generated random correlation id attached to an outgoing message
/// fragment and echoed back in the server's send receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalId(pub u32);

impl InternalId {
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Draw a fresh random correlation id
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned per-message ordering identifier, unknown for outgoing
/// messages until the correlated receipt arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u32);

impl SequenceId {
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_truncation() {
        let id = UserId(0x1_0000_0042);
        assert_eq!(id.truncated(), 0x42);
        assert_eq!(UserId(123).truncated(), 123);
    }

    #[test]
    fn test_timestamp_now_is_nonzero() {
        assert!(Timestamp::now().as_secs() > 0);
    }

    #[test]
    fn test_internal_id_random_draws_differ() {
        // Vanishingly unlikely to collide across 8 draws
        let ids: Vec<InternalId> = (0..8).map(|_| InternalId::random()).collect();
        assert!(ids.windows(2).any(|w| w[0] != w[1]));
    }
}
