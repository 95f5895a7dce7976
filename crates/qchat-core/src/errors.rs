//! Error types for the QChat message codec
//!
//! This module contains all error types used throughout the codec: decode
//! diagnostics, encode-time programmer errors, upload failures, sequence
//! resolution errors, and the main QchatError type that unifies them all.

// ----------------------------------------------------------------------------
// Decode Errors
// ----------------------------------------------------------------------------

/// Decode-time failure on a recognized but malformed wire payload.
///
/// Carries the offending raw payload (hex) and the decode site so protocol
/// drift is visible in logs and bug reports. These always propagate; the
/// decoder never silently swallows a recognized payload it cannot parse.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed {site} payload: {reason}; payload={payload}")]
    Malformed {
        site: &'static str,
        reason: String,
        payload: String,
    },

    #[error("{site} payload truncated: need {expected} bytes, have {actual}; payload={payload}")]
    Truncated {
        site: &'static str,
        expected: usize,
        actual: usize,
        payload: String,
    },

    #[error("unknown compression flag {flag} in {site} payload; payload={payload}")]
    UnknownCompressionFlag {
        site: &'static str,
        flag: u8,
        payload: String,
    },

    #[error("invalid UTF-8 in {site} payload; payload={payload}")]
    InvalidUtf8 {
        site: &'static str,
        payload: String,
    },
}

impl DecodeError {
    /// Create a malformed-payload error, hex-encoding the raw bytes
    pub fn malformed(site: &'static str, reason: impl Into<String>, payload: &[u8]) -> Self {
        DecodeError::Malformed {
            site,
            reason: reason.into(),
            payload: hex::encode(payload),
        }
    }

    /// Create a truncation error, hex-encoding the raw bytes
    pub fn truncated(site: &'static str, expected: usize, payload: &[u8]) -> Self {
        DecodeError::Truncated {
            site,
            expected,
            actual: payload.len(),
            payload: hex::encode(payload),
        }
    }

    /// Create an invalid-UTF-8 error, hex-encoding the raw bytes
    pub fn invalid_utf8(site: &'static str, payload: &[u8]) -> Self {
        DecodeError::InvalidUtf8 {
            site,
            payload: hex::encode(payload),
        }
    }
}

// ----------------------------------------------------------------------------
// Encode Errors
// ----------------------------------------------------------------------------

/// Encode-time failure. These are programmer errors and always propagate.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("message element {kind} has no wire mapping")]
    Unmappable { kind: &'static str },

    #[error("more than one long message element in one chain")]
    DuplicateLongMessage,

    #[error("forward bundle must be uploaded before encoding")]
    UnresolvedForward,
}

// ----------------------------------------------------------------------------
// Sequence Resolution Errors
// ----------------------------------------------------------------------------

/// Errors from reading an outgoing source's sequence numbers.
///
/// Resolution timeout is deliberately NOT represented here: a timed-out
/// source degrades to an empty id list and reads succeed.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("sequence ids not yet available: resolution still pending")]
    StillPending,
}

// ----------------------------------------------------------------------------
// Upload Errors
// ----------------------------------------------------------------------------

/// Forward-bundle upload failures. Transport errors pass through unchanged;
/// retry policy is a caller decision.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("upload rejected by server: {reason}")]
    Rejected { reason: String },

    #[error("envelope serialization failed: {0}")]
    Envelope(#[from] bincode::Error),

    #[error("envelope compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

impl UploadError {
    /// Create a transport error with a message
    pub fn transport<T: Into<String>>(message: T) -> Self {
        UploadError::Transport(message.into())
    }
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the QChat message codec
#[derive(Debug, thiserror::Error)]
pub enum QchatError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),
}

pub type Result<T> = core::result::Result<T, QchatError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_carries_payload_hex() {
        let err = DecodeError::malformed("rich-msg", "bad template", &[0xDE, 0xAD]);
        let rendered = err.to_string();
        assert!(rendered.contains("rich-msg"));
        assert!(rendered.contains("dead"));
    }

    #[test]
    fn test_truncated_error_reports_lengths() {
        let err = DecodeError::truncated("at-attr", 13, &[0x00; 5]);
        let rendered = err.to_string();
        assert!(rendered.contains("13"));
        assert!(rendered.contains('5'));
    }

    #[test]
    fn test_unified_error_lifts_variants() {
        let err: QchatError = EncodeError::DuplicateLongMessage.into();
        assert!(matches!(err, QchatError::Encode(_)));

        let err: QchatError = ResolveError::StillPending.into();
        assert!(matches!(err, QchatError::Resolve(_)));
    }
}
