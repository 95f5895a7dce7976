//! External transport interfaces
//!
//! The codec does not manage network sessions. It requires exactly two
//! capabilities from the surrounding client: feeding correlated send receipts
//! into the ack registry, and the apply/chunked-push upload protocol used for
//! forward bundles and long messages. Both are modeled here as data types and
//! an async trait implemented by the transport layer.

use async_trait::async_trait;

use crate::errors::UploadError;
use crate::types::{InternalId, SequenceId, UserId};

// ----------------------------------------------------------------------------
// Send Receipts
// ----------------------------------------------------------------------------

/// Server acknowledgment of one outgoing message fragment, correlated by the
/// client-generated internal id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub internal_id: InternalId,
    pub sequence_id: SequenceId,
}

// ----------------------------------------------------------------------------
// Bundle Upload Protocol
// ----------------------------------------------------------------------------

/// What kind of stored resource an upload produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    LongMessage,
    ForwardBundle,
}

/// Metadata submitted before a bundle upload
#[derive(Debug, Clone)]
pub struct ApplyUploadRequest {
    pub kind: ResourceKind,
    pub target: UserId,
    pub size: u64,
    /// SHA-256 digest of the compressed envelope
    pub digest: [u8; 32],
}

/// Ticket correlating the chunks of one resumable transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub ticket: Vec<u8>,
    pub key: Vec<u8>,
}

/// Server response to an upload application
#[derive(Debug, Clone)]
pub enum ApplyUploadResponse {
    /// The blob is already stored; no transfer needed
    Exists { res_id: String },
    /// The blob must be pushed through the chunked transfer
    Required { res_id: String, ticket: UploadTicket },
}

/// Transport-side implementation of the bundle upload/download protocol.
///
/// Errors are propagated to callers unchanged; this crate applies no retry
/// policy. Transfers are not cancellable from here.
#[async_trait]
pub trait BundleTransport: Send + Sync {
    /// Submit envelope metadata and learn whether a transfer is needed
    async fn apply_upload(
        &self,
        request: ApplyUploadRequest,
    ) -> Result<ApplyUploadResponse, UploadError>;

    /// Push one chunk of the compressed envelope, correlated by ticket
    async fn upload_chunk(
        &self,
        ticket: &UploadTicket,
        offset: u64,
        chunk: &[u8],
    ) -> Result<(), UploadError>;

    /// Fetch a stored bundle envelope (compressed) by resource id
    async fn download_bundle(&self, res_id: &str) -> Result<Vec<u8>, UploadError>;
}
