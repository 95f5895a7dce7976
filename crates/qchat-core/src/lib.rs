//! QChat message codec core
//!
//! Client-side implementation of the QChat instant-messaging wire protocol's
//! message subsystem: the bidirectional translation between the semantic
//! message model and the binary wire representation, asynchronous resolution
//! of server-assigned sequence numbers, post-decode refinement, and the
//! multi-part upload protocol for forwarded-message bundles.
//!
//! Network session management stays outside this crate; see [`transport`]
//! for the interfaces the surrounding client must provide.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod forward;
pub mod message;
pub mod protocol;
pub mod refine;
pub mod resolver;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::ProtocolConfig;
pub use errors::{DecodeError, EncodeError, QchatError, ResolveError, Result, UploadError};
pub use forward::{BundleNode, ForwardBundle, ForwardUploader, ROOT_BUNDLE_NAME};
pub use message::{MessageChain, MessageChainBuilder, MessageElement, MessageSource, SourceKind};
pub use protocol::{
    decode_elements, decode_message, encode_chain, EncodeContext, IncomingMeta, TargetContext,
    WireElement,
};
pub use refine::{refine_deep, refine_light, RefineContext, RefineServices};
pub use resolver::{AckRegistry, SequenceHandle, SequenceResolver, SequenceState};
pub use transport::{
    ApplyUploadRequest, ApplyUploadResponse, BundleTransport, ResourceKind, SendReceipt,
    UploadTicket,
};
pub use types::{GroupId, InternalId, SequenceId, Timestamp, UserId};
