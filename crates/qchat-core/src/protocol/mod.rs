//! Wire protocol codec
//!
//! - `wire`: the wire element vocabulary and binary attribute codecs
//! - `tlv`: the shared tag-length-value container
//! - `encode`: message chain → ordered wire elements
//! - `decode`: ordered wire elements → message chain, with legacy cleanup

pub mod decode;
pub mod encode;
pub mod tlv;
pub mod wire;

pub use decode::{decode_elements, decode_message, IncomingMeta};
pub use encode::{encode_chain, EncodeContext, EncodeMode, TargetContext};
pub use tlv::{TagWidth, Tlv};
pub use wire::{AtAttr, FlaggedPayload, WireElement};
