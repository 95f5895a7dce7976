//! Application-facing message model
//!
//! - `element`: the closed set of semantic message element variants
//! - `chain`: the ordered container holding them
//! - `source`: provenance records and their lifecycle

pub mod chain;
pub mod element;
pub mod source;

pub use chain::{MessageChain, MessageChainBuilder};
pub use element::{
    CustomExtension, DiceRoll, ForwardRef, ImageKind, ImageRef, LightApp, LongMessageRef,
    MarketFace, MessageElement, MusicKind, MusicShare, Poke, RichService, VipFace, Voice,
};
pub use source::{MessageSource, SourceKind};
