//! Wire element vocabulary and binary attribute codecs
//!
//! A message body on the wire is a flat, ordered list of typed elements. This
//! module defines that vocabulary as a closed enum (every dispatch site over
//! it is exhaustively matched), the fixed-layout attribute blocks some
//! elements carry, and the compression-flag-byte payload helper shared by
//! light-app and rich-service elements.

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression as ZlibCompression};
use std::io::{Read, Write};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the mention attribute block attached to a text element
pub const AT_ATTR_SIZE: usize = 13;

/// Legacy fixed buffer carried by classic face elements
pub const FACE_LEGACY_BUF: [u8; 8] = [0x00, 0x01, 0x00, 0x04, 0x52, 0xCC, 0xF5, 0xD0];

/// Base for the legacy two-byte pair carried by classic face elements
pub const FACE_LEGACY_BASE: u16 = 0x1441;

/// Common-element service types
pub const COMMON_SERVICE_POKE: u16 = 2;
pub const COMMON_SERVICE_FLASH_IMAGE: u16 = 3;
pub const COMMON_SERVICE_VIP_FACE: u16 = 23;
pub const COMMON_SERVICE_FACE_V2: u16 = 33;

// ----------------------------------------------------------------------------
// Wire Elements
// ----------------------------------------------------------------------------

/// One unit of the flat, typed element list exchanged with the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireElement {
    /// Plain text run, optionally carrying a mention attribute block
    Text(TextElem),
    /// Classic emoticon face
    Face(FaceElem),
    /// Embedded provenance snapshot of a quoted message
    SourceRef(SourceRefElem),
    /// Group image (server-confirmed variants carry a direct URL)
    GroupImage(ImageElem),
    /// Friend image (server-confirmed variants carry a direct URL)
    FriendImage(ImageElem),
    /// Voice clip
    Voice(VoiceElem),
    /// Marketplace sticker
    MarketFace(MarketFaceElem),
    /// Generic element keyed by service type; payload is a TLV container
    Common(CommonElem),
    /// Structured app share; payload prefixed with a compression-flag byte
    LightApp(LightAppElem),
    /// Rich templated service message; payload prefixed with a
    /// compression-flag byte
    RichMsg(RichMsgElem),
    /// Client-extension payload, opaque to the server
    Custom(CustomElem),
    /// Trailing capability flags understood by official clients
    GeneralFlags(GeneralFlagsElem),
    /// Auxiliary display hints
    ExtraInfo(ExtraInfoElem),
    /// Bare flags marker appended to source snapshots
    Flags2,
}

impl WireElement {
    /// Short name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireElement::Text(_) => "text",
            WireElement::Face(_) => "face",
            WireElement::SourceRef(_) => "source-ref",
            WireElement::GroupImage(_) => "group-image",
            WireElement::FriendImage(_) => "friend-image",
            WireElement::Voice(_) => "voice",
            WireElement::MarketFace(_) => "market-face",
            WireElement::Common(_) => "common",
            WireElement::LightApp(_) => "light-app",
            WireElement::RichMsg(_) => "rich-msg",
            WireElement::Custom(_) => "custom",
            WireElement::GeneralFlags(_) => "general-flags",
            WireElement::ExtraInfo(_) => "extra-info",
            WireElement::Flags2 => "flags2",
        }
    }
}

/// Text run. `at_attr` is empty for plain text and holds the fixed mention
/// attribute block when this text renders an @-mention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextElem {
    pub content: String,
    pub at_attr: Vec<u8>,
}

impl TextElem {
    /// Plain text without mention attributes
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            at_attr: Vec::new(),
        }
    }

    /// Mention text with a packed attribute block
    pub fn mention(content: impl Into<String>, attr: AtAttr) -> Self {
        Self {
            content: content.into(),
            at_attr: attr.pack().to_vec(),
        }
    }

    pub fn is_mention(&self) -> bool {
        !self.at_attr.is_empty()
    }
}

/// Classic face: numeric index plus the legacy two-byte pair and fixed buffer
/// older clients require
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceElem {
    pub index: u16,
    pub old: [u8; 2],
    pub buf: Vec<u8>,
}

impl FaceElem {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            old: (FACE_LEGACY_BASE + index).to_be_bytes(),
            buf: FACE_LEGACY_BUF.to_vec(),
        }
    }
}

/// Provenance snapshot embedded ahead of a quoted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRefElem {
    pub orig_seqs: Vec<u32>,
    pub sender: u64,
    pub target: u64,
    pub time: u64,
    /// Correlation ids of the original message fragments
    pub orig_uids: Vec<u64>,
    /// Re-encoded elements of the original message (no capability flags)
    pub elems: Vec<WireElement>,
    pub flag: u32,
}

/// Image element shared by the group and friend variants. Offline
/// (locally constructed) images have no URL; online ones do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageElem {
    /// Identifier derived from the content hash
    pub image_id: String,
    pub md5: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub size: u32,
    /// Numeric format tag (jpeg/png/gif/...)
    pub format: u32,
    pub is_emoji: bool,
    pub url: Option<String>,
}

/// Voice clip metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceElem {
    pub name: String,
    pub md5: Vec<u8>,
    pub size: u32,
    pub codec: u32,
    pub download_token: Vec<u8>,
}

/// Marketplace sticker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketFaceElem {
    pub tab_id: u32,
    pub name: String,
    pub item_type: u32,
    pub sub_type: u32,
    pub face_id: Vec<u8>,
    pub key: Vec<u8>,
    pub mobile_param: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Generic element keyed by service type; the payload is a TLV container
/// whose layout depends on the service type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonElem {
    pub service_type: u16,
    pub business_type: u32,
    pub payload: Vec<u8>,
}

/// Structured app share; `data` = compression-flag byte + payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightAppElem {
    pub data: Vec<u8>,
}

/// Rich templated service message; `template` = compression-flag byte +
/// payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichMsgElem {
    pub service_id: u32,
    pub template: Vec<u8>,
}

/// Client-extension element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomElem {
    pub enum_type: u32,
    pub data: Vec<u8>,
}

/// Trailing capability flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralFlagsElem {
    pub long_text_flag: u8,
    pub long_text_res_id: String,
    pub pb_reserve: Vec<u8>,
}

/// Auxiliary display hints (emitted after marketplace stickers)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraInfoElem {
    pub flags: u32,
    pub group_mask: u32,
}

// ----------------------------------------------------------------------------
// Mention Attribute Block
// ----------------------------------------------------------------------------

/// Fixed 13-byte attribute block attached to mention text: 2-byte version,
/// 2-byte start offset, 2-byte text length, 1-byte flag, 4-byte target id,
/// 2-byte reserved. All fields big-endian. Flag 1 marks an @-all mention
/// with target id zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtAttr {
    pub version: u16,
    pub start: u16,
    pub text_len: u16,
    pub flag: u8,
    pub target: u32,
    pub reserved: u16,
}

impl AtAttr {
    /// Attribute block for a single-member mention
    pub fn member(target: u32, text_len: u16) -> Self {
        Self {
            version: 1,
            start: 0,
            text_len,
            flag: 0,
            target,
            reserved: 0,
        }
    }

    /// Attribute block for an @-all mention
    pub fn everyone(text_len: u16) -> Self {
        Self {
            version: 1,
            start: 0,
            text_len,
            flag: 1,
            target: 0,
            reserved: 0,
        }
    }

    pub fn is_at_all(&self) -> bool {
        self.flag == 1 || self.target == 0
    }

    /// Pack into the fixed wire layout
    pub fn pack(&self) -> [u8; AT_ATTR_SIZE] {
        let mut out = [0u8; AT_ATTR_SIZE];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.start.to_be_bytes());
        out[4..6].copy_from_slice(&self.text_len.to_be_bytes());
        out[6] = self.flag;
        out[7..11].copy_from_slice(&self.target.to_be_bytes());
        out[11..13].copy_from_slice(&self.reserved.to_be_bytes());
        out
    }

    /// Parse from the fixed wire layout
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < AT_ATTR_SIZE {
            return Err(DecodeError::truncated("at-attr", AT_ATTR_SIZE, data));
        }
        Ok(Self {
            version: u16::from_be_bytes([data[0], data[1]]),
            start: u16::from_be_bytes([data[2], data[3]]),
            text_len: u16::from_be_bytes([data[4], data[5]]),
            flag: data[6],
            target: u32::from_be_bytes([data[7], data[8], data[9], data[10]]),
            reserved: u16::from_be_bytes([data[11], data[12]]),
        })
    }
}

// ----------------------------------------------------------------------------
// Flagged Payload Compression
// ----------------------------------------------------------------------------

/// Compression-flag-byte payload codec shared by light-app and rich-service
/// elements: byte 0x00 prefixes a raw UTF-8 payload, 0x01 a zlib-deflated
/// one. Any other flag is protocol drift and decodes to an error.
pub struct FlaggedPayload;

impl FlaggedPayload {
    /// Encode with the raw (0x00) flag
    pub fn encode_raw(content: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + content.len());
        out.push(0x00);
        out.extend_from_slice(content.as_bytes());
        out
    }

    /// Encode with the deflate (0x01) flag
    pub fn encode_deflated(content: &str) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(vec![0x01], ZlibCompression::default());
        // Writing into a Vec cannot fail
        encoder.write_all(content.as_bytes()).expect("vec write");
        encoder.finish().expect("vec finish")
    }

    /// Encode, deflating only when the content reaches `threshold` bytes
    pub fn encode(content: &str, threshold: usize) -> Vec<u8> {
        if content.len() >= threshold {
            Self::encode_deflated(content)
        } else {
            Self::encode_raw(content)
        }
    }

    /// Decode a flagged payload into its UTF-8 content
    pub fn decode(data: &[u8], site: &'static str) -> Result<String, DecodeError> {
        let Some((&flag, body)) = data.split_first() else {
            return Err(DecodeError::truncated(site, 1, data));
        };
        match flag {
            0x00 => core::str::from_utf8(body)
                .map(str::to_owned)
                .map_err(|_| DecodeError::invalid_utf8(site, data)),
            0x01 => {
                let mut decoder = ZlibDecoder::new(body);
                let mut content = String::new();
                decoder
                    .read_to_string(&mut content)
                    .map_err(|e| DecodeError::malformed(site, format!("inflate failed: {e}"), data))?;
                Ok(content)
            }
            other => Err(DecodeError::UnknownCompressionFlag {
                site,
                flag: other,
                payload: hex::encode(data),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
