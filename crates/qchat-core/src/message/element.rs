//! Semantic message element model
//!
//! The application-facing counterpart of the wire element vocabulary: a
//! closed set of message element variants. Every codec dispatch site matches
//! this enum exhaustively, so adding a variant forces a compile-time-checked
//! update everywhere it must be handled.

use crate::forward::{BundleNode, ForwardBundle};
use crate::message::source::MessageSource;
use crate::types::UserId;

// ----------------------------------------------------------------------------
// Message Element
// ----------------------------------------------------------------------------

/// One semantic unit of a message chain
#[derive(Debug, Clone, PartialEq)]
pub enum MessageElement {
    /// Plain text run
    Text(String),
    /// Mention of a single member. `display` is the rendered name captured
    /// from the wire (incoming) or resolved at encode time (outgoing).
    At {
        target: UserId,
        display: Option<String>,
    },
    /// Mention of everyone in a group
    AtAll,
    /// Classic emoticon face
    Face(u16),
    /// Image
    Image(ImageRef),
    /// Image shown once and then hidden
    FlashImage(ImageRef),
    /// Voice clip
    Voice(Voice),
    /// Reply quoting another message; at most one per chain
    Quote(MessageSource),
    /// Nudge/poke action
    Poke(Poke),
    /// Paid animated face
    VipFace(VipFace),
    /// Marketplace sticker, unrefined
    MarketFace(MarketFace),
    /// Refined marketplace sticker: a dice roll with a known value
    DiceRoll(DiceRoll),
    /// Structured app share, unrefined
    LightApp(LightApp),
    /// Refined app share: a music card from a known streaming service
    MusicShare(MusicShare),
    /// Rich templated service message
    RichService(RichService),
    /// Long single message stored server-side, referenced by resource id
    LongMessageRef(LongMessageRef),
    /// Uploaded forwarded-message bundle, referenced by resource id
    ForwardRef(ForwardRef),
    /// Forwarded-message bundle not yet uploaded; must pass through the
    /// uploader before it can be encoded
    ForwardBundle(ForwardBundle),
    /// Client-extension payload
    CustomExtension(CustomExtension),
    /// Provenance record; metadata only, at most one per chain
    Source(MessageSource),
}

impl MessageElement {
    /// Short name for diagnostics and encode errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            MessageElement::Text(_) => "text",
            MessageElement::At { .. } => "at",
            MessageElement::AtAll => "at-all",
            MessageElement::Face(_) => "face",
            MessageElement::Image(_) => "image",
            MessageElement::FlashImage(_) => "flash-image",
            MessageElement::Voice(_) => "voice",
            MessageElement::Quote(_) => "quote",
            MessageElement::Poke(_) => "poke",
            MessageElement::VipFace(_) => "vip-face",
            MessageElement::MarketFace(_) => "market-face",
            MessageElement::DiceRoll(_) => "dice-roll",
            MessageElement::LightApp(_) => "light-app",
            MessageElement::MusicShare(_) => "music-share",
            MessageElement::RichService(_) => "rich-service",
            MessageElement::LongMessageRef(_) => "long-message-ref",
            MessageElement::ForwardRef(_) => "forward-ref",
            MessageElement::ForwardBundle(_) => "forward-bundle",
            MessageElement::CustomExtension(_) => "custom-extension",
            MessageElement::Source(_) => "source",
        }
    }

    /// Whether this variant is single-instance per chain
    pub fn is_single_instance(&self) -> bool {
        matches!(
            self,
            MessageElement::Source(_) | MessageElement::Quote(_)
        )
    }

    /// Whether this variant is chain metadata rather than displayed content
    pub fn is_metadata(&self) -> bool {
        matches!(self, MessageElement::Source(_))
    }

    /// Human-readable preview used for forward-bundle briefs
    pub fn preview_text(&self) -> String {
        match self {
            MessageElement::Text(s) => s.clone(),
            MessageElement::At { target, display } => match display {
                Some(name) => format!("@{name}"),
                None => format!("@{target}"),
            },
            MessageElement::AtAll => "@everyone".to_owned(),
            MessageElement::Face(_) => "[Face]".to_owned(),
            MessageElement::Image(_) => "[Image]".to_owned(),
            MessageElement::FlashImage(_) => "[Flash image]".to_owned(),
            MessageElement::Voice(_) => "[Voice]".to_owned(),
            MessageElement::Quote(_) => String::new(),
            MessageElement::Poke(p) => format!("[{}]", p.name),
            MessageElement::VipFace(v) => format!("[{}]x{}", v.kind_name, v.count),
            MessageElement::MarketFace(m) => format!("[{}]", m.name),
            MessageElement::DiceRoll(d) => format!("[Dice: {}]", d.value),
            MessageElement::LightApp(_) => "[App share]".to_owned(),
            MessageElement::MusicShare(m) => format!("[Music] {}", m.title),
            MessageElement::RichService(_) => "[Service message]".to_owned(),
            MessageElement::LongMessageRef(_) => "[Long message]".to_owned(),
            MessageElement::ForwardRef(_) | MessageElement::ForwardBundle(_) => {
                "[Forwarded messages]".to_owned()
            }
            MessageElement::CustomExtension(_) => String::new(),
            MessageElement::Source(_) => String::new(),
        }
    }
}

impl From<&str> for MessageElement {
    fn from(value: &str) -> Self {
        MessageElement::Text(value.to_owned())
    }
}

impl From<String> for MessageElement {
    fn from(value: String) -> Self {
        MessageElement::Text(value)
    }
}

// ----------------------------------------------------------------------------
// Element Payloads
// ----------------------------------------------------------------------------

/// Which corner of the image matrix a reference lives in:
/// online (server-confirmed) vs offline (locally constructed), crossed with
/// friend vs group delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    FriendOffline,
    FriendOnline,
    GroupOffline,
    GroupOnline,
}

impl ImageKind {
    pub fn is_online(self) -> bool {
        matches!(self, ImageKind::FriendOnline | ImageKind::GroupOnline)
    }

    pub fn is_group(self) -> bool {
        matches!(self, ImageKind::GroupOffline | ImageKind::GroupOnline)
    }
}

/// Image reference
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub kind: ImageKind,
    /// Identifier derived from the content hash
    pub image_id: String,
    pub md5: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub size: u32,
    pub format: u32,
    pub is_emoji: bool,
    /// Direct download URL; present only for online variants
    pub url: Option<String>,
}

/// Voice clip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Voice {
    pub name: String,
    pub md5: Vec<u8>,
    pub size: u32,
    pub codec: u32,
    pub download_token: Vec<u8>,
}

/// Nudge/poke action
#[derive(Debug, Clone, PartialEq)]
pub struct Poke {
    pub kind: u32,
    pub id: i32,
    pub name: String,
}

/// Paid animated face
#[derive(Debug, Clone, PartialEq)]
pub struct VipFace {
    pub kind_id: u32,
    pub kind_name: String,
    pub count: u32,
}

/// Marketplace sticker, raw
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketFace {
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

/// Refined dice-roll sticker. Retains the raw sticker so re-encoding is
/// lossless.
#[derive(Debug, Clone, PartialEq)]
pub struct DiceRoll {
    /// Rolled value, 1..=6
    pub value: u8,
    pub raw: MarketFace,
}

impl DiceRoll {
    /// Marketplace tab identifying the dice sticker
    pub const TAB_ID: u32 = 11464;

    /// Build a dice roll with a synthesized sticker body. Returns `None`
    /// outside 1..=6.
    pub fn new(value: u8) -> Option<Self> {
        if !(1..=6).contains(&value) {
            return None;
        }
        let mut mobile_param = b"rscType?1;value=".to_vec();
        mobile_param.push(47 + value);
        Some(Self {
            value,
            raw: MarketFace {
                tab_id: Self::TAB_ID,
                name: "Dice".to_owned(),
                item_type: 6,
                sub_type: 3,
                face_id: vec![
                    0x48, 0x23, 0xD3, 0xAD, 0xB1, 0x5D, 0xF0, 0x80, 0x14, 0xCE, 0x5D, 0x67,
                    0x96, 0xB7, 0x6E, 0xE1,
                ],
                key: b"409e2a69b16918f9".to_vec(),
                mobile_param,
                width: 200,
                height: 200,
            },
        })
    }
}

/// Structured app share carrying a raw JSON payload
#[derive(Debug, Clone, PartialEq)]
pub struct LightApp {
    pub content: String,
}

impl LightApp {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Streaming services recognized by the music-share refinement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicKind {
    NeteaseCloud,
    QQMusic,
    Migu,
    Kugou,
    Kuwo,
}

impl MusicKind {
    /// Application id carried in the share payload
    pub const fn app_id(self) -> u64 {
        match self {
            MusicKind::NeteaseCloud => 100495085,
            MusicKind::QQMusic => 100497308,
            MusicKind::Migu => 1101053067,
            MusicKind::Kugou => 205141,
            MusicKind::Kuwo => 100243533,
        }
    }

    /// Look up a music kind by its application id
    pub fn from_app_id(app_id: u64) -> Option<Self> {
        [
            MusicKind::NeteaseCloud,
            MusicKind::QQMusic,
            MusicKind::Migu,
            MusicKind::Kugou,
            MusicKind::Kuwo,
        ]
        .into_iter()
        .find(|kind| kind.app_id() == app_id)
    }
}

/// Refined music card. `origin` retains the original app-share JSON so the
/// element re-encodes losslessly.
#[derive(Debug, Clone, PartialEq)]
pub struct MusicShare {
    pub kind: MusicKind,
    pub title: String,
    pub summary: String,
    pub jump_url: String,
    pub picture_url: String,
    pub music_url: String,
    pub brief: String,
    pub origin: Option<String>,
}

/// Rich templated service message
#[derive(Debug, Clone, PartialEq)]
pub struct RichService {
    pub service_id: u32,
    pub content: String,
}

/// Long single message stored server-side
#[derive(Debug, Clone, PartialEq)]
pub struct LongMessageRef {
    pub res_id: String,
    pub content: String,
}

/// Uploaded forwarded-message bundle. `nodes` is empty until deep
/// refinement fetches the stored bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRef {
    pub res_id: String,
    pub file_name: String,
    pub nodes: Vec<BundleNode>,
}

/// Client-extension payload
#[derive(Debug, Clone, PartialEq)]
pub struct CustomExtension {
    pub type_tag: u32,
    pub payload: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
