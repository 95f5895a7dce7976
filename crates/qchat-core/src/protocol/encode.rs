//! Wire encoding of message chains
//!
//! Translates a message chain into the ordered wire element list for an
//! outgoing message. Legacy-sensitive variants additionally emit a plain-text
//! placeholder right after themselves so clients without native support show
//! a readable fallback; the decoder's cleanup pass strips these again on the
//! way back in.

use std::collections::HashMap;

use tracing::trace;

use crate::errors::EncodeError;
use crate::forward::{forward_service_template, ForwardBundle};
use crate::message::chain::MessageChain;
use crate::message::element::{ImageRef, MessageElement, MusicShare};
use crate::message::source::MessageSource;
use crate::protocol::tlv::{TagWidth, Tlv};
use crate::protocol::wire::{
    AtAttr, CommonElem, CustomElem, ExtraInfoElem, FaceElem, FlaggedPayload, GeneralFlagsElem,
    ImageElem, LightAppElem, MarketFaceElem, RichMsgElem, SourceRefElem, TextElem, VoiceElem,
    WireElement, COMMON_SERVICE_FLASH_IMAGE, COMMON_SERVICE_POKE, COMMON_SERVICE_VIP_FACE,
};
use crate::types::{GroupId, UserId};

// ----------------------------------------------------------------------------
// Compatibility Constants
// ----------------------------------------------------------------------------

/// Fallback text emitted after forward-bundle and long-message references
pub const FORWARD_FALLBACK_TEXT: &str =
    "[Forwarded messages] Please upgrade to the latest client version to view.";

/// Fallback text emitted after poke actions
pub const POKE_FALLBACK_TEXT: &str =
    "[Poke] Please use the latest mobile client to try this feature.";

/// Fallback text emitted after flash images
pub const FLASH_FALLBACK_TEXT: &str =
    "[Flash image] Please view it on the latest mobile client.";

/// Fallback text some clients inject before voice clips
pub const VOICE_FALLBACK_TEXT: &str =
    "[Voice message] Please upgrade to the latest client version to listen.";

/// Display text of an @-all mention
pub const AT_ALL_DISPLAY: &str = "@everyone";

/// High byte marking message uids derived from correlation ids
pub const MESSAGE_UID_BASE: u64 = 0x0100_0000_0000_0000;

/// Minimum client version advertised inside poke payloads
const POKE_MIN_VERSION: &str = "7.2.0";

// Opaque capability-flag templates understood by official clients, one per
// priority level of the trailing general-flags element.
const PB_RESERVE_LONG_MESSAGE: &[u8] = &[0x78, 0x00, 0xF8, 0x01, 0x00, 0xC8, 0x02, 0x00];
const PB_RESERVE_RICH_MESSAGE: &[u8] = &[
    0x08, 0x09, 0x78, 0x00, 0xC8, 0x01, 0x00, 0xF0, 0x01, 0x00, 0xF8, 0x01, 0x00, 0x90, 0x02,
    0x00, 0xC8, 0x02, 0x00, 0x98, 0x03, 0x00, 0xA0, 0x03, 0x20, 0xB0, 0x03, 0x00, 0xC0, 0x03,
    0x00, 0xD0, 0x03, 0x00, 0xE8, 0x03, 0x00, 0x8A, 0x04, 0x02, 0x08, 0x03, 0x90, 0x04, 0x80,
    0x80, 0x80, 0x10, 0xB8, 0x04, 0x00, 0xC0, 0x04, 0x00,
];
const PB_RESERVE_FLASH_IMAGE: &[u8] = &[
    0x78, 0x00, 0x90, 0x01, 0x01, 0xF8, 0x01, 0x00, 0xA0, 0x02, 0x00, 0xC8, 0x02, 0x00,
];
const PB_RESERVE_VOICE: &[u8] = &[
    0x78, 0x00, 0xF8, 0x01, 0x00, 0xC8, 0x02, 0x00, 0xAA, 0x03, 0x26, 0x08, 0x22, 0x12, 0x22,
    0x41, 0x20, 0x41, 0x3B, 0x25, 0x3E, 0x16, 0x45, 0x3F, 0x43, 0x2F, 0x29, 0x3E, 0x44, 0x24,
    0x14, 0x18, 0x46, 0x3D, 0x2B, 0x4A, 0x44, 0x3A, 0x18, 0x2E, 0x19, 0x29, 0x1B, 0x26, 0x32,
    0x31, 0x31, 0x29, 0x43,
];
const PB_RESERVE_DEFAULT: &[u8] = &[0x78, 0x00, 0xF8, 0x01, 0x00, 0xC8, 0x02, 0x00];

// TLV tags of the common-element payloads
pub(crate) mod poke_tags {
    pub const KIND: u32 = 1;
    pub const ID: u32 = 2;
    pub const NAME: u32 = 3;
    pub const MIN_VERSION: u32 = 4;
}
pub(crate) mod flash_tags {
    pub const GROUP: u32 = 1;
    pub const FRIEND: u32 = 2;
}
pub(crate) mod vip_face_tags {
    pub const KIND_ID: u32 = 1;
    pub const KIND_NAME: u32 = 2;
    pub const COUNT: u32 = 3;
}

// ----------------------------------------------------------------------------
// Encode Context
// ----------------------------------------------------------------------------

/// Whether the chain is being encoded for normal sending or for nesting
/// inside a forward bundle. The distinction is observable: nested-forward
/// encoding omits the trailing capability flags and prefers the display name
/// captured from the original source over a live member lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    Standard,
    NestedForward,
}

/// The messaging target, used to resolve mention display names
#[derive(Debug, Clone, Default)]
pub struct TargetContext {
    pub target: UserId,
    pub group: Option<GroupId>,
    names: HashMap<UserId, String>,
}

impl TargetContext {
    /// Direct-message target
    pub fn friend(target: UserId) -> Self {
        Self {
            target,
            group: None,
            names: HashMap::new(),
        }
    }

    /// Group target
    pub fn group(target: UserId, group: GroupId) -> Self {
        Self {
            target,
            group: Some(group),
            names: HashMap::new(),
        }
    }

    /// Register a member's display name
    pub fn with_member_name(mut self, id: UserId, name: impl Into<String>) -> Self {
        self.names.insert(id, name.into());
        self
    }

    /// Look up a member's display name
    pub fn member_name(&self, id: UserId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }
}

/// Everything the encoder needs besides the chain itself
#[derive(Debug, Clone, Default)]
pub struct EncodeContext {
    pub target: Option<TargetContext>,
    pub mode: EncodeMode,
    pub with_general_flags: bool,
}

impl Default for EncodeMode {
    fn default() -> Self {
        EncodeMode::Standard
    }
}

impl EncodeContext {
    /// Normal outgoing send: live name resolution, capability flags emitted
    pub fn standard(target: TargetContext) -> Self {
        Self {
            target: Some(target),
            mode: EncodeMode::Standard,
            with_general_flags: true,
        }
    }

    /// Content nested inside a forward bundle (or a source snapshot):
    /// captured names preferred, no capability flags
    pub fn nested_forward() -> Self {
        Self {
            target: None,
            mode: EncodeMode::NestedForward,
            with_general_flags: false,
        }
    }

    fn member_name(&self, id: UserId) -> Option<&str> {
        self.target.as_ref().and_then(|t| t.member_name(id))
    }
}

// ----------------------------------------------------------------------------
// Encoder
// ----------------------------------------------------------------------------

/// Encode a message chain into its ordered wire element list
pub fn encode_chain(
    chain: &MessageChain,
    ctx: &EncodeContext,
) -> Result<Vec<WireElement>, EncodeError> {
    let mut out: Vec<WireElement> = Vec::with_capacity(chain.len() + 2);

    // A quoted message contributes its provenance snapshot ahead of
    // everything else
    if let Some(quoted) = chain.quote() {
        out.push(WireElement::SourceRef(source_ref_from(quoted)?));
    }

    let mut long_text_res_id: Option<String> = None;
    for element in chain {
        encode_one(element, ctx, &mut out, &mut long_text_res_id)?;
    }

    if ctx.with_general_flags {
        out.push(WireElement::GeneralFlags(general_flags_for(
            chain,
            long_text_res_id,
        )));
    }

    trace!(elements = out.len(), "chain encoded");
    Ok(out)
}

fn encode_one(
    element: &MessageElement,
    ctx: &EncodeContext,
    out: &mut Vec<WireElement>,
    long_text_res_id: &mut Option<String>,
) -> Result<(), EncodeError> {
    match element {
        MessageElement::Text(content) => {
            out.push(WireElement::Text(TextElem::plain(content.clone())));
        }
        MessageElement::At { target, display } => {
            // Name resolution order is a deliberate, observable tie-break:
            // normal sending prefers the live target's member list, nested
            // forward content prefers the name captured from the original
            // source
            let resolved = match ctx.mode {
                EncodeMode::Standard => ctx
                    .member_name(*target)
                    .map(str::to_owned)
                    .or_else(|| display.clone()),
                EncodeMode::NestedForward => display
                    .clone()
                    .or_else(|| ctx.member_name(*target).map(str::to_owned)),
            };
            let name = resolved.unwrap_or_else(|| target.to_string());
            let text = format!("@{name}");
            let attr = AtAttr::member(target.truncated(), text.chars().count() as u16);
            out.push(WireElement::Text(TextElem::mention(text, attr)));
        }
        MessageElement::AtAll => {
            let attr = AtAttr::everyone(AT_ALL_DISPLAY.chars().count() as u16);
            out.push(WireElement::Text(TextElem::mention(AT_ALL_DISPLAY, attr)));
        }
        MessageElement::Face(index) => {
            out.push(WireElement::Face(FaceElem::new(*index)));
        }
        MessageElement::Image(image) => {
            out.push(image_wire_element(image));
        }
        MessageElement::FlashImage(image) => {
            let tag = if image.kind.is_group() {
                flash_tags::GROUP
            } else {
                flash_tags::FRIEND
            };
            let payload = Tlv::new()
                .put(
                    tag,
                    bincode::serialize(&image_elem_from_ref(image)).expect("image serializes"),
                )
                .encode(TagWidth::One, false);
            out.push(WireElement::Common(CommonElem {
                service_type: COMMON_SERVICE_FLASH_IMAGE,
                business_type: 0,
                payload,
            }));
            out.push(WireElement::Text(TextElem::plain(FLASH_FALLBACK_TEXT)));
        }
        MessageElement::Voice(voice) => {
            out.push(WireElement::Voice(VoiceElem {
                name: voice.name.clone(),
                md5: voice.md5.clone(),
                size: voice.size,
                codec: voice.codec,
                download_token: voice.download_token.clone(),
            }));
        }
        MessageElement::Quote(_) => {
            // Source snapshot already emitted ahead of the chain
        }
        MessageElement::Poke(poke) => {
            let payload = Tlv::new()
                .put_u32(poke_tags::KIND, poke.kind)
                .put_i32(poke_tags::ID, poke.id)
                .put_str(poke_tags::NAME, &poke.name)
                .put_str(poke_tags::MIN_VERSION, POKE_MIN_VERSION)
                .encode(TagWidth::One, false);
            out.push(WireElement::Common(CommonElem {
                service_type: COMMON_SERVICE_POKE,
                business_type: poke.kind,
                payload,
            }));
            out.push(WireElement::Text(TextElem::plain(POKE_FALLBACK_TEXT)));
        }
        MessageElement::VipFace(vip) => {
            let payload = Tlv::new()
                .put_u32(vip_face_tags::KIND_ID, vip.kind_id)
                .put_str(vip_face_tags::KIND_NAME, &vip.kind_name)
                .put_u32(vip_face_tags::COUNT, vip.count)
                .encode(TagWidth::One, false);
            out.push(WireElement::Common(CommonElem {
                service_type: COMMON_SERVICE_VIP_FACE,
                business_type: 0,
                payload,
            }));
            out.push(WireElement::Text(TextElem::plain(format!(
                "[{}]x{}",
                vip.kind_name, vip.count
            ))));
        }
        MessageElement::MarketFace(face) => {
            out.push(WireElement::MarketFace(market_face_elem(face)));
            out.push(WireElement::ExtraInfo(ExtraInfoElem {
                flags: 8,
                group_mask: 1,
            }));
        }
        MessageElement::DiceRoll(dice) => {
            out.push(WireElement::MarketFace(market_face_elem(&dice.raw)));
            out.push(WireElement::ExtraInfo(ExtraInfoElem {
                flags: 8,
                group_mask: 1,
            }));
        }
        MessageElement::LightApp(app) => {
            out.push(WireElement::LightApp(LightAppElem {
                data: FlaggedPayload::encode_deflated(&app.content),
            }));
        }
        MessageElement::MusicShare(music) => {
            let content = music
                .origin
                .clone()
                .unwrap_or_else(|| music_share_json(music));
            out.push(WireElement::LightApp(LightAppElem {
                data: FlaggedPayload::encode_deflated(&content),
            }));
        }
        MessageElement::RichService(service) => {
            out.push(WireElement::RichMsg(RichMsgElem {
                service_id: service.service_id,
                template: FlaggedPayload::encode_deflated(&service.content),
            }));
        }
        MessageElement::LongMessageRef(long) => {
            if long_text_res_id.is_some() {
                return Err(EncodeError::DuplicateLongMessage);
            }
            out.push(WireElement::RichMsg(RichMsgElem {
                service_id: 35,
                template: FlaggedPayload::encode_deflated(&long.content),
            }));
            out.push(WireElement::Text(TextElem::plain(FORWARD_FALLBACK_TEXT)));
            *long_text_res_id = Some(long.res_id.clone());
        }
        MessageElement::ForwardRef(fref) => {
            let bundle = ForwardBundle::new(fref.nodes.clone());
            let template = forward_service_template(&fref.res_id, &fref.file_name, &bundle);
            out.push(WireElement::RichMsg(RichMsgElem {
                service_id: 35,
                template: FlaggedPayload::encode_deflated(&template),
            }));
            out.push(WireElement::Text(TextElem::plain(FORWARD_FALLBACK_TEXT)));
        }
        MessageElement::ForwardBundle(_) => {
            return Err(EncodeError::UnresolvedForward);
        }
        MessageElement::CustomExtension(custom) => {
            out.push(WireElement::Custom(CustomElem {
                enum_type: custom.type_tag,
                data: custom.payload.clone(),
            }));
        }
        MessageElement::Source(_) => {
            // Provenance metadata has no wire representation of its own
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn image_wire_element(image: &ImageRef) -> WireElement {
    let elem = image_elem_from_ref(image);
    if image.kind.is_group() {
        WireElement::GroupImage(elem)
    } else {
        WireElement::FriendImage(elem)
    }
}

pub(crate) fn image_elem_from_ref(image: &ImageRef) -> ImageElem {
    ImageElem {
        image_id: image.image_id.clone(),
        md5: image.md5.clone(),
        width: image.width,
        height: image.height,
        size: image.size,
        format: image.format,
        is_emoji: image.is_emoji,
        url: image.url.clone(),
    }
}

fn market_face_elem(face: &crate::message::element::MarketFace) -> MarketFaceElem {
    MarketFaceElem {
        tab_id: face.tab_id,
        name: face.name.clone(),
        item_type: face.item_type,
        sub_type: face.sub_type,
        face_id: face.face_id.clone(),
        key: face.key.clone(),
        mobile_param: face.mobile_param.clone(),
        width: face.width,
        height: face.height,
    }
}

/// Build the provenance snapshot emitted ahead of a quoted message
fn source_ref_from(source: &MessageSource) -> Result<SourceRefElem, EncodeError> {
    let mut elems = match source.original_message() {
        Some(original) => encode_chain(original, &EncodeContext::nested_forward())?,
        None => Vec::new(),
    };
    if !matches!(elems.last(), Some(WireElement::Flags2)) {
        elems.push(WireElement::Flags2);
    }

    Ok(SourceRefElem {
        orig_seqs: source
            .sequence_ids()
            .unwrap_or_default()
            .iter()
            .map(|id| id.value())
            .collect(),
        sender: source.sender().value(),
        target: source.target().value(),
        time: source.time().as_secs(),
        orig_uids: source
            .internal_ids()
            .iter()
            .map(|id| MESSAGE_UID_BASE | id.value() as u64)
            .collect(),
        elems,
        flag: 1,
    })
}

/// Choose the trailing capability-flags element by priority:
/// long text > rich/service > flash image > voice > default
fn general_flags_for(chain: &MessageChain, long_text_res_id: Option<String>) -> GeneralFlagsElem {
    if let Some(res_id) = long_text_res_id {
        return GeneralFlagsElem {
            long_text_flag: 1,
            long_text_res_id: res_id,
            pb_reserve: PB_RESERVE_LONG_MESSAGE.to_vec(),
        };
    }
    let has_rich = chain.any(|e| {
        matches!(
            e,
            MessageElement::RichService(_)
                | MessageElement::LightApp(_)
                | MessageElement::MusicShare(_)
                | MessageElement::ForwardRef(_)
                | MessageElement::LongMessageRef(_)
        )
    });
    let pb_reserve = if has_rich {
        PB_RESERVE_RICH_MESSAGE
    } else if chain.any(|e| matches!(e, MessageElement::FlashImage(_))) {
        PB_RESERVE_FLASH_IMAGE
    } else if chain.any(|e| matches!(e, MessageElement::Voice(_))) {
        PB_RESERVE_VOICE
    } else {
        PB_RESERVE_DEFAULT
    };
    GeneralFlagsElem {
        long_text_flag: 0,
        long_text_res_id: String::new(),
        pb_reserve: pb_reserve.to_vec(),
    }
}

/// Synthesize the structured share payload for a music card built from
/// fields rather than decoded from the wire
fn music_share_json(music: &MusicShare) -> String {
    serde_json::json!({
        "app": "com.tencent.structmsg",
        "desc": "Music",
        "view": "music",
        "ver": "0.0.0.1",
        "prompt": music.brief,
        "meta": {
            "music": {
                "app_type": 1,
                "appid": music.kind.app_id(),
                "title": music.title,
                "desc": music.summary,
                "jumpUrl": music.jump_url,
                "musicUrl": music.music_url,
                "preview": music.picture_url,
                "sourceMsgId": "0",
                "source_icon": "",
                "source_url": "",
                "tag": "",
            }
        },
        "config": { "autosize": true, "forward": true, "type": "normal" },
    })
    .to_string()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::element::{LongMessageRef, Poke};

    fn group_ctx() -> EncodeContext {
        EncodeContext::standard(
            TargetContext::group(UserId(1000), GroupId(2000))
                .with_member_name(UserId(123), "Bob"),
        )
    }

    #[test]
    fn test_at_resolves_live_name_in_standard_mode() {
        let chain = MessageChain::from_elements([
            MessageElement::At {
                target: UserId(123),
                display: Some("Old".into()),
            },
            MessageElement::Text(" hello".into()),
        ]);
        let wire = encode_chain(&chain, &group_ctx()).unwrap();

        let WireElement::Text(at_text) = &wire[0] else {
            panic!("expected mention text");
        };
        assert_eq!(at_text.content, "@Bob");
        let attr = AtAttr::parse(&at_text.at_attr).unwrap();
        assert_eq!(attr.target, 123);

        let WireElement::Text(rest) = &wire[1] else {
            panic!("expected plain text");
        };
        assert_eq!(rest.content, " hello");
        assert!(!rest.is_mention());
    }

    #[test]
    fn test_at_prefers_captured_name_in_nested_forward_mode() {
        let chain = MessageChain::from_elements([MessageElement::At {
            target: UserId(123),
            display: Some("Captured".into()),
        }]);
        let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
        let WireElement::Text(at_text) = &wire[0] else {
            panic!("expected mention text");
        };
        assert_eq!(at_text.content, "@Captured");
    }

    #[test]
    fn test_poke_emits_fallback_text() {
        let chain = MessageChain::from_elements([MessageElement::Poke(Poke {
            kind: 1,
            id: -1,
            name: "poke".into(),
        })]);
        let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
        assert!(matches!(
            &wire[0],
            WireElement::Common(c) if c.service_type == COMMON_SERVICE_POKE
        ));
        assert!(matches!(
            &wire[1],
            WireElement::Text(t) if t.content == POKE_FALLBACK_TEXT
        ));
    }

    #[test]
    fn test_general_flags_priority_default_vs_flash() {
        let plain = MessageChain::from_elements([MessageElement::Text("x".into())]);
        let wire = encode_chain(&plain, &group_ctx()).unwrap();
        let WireElement::GeneralFlags(flags) = wire.last().unwrap() else {
            panic!("expected trailing general flags");
        };
        assert_eq!(flags.pb_reserve, PB_RESERVE_DEFAULT);

        let flashy = MessageChain::from_elements([MessageElement::FlashImage(ImageRef {
            kind: crate::message::element::ImageKind::GroupOffline,
            image_id: "img".into(),
            md5: vec![0; 16],
            width: 1,
            height: 1,
            size: 1,
            format: 1000,
            is_emoji: false,
            url: None,
        })]);
        let wire = encode_chain(&flashy, &group_ctx()).unwrap();
        let WireElement::GeneralFlags(flags) = wire.last().unwrap() else {
            panic!("expected trailing general flags");
        };
        assert_eq!(flags.pb_reserve, PB_RESERVE_FLASH_IMAGE);
    }

    #[test]
    fn test_nested_forward_omits_general_flags() {
        let chain = MessageChain::from_elements([MessageElement::Text("x".into())]);
        let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
        assert!(!wire
            .iter()
            .any(|e| matches!(e, WireElement::GeneralFlags(_))));
    }

    #[test]
    fn test_duplicate_long_message_is_hard_failure() {
        let long = |res: &str| {
            MessageElement::LongMessageRef(LongMessageRef {
                res_id: res.to_owned(),
                content: crate::forward::long_message_template(res, "[Long message]"),
            })
        };
        let chain = MessageChain::from_elements([long("a"), long("b")]);
        assert!(matches!(
            encode_chain(&chain, &group_ctx()),
            Err(EncodeError::DuplicateLongMessage)
        ));
    }

    #[test]
    fn test_unresolved_forward_bundle_is_hard_failure() {
        let chain =
            MessageChain::from_elements([MessageElement::ForwardBundle(ForwardBundle::default())]);
        assert!(matches!(
            encode_chain(&chain, &group_ctx()),
            Err(EncodeError::UnresolvedForward)
        ));
    }

    #[test]
    fn test_long_message_flags_carry_res_id() {
        let chain = MessageChain::from_elements([MessageElement::LongMessageRef(LongMessageRef {
            res_id: "LONG-1".into(),
            content: crate::forward::long_message_template("LONG-1", "[Long message]"),
        })]);
        let wire = encode_chain(&chain, &group_ctx()).unwrap();
        let WireElement::GeneralFlags(flags) = wire.last().unwrap() else {
            panic!("expected trailing general flags");
        };
        assert_eq!(flags.long_text_flag, 1);
        assert_eq!(flags.long_text_res_id, "LONG-1");
    }
}
