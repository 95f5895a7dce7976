//! Wire decoding of message chains
//!
//! Translates the ordered wire element list of an incoming or stored message
//! back into a raw message chain, then runs a cleanup pass that strips the
//! legacy compatibility artifacts other clients inject: fallback texts paired
//! with special elements, the quote/mention leading-space artifact, and
//! fragmented plain-text runs.
//!
//! Recognized-but-malformed payloads always produce a [`DecodeError`]
//! carrying the offending bytes; protocol drift must be visible, never
//! silently swallowed.

use tracing::{trace, warn};

use crate::errors::DecodeError;
use crate::message::chain::MessageChain;
use crate::message::element::{
    CustomExtension, ForwardRef, ImageKind, ImageRef, LightApp, LongMessageRef, MessageElement,
    Poke, RichService, VipFace, Voice,
};
use crate::message::source::{MessageSource, SourceKind};
use crate::protocol::encode::{
    flash_tags, poke_tags, vip_face_tags, FLASH_FALLBACK_TEXT, FORWARD_FALLBACK_TEXT,
    POKE_FALLBACK_TEXT, VOICE_FALLBACK_TEXT,
};
use crate::protocol::tlv::{TagWidth, Tlv};
use crate::protocol::wire::{
    AtAttr, CommonElem, FlaggedPayload, ImageElem, RichMsgElem, SourceRefElem, WireElement,
    COMMON_SERVICE_FACE_V2, COMMON_SERVICE_FLASH_IMAGE, COMMON_SERVICE_POKE,
    COMMON_SERVICE_VIP_FACE,
};
use crate::refine::RefineContext;
use crate::types::{InternalId, SequenceId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Incoming Metadata
// ----------------------------------------------------------------------------

/// Head fields of an incoming message, known before its body is decoded
#[derive(Debug, Clone)]
pub struct IncomingMeta {
    pub kind: SourceKind,
    pub sender: UserId,
    pub target: UserId,
    pub time: Timestamp,
    pub sequence_ids: Vec<SequenceId>,
    pub internal_ids: Vec<InternalId>,
}

// ----------------------------------------------------------------------------
// Decoder
// ----------------------------------------------------------------------------

/// Decode an incoming message: its provenance record followed by the decoded
/// and cleaned-up body
pub fn decode_message(
    meta: &IncomingMeta,
    elems: &[WireElement],
    ctx: &RefineContext,
) -> Result<MessageChain, DecodeError> {
    let content = decode_elements(elems, ctx)?;
    let source = MessageSource::incoming(
        meta.kind,
        meta.sender,
        meta.target,
        meta.time,
        meta.sequence_ids.clone(),
        meta.internal_ids.clone(),
    )
    .with_original(content.clone());

    let mut builder = MessageChain::builder();
    builder.push(MessageElement::Source(source));
    for element in content {
        builder.push(element);
    }
    Ok(builder.build())
}

/// Decode a wire element list into a raw chain and clean up legacy
/// artifacts. Pure and synchronous; refinement happens separately.
pub fn decode_elements(
    elems: &[WireElement],
    ctx: &RefineContext,
) -> Result<MessageChain, DecodeError> {
    let mut raw: Vec<MessageElement> = Vec::with_capacity(elems.len());
    for elem in elems {
        decode_one(elem, ctx, &mut raw)?;
    }
    let cleaned = cleanup_legacy_artifacts(raw);
    trace!(elements = cleaned.len(), "wire elements decoded");
    Ok(MessageChain::from_elements(cleaned))
}

fn decode_one(
    elem: &WireElement,
    ctx: &RefineContext,
    out: &mut Vec<MessageElement>,
) -> Result<(), DecodeError> {
    match elem {
        WireElement::Text(text) => {
            if text.at_attr.is_empty() {
                out.push(MessageElement::Text(text.content.clone()));
            } else {
                let attr = AtAttr::parse(&text.at_attr)?;
                if attr.is_at_all() {
                    out.push(MessageElement::AtAll);
                } else {
                    let display = text
                        .content
                        .strip_prefix('@')
                        .unwrap_or(&text.content)
                        .to_owned();
                    out.push(MessageElement::At {
                        target: UserId(attr.target as u64),
                        display: Some(display),
                    });
                }
            }
        }
        WireElement::Face(face) => {
            out.push(MessageElement::Face(face.index));
        }
        WireElement::SourceRef(source_ref) => {
            out.push(MessageElement::Quote(decode_source_ref(source_ref, ctx)?));
        }
        WireElement::GroupImage(image) => {
            out.push(MessageElement::Image(image_ref_from_elem(image, true)));
        }
        WireElement::FriendImage(image) => {
            out.push(MessageElement::Image(image_ref_from_elem(image, false)));
        }
        WireElement::Voice(voice) => {
            out.push(MessageElement::Voice(Voice {
                name: voice.name.clone(),
                md5: voice.md5.clone(),
                size: voice.size,
                codec: voice.codec,
                download_token: voice.download_token.clone(),
            }));
        }
        WireElement::MarketFace(face) => {
            out.push(MessageElement::MarketFace(
                crate::message::element::MarketFace {
                    tab_id: face.tab_id,
                    name: face.name.clone(),
                    item_type: face.item_type,
                    sub_type: face.sub_type,
                    face_id: face.face_id.clone(),
                    key: face.key.clone(),
                    mobile_param: face.mobile_param.clone(),
                    width: face.width,
                    height: face.height,
                },
            ));
        }
        WireElement::Common(common) => {
            decode_common(common, out)?;
        }
        WireElement::LightApp(app) => {
            let content = FlaggedPayload::decode(&app.data, "light-app")?;
            out.push(MessageElement::LightApp(LightApp { content }));
        }
        WireElement::RichMsg(rich) => {
            decode_rich_msg(rich, out)?;
        }
        WireElement::Custom(custom) => {
            out.push(MessageElement::CustomExtension(CustomExtension {
                type_tag: custom.enum_type,
                payload: custom.data.clone(),
            }));
        }
        // Trailing flags and display hints carry no chain content
        WireElement::GeneralFlags(_) | WireElement::ExtraInfo(_) | WireElement::Flags2 => {}
    }
    Ok(())
}

fn decode_source_ref(
    source_ref: &SourceRefElem,
    ctx: &RefineContext,
) -> Result<MessageSource, DecodeError> {
    let original = decode_elements(&source_ref.elems, ctx)?;
    Ok(MessageSource::offline(
        UserId(source_ref.sender),
        UserId(source_ref.target),
        Timestamp(source_ref.time),
    )
    .with_sequence_ids(source_ref.orig_seqs.iter().map(|&s| SequenceId(s)).collect())
    .with_internal_ids(
        source_ref
            .orig_uids
            .iter()
            .map(|&uid| InternalId(uid as u32))
            .collect(),
    )
    .with_original(original))
}

fn decode_common(common: &CommonElem, out: &mut Vec<MessageElement>) -> Result<(), DecodeError> {
    match common.service_type {
        COMMON_SERVICE_POKE => {
            let tlv = Tlv::decode(&common.payload, TagWidth::One, false)
                .map_err(|_| DecodeError::malformed("poke", "bad attribute block", &common.payload))?;
            let kind = tlv.get_u32(poke_tags::KIND).ok_or_else(|| {
                DecodeError::malformed("poke", "missing poke kind", &common.payload)
            })?;
            out.push(MessageElement::Poke(Poke {
                kind,
                id: tlv.get_i32(poke_tags::ID).unwrap_or(-1),
                name: tlv.get_str(poke_tags::NAME).unwrap_or_default().to_owned(),
            }));
        }
        COMMON_SERVICE_FLASH_IMAGE => {
            let tlv = Tlv::decode(&common.payload, TagWidth::One, false).map_err(|_| {
                DecodeError::malformed("flash-image", "bad attribute block", &common.payload)
            })?;
            let (raw, is_group) = match (tlv.get(flash_tags::GROUP), tlv.get(flash_tags::FRIEND)) {
                (Some(raw), _) => (raw, true),
                (None, Some(raw)) => (raw, false),
                (None, None) => {
                    return Err(DecodeError::malformed(
                        "flash-image",
                        "neither group nor friend picture present",
                        &common.payload,
                    ))
                }
            };
            let image: ImageElem = bincode::deserialize(raw).map_err(|e| {
                DecodeError::malformed("flash-image", format!("bad picture body: {e}"), raw)
            })?;
            out.push(MessageElement::FlashImage(image_ref_from_elem(
                &image, is_group,
            )));
        }
        COMMON_SERVICE_VIP_FACE => {
            let tlv = Tlv::decode(&common.payload, TagWidth::One, false).map_err(|_| {
                DecodeError::malformed("vip-face", "bad attribute block", &common.payload)
            })?;
            let kind_id = tlv.get_u32(vip_face_tags::KIND_ID).ok_or_else(|| {
                DecodeError::malformed("vip-face", "missing kind id", &common.payload)
            })?;
            out.push(MessageElement::VipFace(VipFace {
                kind_id,
                kind_name: tlv
                    .get_str(vip_face_tags::KIND_NAME)
                    .unwrap_or_default()
                    .to_owned(),
                count: tlv.get_u32(vip_face_tags::COUNT).unwrap_or(1),
            }));
        }
        COMMON_SERVICE_FACE_V2 => {
            let tlv = Tlv::decode(&common.payload, TagWidth::One, false).map_err(|_| {
                DecodeError::malformed("face-v2", "bad attribute block", &common.payload)
            })?;
            let index = tlv.get_u32(1).ok_or_else(|| {
                DecodeError::malformed("face-v2", "missing face index", &common.payload)
            })?;
            out.push(MessageElement::Face(index as u16));
        }
        other => {
            // Unknown service types are tolerated: they are new features,
            // not drift in a recognized payload
            warn!(service_type = other, "skipping unknown common element");
        }
    }
    Ok(())
}

fn decode_rich_msg(rich: &RichMsgElem, out: &mut Vec<MessageElement>) -> Result<(), DecodeError> {
    let content = FlaggedPayload::decode(&rich.template, "rich-msg")?;

    // Some clients send service id zero and put the real id in the template
    let service_id = if rich.service_id == 0 {
        find_xml_attr(&content, "serviceID")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0)
    } else {
        rich.service_id
    };

    let element = match service_id {
        35 => {
            let res_id = find_xml_attr(&content, "m_resid").unwrap_or_default();
            let file_name = find_xml_attr(&content, "m_fileName").unwrap_or_default();
            let action = find_xml_attr(&content, "action").unwrap_or_default();
            let multi_flag =
                find_xml_attr(&content, "multiMsgFlag").and_then(|s| s.parse::<u32>().ok());

            if res_id.is_empty() {
                if !file_name.is_empty() && action == "viewMultiMsg" {
                    MessageElement::ForwardRef(ForwardRef {
                        res_id: String::new(),
                        file_name: file_name.to_owned(),
                        nodes: Vec::new(),
                    })
                } else {
                    MessageElement::RichService(RichService {
                        service_id: 35,
                        content,
                    })
                }
            } else {
                match multi_flag {
                    Some(1) => MessageElement::LongMessageRef(LongMessageRef {
                        res_id: res_id.to_owned(),
                        content,
                    }),
                    Some(0) => MessageElement::ForwardRef(ForwardRef {
                        res_id: res_id.to_owned(),
                        file_name: file_name.to_owned(),
                        nodes: Vec::new(),
                    }),
                    // Desktop clients omit the flag; the action attribute
                    // still identifies a forward bundle
                    _ if action == "viewMultiMsg" => MessageElement::ForwardRef(ForwardRef {
                        res_id: res_id.to_owned(),
                        file_name: file_name.to_owned(),
                        nodes: Vec::new(),
                    }),
                    _ => MessageElement::RichService(RichService {
                        service_id: 35,
                        content,
                    }),
                }
            }
        }
        id => MessageElement::RichService(RichService {
            service_id: id,
            content,
        }),
    };
    out.push(element);
    Ok(())
}

pub(crate) fn image_ref_from_elem(image: &ImageElem, is_group: bool) -> ImageRef {
    let kind = match (is_group, image.url.is_some()) {
        (true, true) => ImageKind::GroupOnline,
        (true, false) => ImageKind::GroupOffline,
        (false, true) => ImageKind::FriendOnline,
        (false, false) => ImageKind::FriendOffline,
    };
    ImageRef {
        kind,
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

/// Extract an XML attribute value (`name="value"`) from a templated payload
fn find_xml_attr<'c>(content: &'c str, name: &str) -> Option<&'c str> {
    let pattern = format!("{name}=\"");
    let start = content.find(&pattern)? + pattern.len();
    let rest = &content[start..];
    rest.split('"').next()
}

// ----------------------------------------------------------------------------
// Legacy Artifact Cleanup
// ----------------------------------------------------------------------------

/// Strip the known legacy placeholders that are redundant once their paired
/// special element has been decoded, then merge fragmented plain-text runs.
fn cleanup_legacy_artifacts(raw: Vec<MessageElement>) -> Vec<MessageElement> {
    let mut result: Vec<MessageElement> = Vec::with_capacity(raw.len());
    // Track the last two *input* elements, placeholders included, so a
    // placeholder never shields a second one from its own pairing check
    let mut prev_last: Option<MessageElement> = None;
    let mut last: Option<MessageElement> = None;

    for element in raw {
        if let MessageElement::Text(text) = &element {
            let paired_placeholder = match &last {
                Some(MessageElement::LongMessageRef(_) | MessageElement::ForwardRef(_)) => {
                    text == FORWARD_FALLBACK_TEXT
                }
                Some(MessageElement::Poke(_)) => text == POKE_FALLBACK_TEXT,
                Some(MessageElement::FlashImage(_)) => text == FLASH_FALLBACK_TEXT,
                Some(MessageElement::VipFace(vip)) => {
                    text.chars().count()
                        == 4 + (vip.count / 10) as usize + vip.kind_name.chars().count()
                }
                _ => false,
            };
            // The voice placeholder is injected position-independently by
            // some clients, so it is stripped wherever it appears
            if paired_placeholder || text == VOICE_FALLBACK_TEXT {
                prev_last = last.take();
                last = Some(element);
                continue;
            }

            // Quote + At + " text": drop the compatibility mention and its
            // leading space
            if text.starts_with(' ')
                && matches!(last, Some(MessageElement::At { .. }))
                && matches!(prev_last, Some(MessageElement::Quote(_)))
            {
                result.pop();
                let trimmed = MessageElement::Text(text[1..].to_owned());
                result.push(trimmed.clone());
                prev_last = None;
                last = Some(trimmed);
                continue;
            }
        }

        // A quote preceded by the compatibility mention (At + " ") that old
        // clients insert: drop the mention, keep everything else
        if matches!(element, MessageElement::Quote(_)) {
            if let Some(removed) = result.pop() {
                match removed {
                    MessageElement::Text(ref t) if t == " " => {
                        if !matches!(result.last(), Some(MessageElement::At { .. })) {
                            result.push(removed);
                        } else {
                            result.pop();
                        }
                    }
                    other => result.push(other),
                }
            }
        }

        result.push(element.clone());
        prev_last = last.take();
        last = Some(element);
    }

    merge_text_runs(result)
}

/// Servers may fragment one logical text run across several wire elements;
/// merge adjacent plain-text elements back together
fn merge_text_runs(elements: Vec<MessageElement>) -> Vec<MessageElement> {
    let mut merged: Vec<MessageElement> = Vec::with_capacity(elements.len());
    for element in elements {
        if let MessageElement::Text(next) = &element {
            if let Some(MessageElement::Text(prev)) = merged.last_mut() {
                prev.push_str(next);
                continue;
            }
        }
        merged.push(element);
    }
    merged
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode::{encode_chain, EncodeContext};
    use crate::protocol::wire::TextElem;

    fn ctx() -> RefineContext {
        RefineContext::new()
    }

    #[test]
    fn test_fragmented_text_is_merged() {
        let wire = vec![
            WireElement::Text(TextElem::plain("Hello, ")),
            WireElement::Text(TextElem::plain("world")),
            WireElement::Text(TextElem::plain("!")),
        ];
        let chain = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(
            chain.elements()[0],
            MessageElement::Text("Hello, world!".into())
        );
    }

    #[test]
    fn test_mention_text_decodes_to_at() {
        let attr = AtAttr::member(123, 4);
        let wire = vec![
            WireElement::Text(TextElem::mention("@Bob", attr)),
            WireElement::Text(TextElem::plain(" hello")),
        ];
        let chain = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.elements()[0],
            MessageElement::At {
                target: UserId(123),
                display: Some("Bob".into())
            }
        );
        assert_eq!(chain.elements()[1], MessageElement::Text(" hello".into()));
    }

    #[test]
    fn test_at_all_flag_decodes() {
        let attr = AtAttr::everyone(9);
        let wire = vec![WireElement::Text(TextElem::mention("@everyone", attr))];
        let chain = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(chain.elements()[0], MessageElement::AtAll);
    }

    #[test]
    fn test_poke_fallback_text_is_stripped() {
        let poke_chain = MessageChain::from_elements([MessageElement::Poke(Poke {
            kind: 1,
            id: -1,
            name: "poke".into(),
        })]);
        let wire = encode_chain(&poke_chain, &EncodeContext::nested_forward()).unwrap();
        assert_eq!(wire.len(), 2, "poke plus fallback on the wire");

        let decoded = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded.elements()[0], MessageElement::Poke(_)));
    }

    #[test]
    fn test_voice_fallback_is_stripped_anywhere() {
        let wire = vec![
            WireElement::Text(TextElem::plain(VOICE_FALLBACK_TEXT)),
            WireElement::Voice(crate::protocol::wire::VoiceElem {
                name: "a.amr".into(),
                md5: vec![0; 16],
                size: 10,
                codec: 4,
                download_token: vec![1],
            }),
        ];
        let decoded = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded.elements()[0], MessageElement::Voice(_)));
    }

    #[test]
    fn test_quote_at_space_artifact() {
        let quote_source = SourceRefElem {
            orig_seqs: vec![5],
            sender: 10,
            target: 20,
            time: 1_700_000_000,
            orig_uids: vec![0x0100_0000_0000_0001],
            elems: vec![WireElement::Text(TextElem::plain("original"))],
            flag: 1,
        };
        let wire = vec![
            WireElement::SourceRef(quote_source),
            WireElement::Text(TextElem::mention("@Bob", AtAttr::member(123, 4))),
            WireElement::Text(TextElem::plain(" reply text")),
        ];
        let decoded = decode_elements(&wire, &ctx()).unwrap();

        // The compatibility mention and its leading space are gone
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded.elements()[0], MessageElement::Quote(_)));
        assert_eq!(
            decoded.elements()[1],
            MessageElement::Text("reply text".into())
        );
    }

    #[test]
    fn test_rich_msg_service_one() {
        let wire = vec![WireElement::RichMsg(RichMsgElem {
            service_id: 1,
            template: FlaggedPayload::encode_raw("{\"key\":1}"),
        })];
        let decoded = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(
            decoded.elements()[0],
            MessageElement::RichService(RichService {
                service_id: 1,
                content: "{\"key\":1}".into()
            })
        );
    }

    #[test]
    fn test_rich_msg_service_35_routing() {
        let forward = "<msg action=\"viewMultiMsg\" m_resid=\"RES\" m_fileName=\"F\" multiMsgFlag=\"0\"></msg>";
        let long = "<msg action=\"viewMultiMsg\" m_resid=\"RES\" m_fileName=\"RES\" multiMsgFlag=\"1\"></msg>";
        let plain = "<msg brief=\"x\"></msg>";

        let decode_single = |content: &str| {
            let wire = vec![WireElement::RichMsg(RichMsgElem {
                service_id: 35,
                template: FlaggedPayload::encode_raw(content),
            })];
            decode_elements(&wire, &ctx()).unwrap().elements()[0].clone()
        };

        assert!(
            matches!(decode_single(forward), MessageElement::ForwardRef(f) if f.res_id == "RES")
        );
        assert!(
            matches!(decode_single(long), MessageElement::LongMessageRef(l) if l.res_id == "RES")
        );
        assert!(matches!(
            decode_single(plain),
            MessageElement::RichService(_)
        ));
    }

    #[test]
    fn test_rich_msg_nested_forward_without_res_id() {
        let content = "<msg action=\"viewMultiMsg\" m_fileName=\"NESTED\"></msg>";
        let wire = vec![WireElement::RichMsg(RichMsgElem {
            service_id: 35,
            template: FlaggedPayload::encode_raw(content),
        })];
        let decoded = decode_elements(&wire, &ctx()).unwrap();
        assert!(matches!(
            &decoded.elements()[0],
            MessageElement::ForwardRef(f) if f.res_id.is_empty() && f.file_name == "NESTED"
        ));
    }

    #[test]
    fn test_malformed_rich_msg_propagates() {
        let wire = vec![WireElement::RichMsg(RichMsgElem {
            service_id: 1,
            template: vec![0x07, 1, 2, 3],
        })];
        let err = decode_elements(&wire, &ctx()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownCompressionFlag { .. }));
    }

    #[test]
    fn test_unknown_common_service_type_is_skipped() {
        let wire = vec![
            WireElement::Common(CommonElem {
                service_type: 999,
                business_type: 0,
                payload: vec![1, 2, 3],
            }),
            WireElement::Text(TextElem::plain("after")),
        ];
        let decoded = decode_elements(&wire, &ctx()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.elements()[0], MessageElement::Text("after".into()));
    }

    #[test]
    fn test_decode_message_attaches_source() {
        let meta = IncomingMeta {
            kind: SourceKind::FromGroup,
            sender: UserId(10),
            target: UserId(20),
            time: Timestamp(1_700_000_000),
            sequence_ids: vec![SequenceId(7)],
            internal_ids: vec![InternalId(9)],
        };
        let wire = vec![WireElement::Text(TextElem::plain("hi"))];
        let chain = decode_message(&meta, &wire, &ctx()).unwrap();

        let source = chain.source().unwrap();
        assert_eq!(source.sender(), UserId(10));
        assert_eq!(source.sequence_ids().unwrap(), vec![SequenceId(7)]);
        assert_eq!(
            source.original_message().unwrap().elements()[0],
            MessageElement::Text("hi".into())
        );
    }
}
