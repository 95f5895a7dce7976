//! Codec round-trip and cleanup tests
//!
//! End-to-end coverage of the encode/decode pair over the full element
//! vocabulary, the legacy-artifact cleanup invariant, and the refinement
//! scenarios, without any network I/O.

use qchat_core::message::element::{
    CustomExtension, DiceRoll, ImageKind, ImageRef, LightApp, LongMessageRef, MarketFace,
    MessageElement, Poke, RichService, VipFace, Voice,
};
use qchat_core::protocol::encode::{EncodeContext, TargetContext};
use qchat_core::protocol::wire::{AtAttr, WireElement};
use qchat_core::{
    decode_elements, encode_chain, refine_light, GroupId, InternalId, MessageChain, MessageSource,
    RefineContext, SequenceId, Timestamp, UserId,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn ctx() -> RefineContext {
    RefineContext::new()
}

/// Encode without trailing capability flags, decode, and refine lightly —
/// the application-facing round trip for a stored chain
fn roundtrip(chain: &MessageChain) -> MessageChain {
    let wire = encode_chain(chain, &EncodeContext::nested_forward()).unwrap();
    refine_light(decode_elements(&wire, &ctx()).unwrap(), &ctx())
}

fn group_image() -> ImageRef {
    ImageRef {
        kind: ImageKind::GroupOffline,
        image_id: "{A5F68BD5-05F8-148B-9DA7-FECD026D30AD}.jpg".into(),
        md5: vec![0xAB; 16],
        width: 640,
        height: 480,
        size: 12_345,
        format: 1000,
        is_emoji: false,
        url: None,
    }
}

fn friend_image_online() -> ImageRef {
    ImageRef {
        kind: ImageKind::FriendOnline,
        image_id: "/12345-6789-ABCDEF".into(),
        md5: vec![0xCD; 16],
        width: 100,
        height: 100,
        size: 999,
        format: 2000,
        is_emoji: true,
        url: Some("https://img.example.com/12345".into()),
    }
}

// ----------------------------------------------------------------------------
// Scenario A: mention resolution
// ----------------------------------------------------------------------------

#[test]
fn scenario_a_mention_encodes_with_display_name_and_decodes_back() {
    let chain = MessageChain::from_elements([
        MessageElement::At {
            target: UserId(123),
            display: None,
        },
        MessageElement::Text(" hello".into()),
    ]);
    let encode_ctx = EncodeContext::standard(
        TargetContext::group(UserId(555), GroupId(777)).with_member_name(UserId(123), "Bob"),
    );
    let wire = encode_chain(&chain, &encode_ctx).unwrap();

    // Wire shape: mention text with the member's uin, then the plain run
    let WireElement::Text(at_text) = &wire[0] else {
        panic!("expected mention text first");
    };
    assert_eq!(at_text.content, "@Bob");
    assert_eq!(AtAttr::parse(&at_text.at_attr).unwrap().target, 123);
    let WireElement::Text(rest) = &wire[1] else {
        panic!("expected plain text second");
    };
    assert_eq!(rest.content, " hello");

    // Decoding yields the mention and the untouched plain run
    let decoded = decode_elements(&wire[..2], &ctx()).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(
        decoded.elements()[0],
        MessageElement::At {
            target: UserId(123),
            display: Some("Bob".into())
        }
    );
    assert_eq!(decoded.elements()[1], MessageElement::Text(" hello".into()));
}

// ----------------------------------------------------------------------------
// Scenario B: poke fallback cleanup
// ----------------------------------------------------------------------------

#[test]
fn scenario_b_poke_fallback_is_stripped_on_decode() {
    let chain = MessageChain::from_elements([MessageElement::Poke(Poke {
        kind: 1,
        id: -1,
        name: "poke".into(),
    })]);
    let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
    // The wire carries the poke and its legacy placeholder
    assert_eq!(wire.len(), 2);

    let decoded = decode_elements(&wire, &ctx()).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(
        decoded.elements()[0],
        MessageElement::Poke(Poke {
            kind: 1,
            id: -1,
            name: "poke".into(),
        })
    );
}

// ----------------------------------------------------------------------------
// Scenario C: music refinement
// ----------------------------------------------------------------------------

#[test]
fn scenario_c_music_light_app_refines_and_unrelated_stays() {
    let music_json = r#"{
        "app": "com.tencent.structmsg",
        "prompt": "[Share] Fashion",
        "meta": {
            "music": {
                "appid": 100495085,
                "title": "Fashion",
                "desc": "rinahamu/Yunomi",
                "jumpUrl": "https://music.example.com/song/1",
                "musicUrl": "https://music.example.com/song/1/media",
                "preview": "https://music.example.com/song/1/cover.jpg"
            }
        }
    }"#;
    let chain = MessageChain::from_elements([MessageElement::LightApp(LightApp::new(music_json))]);
    let refined = refine_light(chain, &ctx());
    let MessageElement::MusicShare(music) = &refined.elements()[0] else {
        panic!("expected a music share");
    };
    assert_eq!(music.title, "Fashion");
    assert_eq!(music.music_url, "https://music.example.com/song/1/media");

    let unrelated = r#"{"app":"com.example.widget","meta":{"other":1}}"#;
    let chain = MessageChain::from_elements([MessageElement::LightApp(LightApp::new(unrelated))]);
    let refined = refine_light(chain.clone(), &ctx());
    assert_eq!(refined, chain);
}

// ----------------------------------------------------------------------------
// Round Trips
// ----------------------------------------------------------------------------

#[test]
fn roundtrip_text_and_faces() {
    let chain = MessageChain::from_elements([
        MessageElement::Text("hello".into()),
        MessageElement::Face(13),
        MessageElement::AtAll,
    ]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_mention_with_display() {
    let chain = MessageChain::from_elements([
        MessageElement::At {
            target: UserId(42),
            display: Some("Carol".into()),
        },
        MessageElement::Text(" hi".into()),
    ]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_images() {
    let chain = MessageChain::from_elements([
        MessageElement::Image(group_image()),
        MessageElement::Image(friend_image_online()),
    ]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_flash_image_strips_own_fallback() {
    let chain = MessageChain::from_elements([MessageElement::FlashImage(group_image())]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_voice() {
    let chain = MessageChain::from_elements([MessageElement::Voice(Voice {
        name: "clip.amr".into(),
        md5: vec![0x11; 16],
        size: 2048,
        codec: 4,
        download_token: vec![9, 9, 9],
    })]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_vip_face_with_formula_fallback() {
    let chain = MessageChain::from_elements([MessageElement::VipFace(VipFace {
        kind_id: 9,
        kind_name: "Gift".into(),
        count: 3,
    })]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_market_face_and_dice() {
    let sticker = MarketFace {
        tab_id: 5201,
        name: "Wiggle".into(),
        item_type: 6,
        sub_type: 3,
        face_id: vec![1, 2, 3],
        key: b"k".to_vec(),
        mobile_param: Vec::new(),
        width: 200,
        height: 200,
    };
    let chain = MessageChain::from_elements([MessageElement::MarketFace(sticker)]);
    assert_eq!(roundtrip(&chain), chain);

    let dice = DiceRoll::new(4).unwrap();
    let chain = MessageChain::from_elements([MessageElement::DiceRoll(dice)]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_rich_service_and_light_app() {
    let chain = MessageChain::from_elements([
        MessageElement::RichService(RichService {
            service_id: 1,
            content: "{\"view\":\"news\"}".into(),
        }),
        MessageElement::LightApp(LightApp::new(r#"{"app":"com.example.widget"}"#)),
    ]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_music_share_via_refinement() {
    // Obtain a music share the way the pipeline produces one, then verify
    // it survives a second encode/decode/refine pass unchanged
    let music_json = r#"{
        "app": "com.tencent.structmsg",
        "prompt": "[Share] Song",
        "meta": {"music": {"appid": 100497308, "title": "Song",
            "desc": "Artist", "jumpUrl": "https://j", "musicUrl": "https://m",
            "preview": "https://p"}}
    }"#;
    let refined = refine_light(
        MessageChain::from_elements([MessageElement::LightApp(LightApp::new(music_json))]),
        &ctx(),
    );
    assert!(matches!(
        refined.elements()[0],
        MessageElement::MusicShare(_)
    ));
    assert_eq!(roundtrip(&refined), refined);
}

#[test]
fn roundtrip_long_message_ref() {
    let content = qchat_core::forward::long_message_template("LONG-7", "[Long message]");
    let chain = MessageChain::from_elements([MessageElement::LongMessageRef(LongMessageRef {
        res_id: "LONG-7".into(),
        content,
    })]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_forward_ref_identity() {
    let chain = MessageChain::from_elements([MessageElement::ForwardRef(
        qchat_core::message::element::ForwardRef {
            res_id: "RES-1".into(),
            file_name: "MultiMsg".into(),
            nodes: Vec::new(),
        },
    )]);
    let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
    let decoded = decode_elements(&wire, &ctx()).unwrap();

    let MessageElement::ForwardRef(fref) = &decoded.elements()[0] else {
        panic!("expected forward ref");
    };
    assert_eq!(fref.res_id, "RES-1");
    assert_eq!(fref.file_name, "MultiMsg");
    assert_eq!(decoded.len(), 1, "forward fallback text stripped");
}

#[test]
fn roundtrip_custom_extension() {
    let chain = MessageChain::from_elements([MessageElement::CustomExtension(CustomExtension {
        type_tag: 103_904_510,
        payload: vec![5, 4, 3, 2, 1],
    })]);
    assert_eq!(roundtrip(&chain), chain);
}

#[test]
fn roundtrip_quote_snapshot() {
    let source = MessageSource::offline(UserId(10), UserId(20), Timestamp(1_700_000_000))
        .with_sequence_ids(vec![SequenceId(55)])
        .with_internal_ids(vec![InternalId(77)])
        .with_original(MessageChain::from_elements([MessageElement::Text(
            "original words".into(),
        )]));
    let chain = MessageChain::from_elements([
        MessageElement::Quote(source),
        MessageElement::Text("replying".into()),
    ]);

    let round = roundtrip(&chain);
    assert_eq!(round.len(), 2);
    let quoted = round.quote().unwrap();
    assert_eq!(quoted.sender(), UserId(10));
    assert_eq!(quoted.sequence_ids().unwrap(), vec![SequenceId(55)]);
    assert_eq!(quoted.internal_ids(), &[InternalId(77)]);
    assert_eq!(
        quoted.original_message().unwrap().elements()[0],
        MessageElement::Text("original words".into())
    );
    assert_eq!(round.elements()[1], MessageElement::Text("replying".into()));
}

// ----------------------------------------------------------------------------
// Cleanup Invariant
// ----------------------------------------------------------------------------

#[test]
fn cleanup_strips_every_paired_placeholder() {
    // One chain exercising all placeholder pairs at once
    let chain = MessageChain::from_elements([
        MessageElement::FlashImage(group_image()),
        MessageElement::Poke(Poke {
            kind: 1,
            id: -1,
            name: "poke".into(),
        }),
        MessageElement::VipFace(VipFace {
            kind_id: 9,
            kind_name: "Gift".into(),
            count: 12,
        }),
        MessageElement::Text("tail".into()),
    ]);
    let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
    // Every special element put its placeholder on the wire
    assert!(wire.len() > chain.len());

    let decoded = decode_elements(&wire, &ctx()).unwrap();
    assert_eq!(decoded, chain);
}

#[test]
fn cleanup_is_stable_when_reapplied() {
    let chain = MessageChain::from_elements([
        MessageElement::Poke(Poke {
            kind: 1,
            id: -1,
            name: "poke".into(),
        }),
        MessageElement::Text("after".into()),
    ]);
    let once = roundtrip(&chain);
    let twice = roundtrip(&once);
    assert_eq!(once, twice);
    assert_eq!(once, chain);
}

// ----------------------------------------------------------------------------
// Single-Instance Invariant
// ----------------------------------------------------------------------------

#[test]
fn single_instance_last_write_wins_repeatedly() {
    let build = || {
        MessageChain::from_elements([
            MessageElement::Source(MessageSource::offline(UserId(1), UserId(0), Timestamp(1))),
            MessageElement::Text("x".into()),
            MessageElement::Source(MessageSource::offline(UserId(2), UserId(0), Timestamp(2))),
        ])
    };
    for _ in 0..10 {
        let chain = build();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.source().unwrap().sender(), UserId(2));
    }
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

mod properties {
    use super::*;
    use proptest::prelude::*;
    use qchat_core::protocol::tlv::{TagWidth, Tlv};
    use qchat_core::protocol::wire::FlaggedPayload;
    use std::collections::BTreeMap;

    proptest! {
        #[test]
        fn tlv_roundtrips_unique_tags(entries in proptest::collection::btree_map(
            0u32..0xFE, proptest::collection::vec(any::<u8>(), 0..64), 0..8)
        ) {
            let mut tlv = Tlv::new();
            for (tag, value) in &entries {
                tlv = tlv.put(*tag, value.clone());
            }
            let decoded = Tlv::decode(&tlv.encode(TagWidth::One, false), TagWidth::One, false)
                .unwrap();
            let decoded_map: BTreeMap<u32, Vec<u8>> = entries
                .keys()
                .map(|tag| (*tag, decoded.get(*tag).unwrap().to_vec()))
                .collect();
            prop_assert_eq!(decoded_map, entries);
        }

        #[test]
        fn flagged_payload_roundtrips(content in ".*") {
            let deflated = FlaggedPayload::encode_deflated(&content);
            prop_assert_eq!(
                FlaggedPayload::decode(&deflated, "prop").unwrap(),
                content.clone()
            );
            let raw = FlaggedPayload::encode_raw(&content);
            prop_assert_eq!(FlaggedPayload::decode(&raw, "prop").unwrap(), content);
        }

        #[test]
        fn plain_text_chains_roundtrip(texts in proptest::collection::vec("[^ ]{1,16}", 1..6)) {
            // Distinct non-space runs merge into one element after decode
            let chain = MessageChain::from_elements(
                texts.iter().map(|t| MessageElement::Text(t.clone())),
            );
            let wire = encode_chain(&chain, &EncodeContext::nested_forward()).unwrap();
            let decoded = decode_elements(&wire, &RefineContext::new()).unwrap();
            let expected: String = texts.concat();
            prop_assert_eq!(decoded.preview_text(), expected);
        }
    }
}
