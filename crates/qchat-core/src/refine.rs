//! Post-decode refinement
//!
//! Decoding produces "shallow" elements for payloads whose meaning is only
//! discoverable by inspecting their contents: generic app shares and generic
//! service messages. Refinement upgrades these into richer semantic elements
//! in two phases.
//!
//! The **light** phase is synchronous and performs no I/O: it only consumes
//! already-decoded data (recognizing a music card inside an app share, a
//! dice roll inside a marketplace sticker). The **deep** phase may hit the
//! network: it fetches the node lists of forward-bundle references and
//! re-uploads bundles that carry no resource id. Both phases are idempotent:
//! refining an element with no special structure returns it unchanged, and
//! refining twice equals refining once.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::ProtocolConfig;
use crate::errors::QchatError;
use crate::forward::{ForwardBundle, ForwardUploader, TransmitEnvelope, ROOT_BUNDLE_NAME};
use crate::message::chain::MessageChain;
use crate::message::element::{
    DiceRoll, ForwardRef, LightApp, MarketFace, MessageElement, MusicKind, MusicShare,
};
use crate::transport::{BundleTransport, ResourceKind};
use crate::types::UserId;

// ----------------------------------------------------------------------------
// Refine Context
// ----------------------------------------------------------------------------

/// Well-known context keys
pub mod keys {
    /// Id of the account running this client
    pub const BOT_ID: &str = "bot_id";
    /// Group the chain was received in, when any
    pub const GROUP_ID: &str = "group_id";
    /// Peer category of the sender ("friend", "group", "temp", "stranger")
    pub const SENDER_KIND: &str = "sender_kind";
}

/// One context value
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Id(u64),
    Text(String),
    Flag(bool),
}

/// Immutable key→value bag threaded through decode and refine calls.
///
/// Decode context varies per call and must not leak across unrelated chains,
/// so it is passed explicitly instead of living in an ambient registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefineContext {
    entries: HashMap<&'static str, ContextValue>,
}

impl RefineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion
    pub fn with(mut self, key: &'static str, value: ContextValue) -> Self {
        self.entries.insert(key, value);
        self
    }

    pub fn with_id(self, key: &'static str, id: u64) -> Self {
        self.with(key, ContextValue::Id(id))
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    pub fn id(&self, key: &str) -> Option<u64> {
        match self.entries.get(key) {
            Some(ContextValue::Id(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ContextValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(ContextValue::Flag(flag)) => Some(*flag),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Light Refinement
// ----------------------------------------------------------------------------

/// Synchronous refinement over already-decoded data. No I/O.
pub fn refine_light(chain: MessageChain, ctx: &RefineContext) -> MessageChain {
    MessageChain::from_elements(
        chain
            .into_iter()
            .map(|element| refine_one_light(element, ctx)),
    )
}

fn refine_one_light(element: MessageElement, _ctx: &RefineContext) -> MessageElement {
    match element {
        MessageElement::LightApp(app) => refine_light_app(app),
        MessageElement::MarketFace(face) => refine_market_face(face),
        other => other,
    }
}

fn refine_market_face(face: MarketFace) -> MessageElement {
    if face.tab_id == DiceRoll::TAB_ID {
        // The rolled value sits in the last byte of the mobile-parameter
        // block, offset by the ASCII digit base
        if let Some(&last) = face.mobile_param.last() {
            let value = last.wrapping_sub(47);
            if (1..=6).contains(&value) {
                return MessageElement::DiceRoll(DiceRoll { value, raw: face });
            }
        }
    }
    MessageElement::MarketFace(face)
}

fn refine_light_app(app: LightApp) -> MessageElement {
    let Some(parsed) = parse_light_app(&app.content) else {
        return MessageElement::LightApp(app);
    };
    if let Some(music) = parsed.meta.music {
        if let Some(kind) = MusicKind::from_app_id(music.appid) {
            debug!(appid = music.appid, "app share refined to music card");
            return MessageElement::MusicShare(MusicShare {
                kind,
                title: music.title,
                summary: music.desc,
                jump_url: music.jump_url,
                picture_url: music.preview,
                music_url: music.music_url,
                brief: parsed.prompt,
                origin: Some(app.content),
            });
        }
    }
    MessageElement::LightApp(app)
}

// ----------------------------------------------------------------------------
// Deep Refinement
// ----------------------------------------------------------------------------

/// Collaborators the deep phase may need: the bundle transport for fetching
/// stored node lists and re-uploading unresolved bundles
pub struct RefineServices<'a> {
    pub transport: &'a dyn BundleTransport,
    pub config: &'a ProtocolConfig,
    /// Upload target used when an unresolved bundle must be re-uploaded
    pub target: UserId,
}

/// Asynchronous refinement applied once when a chain reaches
/// application-facing consumers. Includes everything the light phase does.
///
/// Safe to invoke concurrently for independent chains. Identical bundles
/// refined concurrently may each trigger their own upload; deduplication is
/// a caller concern.
pub async fn refine_deep(
    chain: MessageChain,
    ctx: &RefineContext,
    services: &RefineServices<'_>,
) -> Result<MessageChain, QchatError> {
    let mut builder = MessageChain::builder();
    for element in chain {
        let refined = refine_one_deep(refine_one_light(element, ctx), ctx, services).await?;
        builder.push(refined);
    }
    Ok(builder.build())
}

async fn refine_one_deep(
    element: MessageElement,
    ctx: &RefineContext,
    services: &RefineServices<'_>,
) -> Result<MessageElement, QchatError> {
    match element {
        MessageElement::LightApp(app) => {
            // Multi-message app shares embed the resource id of a stored
            // forward bundle
            let Some(parsed) = parse_light_app(&app.content) else {
                return Ok(MessageElement::LightApp(app));
            };
            if parsed.app != "com.tencent.multimsg" {
                return Ok(MessageElement::LightApp(app));
            }
            let Some(detail) = parsed.meta.detail else {
                return Ok(MessageElement::LightApp(app));
            };
            if detail.res_id.is_empty() {
                return Ok(MessageElement::LightApp(app));
            }
            match fetch_nodes(services, &detail.res_id, &detail.file_name, ctx).await {
                Ok(nodes) => Ok(MessageElement::ForwardRef(ForwardRef {
                    res_id: detail.res_id,
                    file_name: detail.file_name,
                    nodes,
                })),
                Err(err) => {
                    // The share still renders without its node list
                    warn!(res_id = %detail.res_id, error = %err, "forward bundle fetch failed");
                    Ok(MessageElement::LightApp(app))
                }
            }
        }
        MessageElement::ForwardRef(mut fref) if fref.nodes.is_empty() && !fref.res_id.is_empty() => {
            fref.nodes = fetch_nodes(services, &fref.res_id, &fref.file_name, ctx).await?;
            Ok(MessageElement::ForwardRef(fref))
        }
        MessageElement::ForwardRef(fref) if fref.res_id.is_empty() && !fref.nodes.is_empty() => {
            // No embedded resource id: fall back to uploading the nodes we
            // have to obtain one
            let bundle = ForwardBundle::new(fref.nodes.clone());
            let uploader = ForwardUploader::new(
                services.transport,
                services.config,
                ResourceKind::ForwardBundle,
                services.target,
            );
            let res_id = uploader.upload(&bundle).await?;
            Ok(MessageElement::ForwardRef(ForwardRef { res_id, ..fref }))
        }
        MessageElement::ForwardBundle(bundle) => {
            let uploader = ForwardUploader::new(
                services.transport,
                services.config,
                ResourceKind::ForwardBundle,
                services.target,
            );
            let nodes = bundle.nodes.clone();
            let res_id = uploader.upload(&bundle).await?;
            Ok(MessageElement::ForwardRef(ForwardRef {
                res_id,
                file_name: ROOT_BUNDLE_NAME.to_owned(),
                nodes,
            }))
        }
        other => Ok(other),
    }
}

async fn fetch_nodes(
    services: &RefineServices<'_>,
    res_id: &str,
    file_name: &str,
    ctx: &RefineContext,
) -> Result<Vec<crate::forward::BundleNode>, QchatError> {
    let blob = services
        .transport
        .download_bundle(res_id)
        .await
        .map_err(QchatError::Upload)?;
    let envelope = TransmitEnvelope::from_compressed_bytes(&blob).map_err(QchatError::Upload)?;
    let name = if !file_name.is_empty() && envelope.items.iter().any(|i| i.name == file_name) {
        file_name
    } else {
        ROOT_BUNDLE_NAME
    };
    envelope.nodes_for(name, ctx)
}

// ----------------------------------------------------------------------------
// App Share Payload
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct LightAppStruct {
    #[serde(default)]
    app: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    meta: LightAppMeta,
}

#[derive(Debug, Default, Deserialize)]
struct LightAppMeta {
    #[serde(default)]
    music: Option<LightAppMusic>,
    #[serde(default)]
    detail: Option<MultiMsgDetail>,
}

#[derive(Debug, Deserialize)]
struct LightAppMusic {
    #[serde(default)]
    appid: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    desc: String,
    #[serde(default, rename = "jumpUrl")]
    jump_url: String,
    #[serde(default, rename = "musicUrl")]
    music_url: String,
    #[serde(default)]
    preview: String,
}

#[derive(Debug, Deserialize)]
struct MultiMsgDetail {
    #[serde(default, rename = "resid")]
    res_id: String,
    #[serde(default, rename = "uniseq")]
    file_name: String,
}

fn parse_light_app(content: &str) -> Option<LightAppStruct> {
    serde_json::from_str(content).ok()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
