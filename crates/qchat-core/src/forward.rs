//! Forward-bundle packing and upload
//!
//! A forwarded conversation excerpt is a named, ordered collection of message
//! nodes. Before it can be referenced from a chain it must be packed, along
//! with every nested bundle it contains, into one transmit envelope and
//! uploaded as a single blob, yielding an opaque resource id.
//!
//! The uploader keeps a name → node-list map seeded with the root under the
//! reserved name. Nested bundles that already carry a resource id are
//! referenced directly under a fresh name; nested bundles without one are
//! recursively uploaded by a fresh uploader whose map is merged back in with
//! its root re-keyed. Per-node (sequence, correlation) pairs are kept unique
//! within one emit pass, drawing fresh random pairs on collision.

use std::collections::HashSet;
use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression as GzCompression};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::errors::{QchatError, UploadError};
use crate::message::chain::MessageChain;
use crate::message::element::{ForwardRef, MessageElement};
use crate::protocol::decode::decode_elements;
use crate::protocol::encode::{encode_chain, EncodeContext};
use crate::protocol::wire::WireElement;
use crate::refine::RefineContext;
use crate::transport::{ApplyUploadRequest, ApplyUploadResponse, BundleTransport, ResourceKind};
use crate::types::{Timestamp, UserId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Reserved name of the root bundle inside a transmit envelope
pub const ROOT_BUNDLE_NAME: &str = "MultiMsg";

/// Nodes shown in the preview block of the forward template
const PREVIEW_NODE_COUNT: usize = 4;

// ----------------------------------------------------------------------------
// Bundle Model
// ----------------------------------------------------------------------------

/// One node of a forwarded conversation excerpt
#[derive(Debug, Clone, PartialEq)]
pub struct BundleNode {
    pub sender_id: UserId,
    pub sender_name: String,
    pub time: Timestamp,
    pub chain: MessageChain,
}

/// A forwarded-message bundle before upload. Consumed and discarded once the
/// upload completes and a resource id is obtained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardBundle {
    pub title: String,
    pub brief: String,
    pub source: String,
    pub summary: String,
    pub nodes: Vec<BundleNode>,
}

impl ForwardBundle {
    /// Bundle with display texts derived from the nodes
    pub fn new(nodes: Vec<BundleNode>) -> Self {
        Self {
            title: "Chat history".to_owned(),
            brief: "[Chat history]".to_owned(),
            source: "Chat history".to_owned(),
            summary: format!("View {} forwarded message(s)", nodes.len()),
            nodes,
        }
    }

    /// Preview lines shown by clients before the bundle is opened
    pub fn preview(&self) -> Vec<String> {
        self.nodes
            .iter()
            .take(PREVIEW_NODE_COUNT)
            .map(|node| format!("{}: {}", node.sender_name, node.chain.preview_text()))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Transmit Envelope
// ----------------------------------------------------------------------------

/// One encoded message inside a transmit envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sender: u64,
    pub sender_name: String,
    pub target: u64,
    pub time: u64,
    pub seq: u32,
    pub uid: u32,
    pub elements: Vec<WireElement>,
}

/// Named nested bundle buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitItem {
    pub name: String,
    pub buffer: Vec<u8>,
}

/// The multi-message transmit structure: root messages plus every named
/// bundle (the root included), compressed before upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitEnvelope {
    pub main: Vec<WireMessage>,
    pub items: Vec<TransmitItem>,
}

impl TransmitEnvelope {
    /// Serialize and gzip for upload
    pub fn to_compressed_bytes(&self) -> Result<Vec<u8>, UploadError> {
        let raw = bincode::serialize(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    /// Inverse of [`TransmitEnvelope::to_compressed_bytes`]
    pub fn from_compressed_bytes(data: &[u8]) -> Result<Self, UploadError> {
        let mut decoder = GzDecoder::new(data);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        Ok(bincode::deserialize(&raw)?)
    }

    /// Decode the named bundle back into nodes
    pub fn nodes_for(
        &self,
        name: &str,
        ctx: &RefineContext,
    ) -> Result<Vec<BundleNode>, QchatError> {
        let messages: Vec<WireMessage> = if name == ROOT_BUNDLE_NAME && !self.main.is_empty() {
            self.main.clone()
        } else {
            let item = self
                .items
                .iter()
                .find(|item| item.name == name)
                .ok_or_else(|| {
                    QchatError::Upload(UploadError::Rejected {
                        reason: format!("bundle {name:?} missing from envelope"),
                    })
                })?;
            bincode::deserialize(&item.buffer).map_err(UploadError::from)?
        };

        messages
            .iter()
            .map(|msg| {
                Ok(BundleNode {
                    sender_id: UserId(msg.sender),
                    sender_name: msg.sender_name.clone(),
                    time: Timestamp(msg.time),
                    chain: decode_elements(&msg.elements, ctx)?,
                })
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Forward Uploader
// ----------------------------------------------------------------------------

/// Packs a root bundle plus its nested bundles and drives the upload
/// protocol. One uploader handles one envelope; nested bundles get fresh
/// uploader instances whose results are merged in.
pub struct ForwardUploader<'a> {
    transport: &'a dyn BundleTransport,
    config: &'a ProtocolConfig,
    kind: ResourceKind,
    target: UserId,
    bundles: Vec<(String, Vec<WireMessage>)>,
}

impl<'a> ForwardUploader<'a> {
    pub fn new(
        transport: &'a dyn BundleTransport,
        config: &'a ProtocolConfig,
        kind: ResourceKind,
        target: UserId,
    ) -> Self {
        Self {
            transport,
            config,
            kind,
            target,
            bundles: vec![(ROOT_BUNDLE_NAME.to_owned(), Vec::new())],
        }
    }

    /// Pack and upload a bundle, returning its resource id
    pub async fn upload(mut self, bundle: &ForwardBundle) -> Result<String, QchatError> {
        self.emit(ROOT_BUNDLE_NAME.to_owned(), &bundle.nodes).await?;
        self.finish().await
    }

    /// Names currently present in the envelope (root included)
    pub fn bundle_names(&self) -> Vec<&str> {
        self.bundles.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.bundles.iter().any(|(n, _)| n == name)
    }

    fn entry_mut(&mut self, name: &str) -> &mut Vec<WireMessage> {
        if !self.contains(name) {
            self.bundles.push((name.to_owned(), Vec::new()));
        }
        let index = self
            .bundles
            .iter()
            .position(|(n, _)| n == name)
            .expect("entry just ensured");
        &mut self.bundles[index].1
    }

    /// Draw a collision-free nested bundle name
    fn fresh_name(&self) -> String {
        loop {
            let name = format!("{}", rand::random::<u32>());
            if !self.contains(&name) {
                return name;
            }
        }
    }

    fn emit<'b>(
        &'b mut self,
        name: String,
        nodes: &'b [BundleNode],
    ) -> BoxFuture<'b, Result<(), QchatError>> {
        Box::pin(async move {
            let mut seen_ids: HashSet<u64> = HashSet::new();
            let mut out: Vec<WireMessage> = Vec::with_capacity(nodes.len());

            for node in nodes {
                let chain = self.convert_nested(&node.chain).await?;

                let ctx = EncodeContext::nested_forward();
                let elements = encode_chain(&chain, &ctx)?;

                let (mut seq, mut uid) = match chain.source() {
                    Some(source) => (
                        source
                            .sequence_ids()
                            .ok()
                            .and_then(|ids| ids.first().map(|s| s.value() as i64))
                            .unwrap_or(-1),
                        source
                            .internal_ids()
                            .first()
                            .map(|id| id.value() as i64)
                            .unwrap_or(-1),
                    ),
                    None => (-1, -1),
                };
                loop {
                    if seq >= 0 && uid >= 0 {
                        let key = (seq as u64) << 32 | uid as u64;
                        if seen_ids.insert(key) {
                            break;
                        }
                    }
                    seq = (rand::random::<u32>() >> 1) as i64;
                    uid = (rand::random::<u32>() >> 1) as i64;
                }

                out.push(WireMessage {
                    sender: node.sender_id.value(),
                    sender_name: node.sender_name.clone(),
                    target: match self.kind {
                        ResourceKind::LongMessage => self.target.value(),
                        ResourceKind::ForwardBundle => 0,
                    },
                    time: node.time.as_secs(),
                    seq: seq as u32,
                    uid: uid as u32,
                    elements,
                });
            }

            self.entry_mut(&name).extend(out);
            Ok(())
        })
    }

    /// Rewrite a node chain whose content contains a nested forward bundle:
    /// already-uploaded bundles are referenced under a fresh name, the rest
    /// are uploaded by a fresh uploader and merged in
    async fn convert_nested(&mut self, chain: &MessageChain) -> Result<MessageChain, QchatError> {
        let has_nested = chain.any(|e| {
            matches!(
                e,
                MessageElement::ForwardBundle(_) | MessageElement::ForwardRef(_)
            )
        });
        if !has_nested {
            return Ok(chain.clone());
        }

        let mut builder = MessageChain::builder();
        for element in chain {
            match element {
                MessageElement::ForwardRef(fref) if !fref.res_id.is_empty() => {
                    // Previously uploaded: reference it directly, re-emitting
                    // its nodes under a fresh name
                    let nid = self.fresh_name();
                    self.emit(nid.clone(), &fref.nodes).await?;
                    builder.push(MessageElement::ForwardRef(ForwardRef {
                        res_id: fref.res_id.clone(),
                        file_name: nid,
                        nodes: fref.nodes.clone(),
                    }));
                }
                MessageElement::ForwardBundle(_) | MessageElement::ForwardRef(_) => {
                    // Not yet uploaded (or an unresolvable ref without a
                    // resource id): recurse with a fresh uploader and merge
                    // its bundle map into ours
                    let nested_nodes: &[BundleNode] = match element {
                        MessageElement::ForwardBundle(nested) => &nested.nodes,
                        MessageElement::ForwardRef(fref) => &fref.nodes,
                        _ => unreachable!("outer match arms"),
                    };
                    let child = ForwardUploader::new(
                        self.transport,
                        self.config,
                        self.kind,
                        self.target,
                    );
                    let (res_id, child_bundles) = child.upload_nested(nested_nodes).await?;

                    let mut child_root: Vec<WireMessage> = Vec::new();
                    for (child_name, messages) in child_bundles {
                        if child_name == ROOT_BUNDLE_NAME {
                            child_root = messages;
                        } else {
                            let merged_name = if self.contains(&child_name) {
                                self.fresh_name()
                            } else {
                                child_name
                            };
                            self.bundles.push((merged_name, messages));
                        }
                    }
                    let nid = self.fresh_name();
                    self.bundles.push((nid.clone(), child_root));

                    builder.push(MessageElement::ForwardRef(ForwardRef {
                        res_id,
                        file_name: nid,
                        nodes: nested_nodes.to_vec(),
                    }));
                }
                other => {
                    builder.push(other.clone());
                }
            }
        }
        Ok(builder.build())
    }

    /// Upload a nested bundle's nodes and hand the bundle map back to the
    /// parent for merging
    async fn upload_nested(
        mut self,
        nodes: &[BundleNode],
    ) -> Result<(String, Vec<(String, Vec<WireMessage>)>), QchatError> {
        self.emit(ROOT_BUNDLE_NAME.to_owned(), nodes).await?;
        let res_id = self.finish().await?;
        Ok((res_id, self.bundles))
    }

    fn build_envelope(&self) -> TransmitEnvelope {
        let main = self
            .bundles
            .iter()
            .find(|(name, _)| name == ROOT_BUNDLE_NAME)
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default();
        let items = self
            .bundles
            .iter()
            .map(|(name, messages)| TransmitItem {
                name: name.clone(),
                buffer: bincode::serialize(messages).expect("wire messages serialize"),
            })
            .collect();
        TransmitEnvelope { main, items }
    }

    /// Apply for the upload and push the compressed envelope if required
    async fn finish(&self) -> Result<String, QchatError> {
        let data = self.build_envelope().to_compressed_bytes()?;
        let digest: [u8; 32] = Sha256::digest(&data).into();

        let response = self
            .transport
            .apply_upload(ApplyUploadRequest {
                kind: self.kind,
                target: self.target,
                size: data.len() as u64,
                digest,
            })
            .await
            .map_err(QchatError::Upload)?;

        match response {
            ApplyUploadResponse::Exists { res_id } => {
                debug!(%res_id, "bundle already stored, skipping transfer");
                Ok(res_id)
            }
            ApplyUploadResponse::Required { res_id, ticket } => {
                let mut offset = 0u64;
                for chunk in data.chunks(self.config.upload_chunk_size) {
                    self.transport
                        .upload_chunk(&ticket, offset, chunk)
                        .await
                        .map_err(QchatError::Upload)?;
                    offset += chunk.len() as u64;
                    trace!(offset, total = data.len(), "bundle chunk pushed");
                }
                debug!(%res_id, size = data.len(), "bundle upload complete");
                Ok(res_id)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Forward Service Template
// ----------------------------------------------------------------------------

/// Templated service payload referencing an uploaded bundle. The attribute
/// set mirrors what official clients emit so the decoder's service-35 routing
/// round-trips: `m_resid`, `m_fileName`, `action="viewMultiMsg"` and
/// `multiMsgFlag="0"`.
pub fn forward_service_template(res_id: &str, file_name: &str, bundle: &ForwardBundle) -> String {
    let preview: String = bundle
        .preview()
        .iter()
        .map(|line| format!("<title size=\"26\" color=\"#777777\">{line}</title>"))
        .collect();
    format!(
        "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\
         <msg serviceID=\"35\" templateID=\"1\" action=\"viewMultiMsg\" brief=\"{brief}\" \
         m_resid=\"{res_id}\" m_fileName=\"{file_name}\" tSum=\"{count}\" sourceMsgId=\"0\" \
         url=\"\" flag=\"3\" adverSign=\"0\" multiMsgFlag=\"0\">\
         <item layout=\"1\"><title color=\"#000000\" size=\"34\">{title}</title>\
         {preview}<hr hidden=\"false\" style=\"0\" /><summary size=\"26\" color=\"#777777\">{summary}</summary></item>\
         <source name=\"{source}\"></source></msg>",
        brief = bundle.brief,
        count = bundle.nodes.len(),
        title = bundle.title,
        summary = bundle.summary,
        source = bundle.source,
    )
}

/// Templated service payload referencing an uploaded long message
/// (`multiMsgFlag="1"`).
pub fn long_message_template(res_id: &str, brief: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\
         <msg serviceID=\"35\" templateID=\"1\" action=\"viewMultiMsg\" brief=\"{brief}\" \
         m_resid=\"{res_id}\" m_fileName=\"{res_id}\" tSum=\"1\" sourceMsgId=\"0\" \
         url=\"\" flag=\"3\" adverSign=\"0\" multiMsgFlag=\"1\">\
         <item layout=\"1\"><title>{brief}</title></item><source name=\"\"></source></msg>"
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::element::MessageElement;
    use std::sync::Mutex;

    /// In-memory transport recording uploads
    #[derive(Default)]
    struct MemoryTransport {
        stored: Mutex<Vec<(String, Vec<u8>)>>,
        chunks: Mutex<Vec<(u64, usize)>>,
        counter: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl BundleTransport for MemoryTransport {
        async fn apply_upload(
            &self,
            request: ApplyUploadRequest,
        ) -> Result<ApplyUploadResponse, UploadError> {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            let res_id = format!("res-{}", *counter);
            self.stored
                .lock()
                .unwrap()
                .push((res_id.clone(), Vec::with_capacity(request.size as usize)));
            Ok(ApplyUploadResponse::Required {
                res_id,
                ticket: UploadTicket {
                    ticket: vec![1, 2, 3],
                    key: vec![4],
                },
            })
        }

        async fn upload_chunk(
            &self,
            _ticket: &UploadTicket,
            offset: u64,
            chunk: &[u8],
        ) -> Result<(), UploadError> {
            self.chunks.lock().unwrap().push((offset, chunk.len()));
            if let Some((_, data)) = self.stored.lock().unwrap().last_mut() {
                data.extend_from_slice(chunk);
            }
            Ok(())
        }

        async fn download_bundle(&self, res_id: &str) -> Result<Vec<u8>, UploadError> {
            self.stored
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == res_id)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| UploadError::transport("not stored"))
        }
    }

    use crate::transport::UploadTicket;

    fn text_node(sender: u64, name: &str, text: &str) -> BundleNode {
        BundleNode {
            sender_id: UserId(sender),
            sender_name: name.to_owned(),
            time: Timestamp(1_700_000_000),
            chain: MessageChain::from_elements([MessageElement::Text(text.into())]),
        }
    }

    #[tokio::test]
    async fn test_flat_bundle_uploads_single_entry() {
        let transport = MemoryTransport::default();
        let config = ProtocolConfig::default();
        let uploader = ForwardUploader::new(
            &transport,
            &config,
            ResourceKind::ForwardBundle,
            UserId(42),
        );

        let bundle = ForwardBundle::new(vec![
            text_node(1, "Alice", "hi"),
            text_node(2, "Bob", "hello"),
        ]);
        let res_id = uploader.upload(&bundle).await.unwrap();
        assert_eq!(res_id, "res-1");

        // Envelope round-trips through the stored blob
        let blob = transport.download_bundle(&res_id).await.unwrap();
        let envelope = TransmitEnvelope::from_compressed_bytes(&blob).unwrap();
        assert_eq!(envelope.main.len(), 2);
        assert_eq!(envelope.items.len(), 1);
        assert_eq!(envelope.items[0].name, ROOT_BUNDLE_NAME);
    }

    #[tokio::test]
    async fn test_nested_bundle_produces_two_named_entries() {
        let transport = MemoryTransport::default();
        let config = ProtocolConfig::default();
        let uploader = ForwardUploader::new(
            &transport,
            &config,
            ResourceKind::ForwardBundle,
            UserId(42),
        );

        let inner = ForwardBundle::new(vec![text_node(3, "Carol", "inner")]);
        let mut outer_nodes = vec![text_node(1, "Alice", "outer")];
        outer_nodes.push(BundleNode {
            sender_id: UserId(2),
            sender_name: "Bob".to_owned(),
            time: Timestamp(1_700_000_001),
            chain: MessageChain::from_elements([MessageElement::ForwardBundle(inner)]),
        });

        let res_id = uploader
            .upload(&ForwardBundle::new(outer_nodes))
            .await
            .unwrap();

        // The nested bundle uploaded first, then the outer one
        assert_eq!(res_id, "res-2");
        let blob = transport.download_bundle(&res_id).await.unwrap();
        let envelope = TransmitEnvelope::from_compressed_bytes(&blob).unwrap();

        // Exactly two named entries, no collisions
        assert_eq!(envelope.items.len(), 2);
        let names: HashSet<&str> = envelope.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(ROOT_BUNDLE_NAME));
    }

    #[tokio::test]
    async fn test_chunked_transfer_covers_whole_envelope() {
        let transport = MemoryTransport::default();
        let config = ProtocolConfig {
            upload_chunk_size: 16,
            ..ProtocolConfig::default()
        };
        let uploader = ForwardUploader::new(
            &transport,
            &config,
            ResourceKind::ForwardBundle,
            UserId(42),
        );

        let bundle = ForwardBundle::new(vec![text_node(1, "Alice", &"x".repeat(200))]);
        let res_id = uploader.upload(&bundle).await.unwrap();

        let chunks = transport.chunks.lock().unwrap().clone();
        assert!(chunks.len() > 1);
        // Offsets are contiguous
        let mut expected = 0u64;
        for (offset, len) in &chunks {
            assert_eq!(*offset, expected);
            expected += *len as u64;
        }

        let blob = transport.download_bundle(&res_id).await.unwrap();
        assert_eq!(blob.len() as u64, expected);
    }

    #[test]
    fn test_forward_template_carries_routing_attributes() {
        let bundle = ForwardBundle::new(vec![text_node(1, "Alice", "hi")]);
        let xml = forward_service_template("RES", "FILE", &bundle);
        assert!(xml.contains("m_resid=\"RES\""));
        assert!(xml.contains("m_fileName=\"FILE\""));
        assert!(xml.contains("action=\"viewMultiMsg\""));
        assert!(xml.contains("multiMsgFlag=\"0\""));
    }

    #[test]
    fn test_long_message_template_flag() {
        let xml = long_message_template("RES", "[Long message]");
        assert!(xml.contains("multiMsgFlag=\"1\""));
        assert!(xml.contains("m_resid=\"RES\""));
    }
}
