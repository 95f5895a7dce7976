//! Asynchronous sequence-number resolution
//!
//! Sequence numbers for an outgoing message are assigned by the server and
//! only become known when a correlated send receipt arrives. The resolver
//! models this as a promise keyed by the client-generated correlation id: the
//! transport layer feeds receipts into an [`AckRegistry`], and each outgoing
//! source holds a [`SequenceHandle`] that transitions exactly once from
//! pending to resolved (all fragments acknowledged) or degraded (timeout).
//!
//! Degradation is a defined fallback, not an error: after the per-fragment
//! budget times the fragment count elapses, the id list is permanently empty.
//! A chain split into N wire messages resolves only once all N receipts have
//! arrived; a partial set never produces a partial id list.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::ProtocolConfig;
use crate::errors::ResolveError;
use crate::transport::SendReceipt;
use crate::types::{InternalId, SequenceId};

// ----------------------------------------------------------------------------
// Sequence State
// ----------------------------------------------------------------------------

/// Resolution state of an outgoing source's sequence numbers.
///
/// The transition is one-way: `Pending` moves to exactly one of `Resolved`
/// or `Degraded` and never changes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceState {
    /// Receipts still outstanding
    Pending,
    /// All fragments acknowledged within the timeout window
    Resolved(Vec<SequenceId>),
    /// Timed out; the id list is permanently empty
    Degraded,
}

// ----------------------------------------------------------------------------
// Sequence Handle
// ----------------------------------------------------------------------------

/// Shared, write-once view of a resolution outcome. Cloning is cheap and all
/// clones observe the same transition.
#[derive(Debug, Clone)]
pub struct SequenceHandle {
    rx: watch::Receiver<SequenceState>,
}

impl SequenceHandle {
    /// A handle that is already resolved (used for provided ids and tests)
    pub fn resolved(ids: Vec<SequenceId>) -> Self {
        let (_tx, rx) = watch::channel(SequenceState::Resolved(ids));
        Self { rx }
    }

    pub(crate) fn from_watch(rx: watch::Receiver<SequenceState>) -> Self {
        Self { rx }
    }

    /// Current state snapshot
    pub fn state(&self) -> SequenceState {
        self.rx.borrow().clone()
    }

    /// Read the sequence ids without waiting. Fails while still pending;
    /// succeeds with an empty list after degradation.
    pub fn try_ids(&self) -> Result<Vec<SequenceId>, ResolveError> {
        match &*self.rx.borrow() {
            SequenceState::Pending => Err(ResolveError::StillPending),
            SequenceState::Resolved(ids) => Ok(ids.clone()),
            SequenceState::Degraded => Ok(Vec::new()),
        }
    }

    /// Wait until resolution or degradation and return the id list (empty
    /// when degraded). Safe to call from any number of readers.
    pub async fn wait(&self) -> Vec<SequenceId> {
        let mut rx = self.rx.clone();
        loop {
            match &*rx.borrow() {
                SequenceState::Resolved(ids) => return ids.clone(),
                SequenceState::Degraded => return Vec::new(),
                SequenceState::Pending => {}
            }
            // Sender dropped without a transition counts as degraded
            if rx.changed().await.is_err() {
                return Vec::new();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Ack Registry
// ----------------------------------------------------------------------------

/// Registry of outstanding correlation ids. The transport's inbound event
/// listener calls [`AckRegistry::deliver`] for every send receipt; matching
/// waiters are woken, unmatched receipts are dropped with a trace.
#[derive(Debug, Default)]
pub struct AckRegistry {
    pending: Mutex<HashMap<InternalId, oneshot::Sender<SequenceId>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a send receipt. Returns true when a waiter was matched.
    pub fn deliver(&self, receipt: SendReceipt) -> bool {
        let sender = {
            let mut pending = self.pending.lock().expect("ack registry poisoned");
            pending.remove(&receipt.internal_id)
        };
        match sender {
            Some(tx) => {
                // A dropped receiver just means the waiter already timed out
                let delivered = tx.send(receipt.sequence_id).is_ok();
                trace!(
                    internal_id = receipt.internal_id.value(),
                    sequence_id = receipt.sequence_id.value(),
                    delivered,
                    "send receipt matched"
                );
                delivered
            }
            None => {
                trace!(
                    internal_id = receipt.internal_id.value(),
                    "send receipt did not match any pending fragment"
                );
                false
            }
        }
    }

    /// Number of outstanding fragments
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("ack registry poisoned").len()
    }

    fn register(&self, id: InternalId) -> oneshot::Receiver<SequenceId> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("ack registry poisoned");
        if pending.insert(id, tx).is_some() {
            warn!(internal_id = id.value(), "correlation id re-registered; dropping prior waiter");
        }
        rx
    }

    fn unregister(&self, ids: &[InternalId]) {
        let mut pending = self.pending.lock().expect("ack registry poisoned");
        for id in ids {
            pending.remove(id);
        }
    }
}

// ----------------------------------------------------------------------------
// Sequence Resolver
// ----------------------------------------------------------------------------

/// Drives pending sources to resolution against an [`AckRegistry`].
#[derive(Debug)]
pub struct SequenceResolver {
    registry: std::sync::Arc<AckRegistry>,
    config: ProtocolConfig,
}

impl SequenceResolver {
    pub fn new(registry: std::sync::Arc<AckRegistry>, config: ProtocolConfig) -> Self {
        Self { registry, config }
    }

    /// The registry receipts must be delivered into
    pub fn registry(&self) -> &std::sync::Arc<AckRegistry> {
        &self.registry
    }

    /// Begin waiting for the receipts of a message split into the given
    /// fragments. Must be called before the message bytes are handed to the
    /// transport, or a fast receipt could race the registration.
    ///
    /// The returned handle resolves once every fragment is acknowledged, in
    /// `internal_ids` order, or degrades after the per-fragment budget times
    /// the fragment count.
    pub fn begin(&self, internal_ids: &[InternalId]) -> SequenceHandle {
        let (tx, rx) = watch::channel(SequenceState::Pending);
        let receivers: Vec<(InternalId, oneshot::Receiver<SequenceId>)> = internal_ids
            .iter()
            .map(|&id| (id, self.registry.register(id)))
            .collect();

        let ids: Vec<InternalId> = internal_ids.to_vec();
        let timeout = self.config.ack_timeout_for(ids.len());
        let registry = std::sync::Arc::clone(&self.registry);

        tokio::spawn(async move {
            let all = futures::future::join_all(
                receivers.into_iter().map(|(_, rx)| rx),
            );
            match tokio::time::timeout(timeout, all).await {
                Ok(results) if results.iter().all(|r| r.is_ok()) => {
                    let seqs: Vec<SequenceId> =
                        results.into_iter().map(|r| r.expect("checked ok")).collect();
                    debug!(fragments = seqs.len(), "sequence ids resolved");
                    let _ = tx.send(SequenceState::Resolved(seqs));
                }
                Ok(_) | Err(_) => {
                    // Timed out, or a waiter was dropped by re-registration.
                    // Either way the id list stays permanently empty.
                    debug!(fragments = ids.len(), "sequence resolution degraded");
                    registry.unregister(&ids);
                    let _ = tx.send(SequenceState::Degraded);
                }
            }
        });

        SequenceHandle { rx }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
