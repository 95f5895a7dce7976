//! Message provenance records
//!
//! Every chain carries at most one [`MessageSource`]: who sent it, to what
//! target, when, under which server sequence numbers, and whether it has been
//! recalled. Incoming and offline sources are fully known at construction;
//! outgoing sources are created with their sequence numbers still pending and
//! transition exactly once via the resolver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::ResolveError;
use crate::message::chain::MessageChain;
use crate::resolver::{SequenceHandle, SequenceState};
use crate::types::{InternalId, SequenceId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Source Kind
// ----------------------------------------------------------------------------

/// Direction and peer category of a message source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    ToFriend,
    ToGroup,
    ToTemp,
    ToStranger,
    FromFriend,
    FromGroup,
    FromTemp,
    FromStranger,
    /// Reconstructed from a stored snapshot (e.g. a quote of a message this
    /// client never saw live)
    Offline,
}

impl SourceKind {
    pub fn is_outgoing(self) -> bool {
        matches!(
            self,
            SourceKind::ToFriend | SourceKind::ToGroup | SourceKind::ToTemp | SourceKind::ToStranger
        )
    }

    pub fn is_incoming(self) -> bool {
        matches!(
            self,
            SourceKind::FromFriend
                | SourceKind::FromGroup
                | SourceKind::FromTemp
                | SourceKind::FromStranger
        )
    }

    pub fn is_group_context(self) -> bool {
        matches!(self, SourceKind::ToGroup | SourceKind::FromGroup)
    }
}

// ----------------------------------------------------------------------------
// Message Source
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum SequenceNumbers {
    Known(Vec<SequenceId>),
    Pending(SequenceHandle),
}

/// Provenance record of one message chain.
///
/// Clones share the recalled flag and the pending sequence state, so a clone
/// embedded in a quote observes the same resolution as the original.
#[derive(Debug, Clone)]
pub struct MessageSource {
    kind: SourceKind,
    sender: UserId,
    target: UserId,
    time: Timestamp,
    internal_ids: Vec<InternalId>,
    seq: SequenceNumbers,
    recalled: Arc<AtomicBool>,
    original: Option<Box<MessageChain>>,
}

impl MessageSource {
    /// Source for an incoming message; fully known at construction
    pub fn incoming(
        kind: SourceKind,
        sender: UserId,
        target: UserId,
        time: Timestamp,
        sequence_ids: Vec<SequenceId>,
        internal_ids: Vec<InternalId>,
    ) -> Self {
        debug_assert!(kind.is_incoming());
        Self {
            kind,
            sender,
            target,
            time,
            internal_ids,
            seq: SequenceNumbers::Known(sequence_ids),
            recalled: Arc::new(AtomicBool::new(false)),
            original: None,
        }
    }

    /// Source reconstructed from a stored snapshot
    pub fn offline(sender: UserId, target: UserId, time: Timestamp) -> Self {
        Self {
            kind: SourceKind::Offline,
            sender,
            target,
            time,
            internal_ids: Vec::new(),
            seq: SequenceNumbers::Known(Vec::new()),
            recalled: Arc::new(AtomicBool::new(false)),
            original: None,
        }
    }

    /// Source for an outgoing message whose sequence numbers are pending
    /// resolution through the given handle
    pub fn outgoing(
        kind: SourceKind,
        sender: UserId,
        target: UserId,
        time: Timestamp,
        internal_ids: Vec<InternalId>,
        handle: SequenceHandle,
    ) -> Self {
        debug_assert!(kind.is_outgoing());
        Self {
            kind,
            sender,
            target,
            time,
            internal_ids,
            seq: SequenceNumbers::Pending(handle),
            recalled: Arc::new(AtomicBool::new(false)),
            original: None,
        }
    }

    /// Known sequence ids at construction (friend sends return them in the
    /// send response rather than via receipts)
    pub fn outgoing_known(
        kind: SourceKind,
        sender: UserId,
        target: UserId,
        time: Timestamp,
        internal_ids: Vec<InternalId>,
        sequence_ids: Vec<SequenceId>,
    ) -> Self {
        debug_assert!(kind.is_outgoing());
        Self {
            kind,
            sender,
            target,
            time,
            internal_ids,
            seq: SequenceNumbers::Known(sequence_ids),
            recalled: Arc::new(AtomicBool::new(false)),
            original: None,
        }
    }

    /// Attach known sequence ids to an offline source
    pub fn with_sequence_ids(mut self, sequence_ids: Vec<SequenceId>) -> Self {
        self.seq = SequenceNumbers::Known(sequence_ids);
        self
    }

    /// Attach correlation ids
    pub fn with_internal_ids(mut self, internal_ids: Vec<InternalId>) -> Self {
        self.internal_ids = internal_ids;
        self
    }

    /// Attach the original message content (used for quote snapshots)
    pub fn with_original(mut self, original: MessageChain) -> Self {
        self.original = Some(Box::new(original));
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn sender(&self) -> UserId {
        self.sender
    }

    pub fn target(&self) -> UserId {
        self.target
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    pub fn internal_ids(&self) -> &[InternalId] {
        &self.internal_ids
    }

    /// Number of wire messages the chain was split into
    pub fn fragment_count(&self) -> usize {
        self.internal_ids.len().max(1)
    }

    /// The original message content, when known
    pub fn original_message(&self) -> Option<&MessageChain> {
        self.original.as_deref()
    }

    /// Resolution state of the sequence numbers
    pub fn sequence_state(&self) -> SequenceState {
        match &self.seq {
            SequenceNumbers::Known(ids) => SequenceState::Resolved(ids.clone()),
            SequenceNumbers::Pending(handle) => handle.state(),
        }
    }

    /// Read the sequence ids without waiting.
    ///
    /// Fails while resolution is still pending; succeeds (possibly with an
    /// empty list) once the source is resolved or degraded.
    pub fn sequence_ids(&self) -> Result<Vec<SequenceId>, ResolveError> {
        match &self.seq {
            SequenceNumbers::Known(ids) => Ok(ids.clone()),
            SequenceNumbers::Pending(handle) => handle.try_ids(),
        }
    }

    /// Wait for resolution or degradation and return the id list
    pub async fn await_sequence_ids(&self) -> Vec<SequenceId> {
        match &self.seq {
            SequenceNumbers::Known(ids) => ids.clone(),
            SequenceNumbers::Pending(handle) => handle.wait().await,
        }
    }

    /// Mark this source recalled (or recall-in-flight). Returns true exactly
    /// once across all clones; a concurrent recall subsystem and resolver
    /// cannot both win.
    pub fn set_recalled(&self) -> bool {
        self.recalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_recalled(&self) -> bool {
        self.recalled.load(Ordering::Acquire)
    }
}

impl PartialEq for MessageSource {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.sender == other.sender
            && self.target == other.target
            && self.time == other.time
            && self.internal_ids == other.internal_ids
            && self.sequence_ids().ok() == other.sequence_ids().ok()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
