use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::addressing::{CallId, PeerId};
use crate::candidate_cache::CandidateCache;
use crate::config::PeerStreamHandler;
use crate::media::{IceCandidate, MediaConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    OutboundOffering,
    OutboundAwaitingResponse,
    InboundRinging,
    InboundAnswering,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Identity of one negotiation attempt. Async steps carry the token they
/// started under and drop their result once it no longer matches the live
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptToken(u64);

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct AttemptCounter(AtomicU64);

impl AttemptCounter {
    pub fn next(&self) -> AttemptToken {
        AttemptToken(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Read-only view of the call in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub peer_id: PeerId,
    pub call_id: CallId,
    pub direction: CallDirection,
    pub state: NegotiationState,
    pub accepted: bool,
    pub in_session: bool,
    pub has_connection: bool,
}

/// The call currently in progress together with its connection handle.
pub struct CallSession {
    pub(crate) peer_id: PeerId,
    pub(crate) call_id: CallId,
    pub(crate) attempt: AttemptToken,
    pub(crate) direction: CallDirection,
    pub(crate) state: NegotiationState,
    pub(crate) connection: Option<Arc<dyn MediaConnection>>,
    /// Feeds the connection's single registration task.
    pub(crate) registrations: Option<mpsc::UnboundedSender<IceCandidate>>,
    pub(crate) accepted: bool,
    pub(crate) in_session: bool,
    /// Set once the peer's response has been handled.
    pub(crate) answered: bool,
    pub(crate) remote_description_applied: bool,
    /// Local candidates waiting for the call to be accepted.
    pub(crate) outbound: CandidateCache,
    /// Peer candidates that arrived before the remote description.
    pub(crate) inbound: CandidateCache,
    pub(crate) on_peer_stream: PeerStreamHandler,
}

impl CallSession {
    pub(crate) fn outbound(
        peer_id: PeerId,
        call_id: CallId,
        attempt: AttemptToken,
        on_peer_stream: PeerStreamHandler,
    ) -> Self {
        Self::new(
            peer_id,
            call_id,
            attempt,
            CallDirection::Outbound,
            NegotiationState::OutboundOffering,
            on_peer_stream,
        )
    }

    pub(crate) fn inbound(
        peer_id: PeerId,
        call_id: CallId,
        attempt: AttemptToken,
        on_peer_stream: PeerStreamHandler,
    ) -> Self {
        Self::new(
            peer_id,
            call_id,
            attempt,
            CallDirection::Inbound,
            NegotiationState::InboundAnswering,
            on_peer_stream,
        )
    }

    fn new(
        peer_id: PeerId,
        call_id: CallId,
        attempt: AttemptToken,
        direction: CallDirection,
        state: NegotiationState,
        on_peer_stream: PeerStreamHandler,
    ) -> Self {
        Self {
            peer_id,
            call_id,
            attempt,
            direction,
            state,
            connection: None,
            registrations: None,
            accepted: false,
            in_session: false,
            answered: false,
            remote_description_applied: false,
            outbound: CandidateCache::new(),
            inbound: CandidateCache::new(),
            on_peer_stream,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn attempt(&self) -> AttemptToken {
        self.attempt
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn in_session(&self) -> bool {
        self.in_session
    }

    pub fn connection(&self) -> Option<Arc<dyn MediaConnection>> {
        self.connection.clone()
    }

    pub(crate) fn is_attempt(&self, attempt: AttemptToken) -> bool {
        self.attempt == attempt
    }

    pub(crate) fn is_call(&self, call_id: &CallId) -> bool {
        &self.call_id == call_id
    }

    /// Install the handle for this attempt. A session holds one handle for
    /// its whole life.
    pub(crate) fn attach(
        &mut self,
        connection: Arc<dyn MediaConnection>,
        registrations: mpsc::UnboundedSender<IceCandidate>,
    ) {
        debug_assert!(self.connection.is_none(), "session already owns a connection");
        self.connection = Some(connection);
        self.registrations = Some(registrations);
    }

    /// Queue peer candidates for registration, or hold them while the remote
    /// description is still missing. Returns false when they were held.
    pub(crate) fn admit_remote(&mut self, candidates: Vec<IceCandidate>) -> bool {
        match &self.registrations {
            Some(queue) if self.remote_description_applied => {
                for candidate in candidates {
                    let _ = queue.send(candidate);
                }
                true
            }
            _ => {
                for candidate in candidates {
                    self.inbound.push(candidate);
                }
                false
            }
        }
    }

    /// Open the remote-candidate gate. Held candidates are queued ahead of
    /// anything admitted afterwards; returns how many were released.
    pub(crate) fn open_remote_gate(&mut self) -> usize {
        self.remote_description_applied = true;
        let held = self.inbound.drain();
        let released = held.len();
        self.admit_remote(held);
        released
    }

    /// Both sides have agreed; candidate flushing is open from here on.
    pub(crate) fn mark_accepted(&mut self) {
        self.accepted = true;
        self.in_session = true;
        self.state = NegotiationState::Established;
    }

    pub(crate) fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            peer_id: self.peer_id.clone(),
            call_id: self.call_id.clone(),
            direction: self.direction,
            state: self.state,
            accepted: self.accepted,
            in_session: self.in_session,
            has_connection: self.connection.is_some(),
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("peer_id", &self.peer_id)
            .field("call_id", &self.call_id)
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .field("accepted", &self.accepted)
            .field("in_session", &self.in_session)
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .finish()
    }
}
