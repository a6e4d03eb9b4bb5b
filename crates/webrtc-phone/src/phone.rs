//! Call negotiation state machine.
//!
//! A [`WebRtcPhone`] owns at most one [`CallSession`]. Inbound signaling is
//! read by one listener task; each connection handle gets one event pump and
//! one task that registers peer candidates in arrival order.
//! Async steps never hold the session lock, and every continuation checks its
//! [`AttemptToken`] before touching the session, so work left over from a
//! torn-down call cannot mutate its successor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use transport_bus::BusMessage;

use crate::addressing::{self, CallId, EventNamespace, PeerId};
use crate::config::{Handlers, PeerStreamHandler, PhoneConfig, RtcConfig};
use crate::error::PhoneError;
use crate::media::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, IceCandidate, IceConnectionState,
    MediaConnection, MediaStream, OfferOptions, PeerTrack, SessionDescription,
};
use crate::messages::{self, CallResponse, CandidateBatch, Invite};
use crate::rtc::RtcConnectionFactory;
use crate::session::{
    AttemptCounter, AttemptToken, CallDirection, CallSession, CallSnapshot, NegotiationState,
};
use crate::transport::{Inbound, SignalTransport};

/// Per-call overrides for [`WebRtcPhone::call_user`]. Supplied values also
/// become the phone's defaults for later calls.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub on_peer_stream: Option<PeerStreamHandler>,
    pub my_stream: Option<MediaStream>,
    pub offer_options: Option<OfferOptions>,
    pub rtc_config: Option<RtcConfig>,
}

impl CallOptions {
    pub fn on_peer_stream<F>(mut self, handler: F) -> Self
    where
        F: Fn(PeerTrack) + Send + Sync + 'static,
    {
        self.on_peer_stream = Some(Arc::new(handler));
        self
    }

    pub fn my_stream(mut self, stream: MediaStream) -> Self {
        self.my_stream = Some(stream);
        self
    }

    pub fn offer_options(mut self, options: OfferOptions) -> Self {
        self.offer_options = Some(options);
        self
    }

    pub fn rtc_config(mut self, config: RtcConfig) -> Self {
        self.rtc_config = Some(config);
        self
    }
}

/// The host's decision on an incoming call.
#[derive(Clone)]
pub struct CallAnswer {
    pub accepted_call: bool,
    pub on_peer_stream: Option<PeerStreamHandler>,
    pub my_stream: Option<MediaStream>,
}

impl CallAnswer {
    pub fn accept() -> Self {
        Self {
            accepted_call: true,
            on_peer_stream: None,
            my_stream: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            accepted_call: false,
            on_peer_stream: None,
            my_stream: None,
        }
    }

    pub fn with_stream(mut self, stream: MediaStream) -> Self {
        self.my_stream = Some(stream);
        self
    }

    pub fn on_peer_stream<F>(mut self, handler: F) -> Self
    where
        F: Fn(PeerTrack) + Send + Sync + 'static,
    {
        self.on_peer_stream = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for CallAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallAnswer")
            .field("accepted_call", &self.accepted_call)
            .field("my_stream", &self.my_stream)
            .finish()
    }
}

/// One-shot continuation handed to `on_incoming_call`. Consuming it with
/// [`CallResponder::respond`] answers the invite.
pub struct CallResponder {
    phone: Arc<PhoneInner>,
    invite: Option<Invite>,
}

impl CallResponder {
    pub fn caller(&self) -> Option<&PeerId> {
        self.invite.as_ref().map(|invite| &invite.sender)
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.invite.as_ref().map(|invite| &invite.call_id)
    }

    pub fn respond(mut self, answer: CallAnswer) {
        let Some(invite) = self.invite.take() else {
            return;
        };
        let phone = self.phone.clone();
        self.phone.runtime.spawn(phone.answer(invite, answer));
    }
}

impl Drop for CallResponder {
    fn drop(&mut self) {
        if let Some(invite) = self.invite.take() {
            warn!(
                call_id = %invite.call_id,
                peer = %invite.sender,
                "incoming call dropped without a response"
            );
            self.phone.ringing.lock().remove(&invite.call_id);
        }
    }
}

impl fmt::Debug for CallResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallResponder")
            .field("caller", &self.caller())
            .field("call_id", &self.call_id())
            .finish()
    }
}

/// One-to-one call signaling endpoint.
pub struct WebRtcPhone {
    inner: Arc<PhoneInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct CallDefaults {
    my_stream: Option<MediaStream>,
    rtc_config: RtcConfig,
    on_peer_stream: PeerStreamHandler,
}

struct PhoneInner {
    local_id: PeerId,
    transport: Arc<dyn SignalTransport>,
    connections: Arc<dyn ConnectionFactory>,
    handlers: Handlers,
    defaults: Mutex<CallDefaults>,
    ignore_non_turn: bool,
    session: Mutex<Option<CallSession>>,
    /// Invites waiting on the host's decision, keyed by call.
    ringing: Mutex<HashMap<CallId, PeerId>>,
    attempts: AttemptCounter,
    runtime: Handle,
}

enum PumpRole {
    Caller {
        offer_options: OfferOptions,
        rtc_config: RtcConfig,
        media_ready: Option<oneshot::Receiver<()>>,
    },
    Callee,
}

impl WebRtcPhone {
    /// Validate `config`, subscribe to this phone's addressed channels and
    /// start listening.
    pub async fn new(config: PhoneConfig) -> Result<Self, PhoneError> {
        let runtime = Handle::try_current().map_err(|_| PhoneError::NoRuntime)?;
        let resolved = config.resolve()?;
        let connections = match resolved.connections {
            Some(factory) => factory,
            None => Arc::new(RtcConnectionFactory::new()?),
        };
        let local_id = resolved.transport.local_id();
        let channels = addressing::local_channels(&local_id);
        let inbound = resolved.transport.subscribe(&channels).await?;

        let inner = Arc::new(PhoneInner {
            local_id: local_id.clone(),
            transport: resolved.transport,
            connections,
            handlers: resolved.handlers,
            defaults: Mutex::new(CallDefaults {
                my_stream: resolved.my_stream,
                rtc_config: resolved.rtc_config,
                on_peer_stream: resolved.on_peer_stream,
            }),
            ignore_non_turn: resolved.ignore_non_turn,
            session: Mutex::new(None),
            ringing: Mutex::new(HashMap::new()),
            attempts: AttemptCounter::default(),
            runtime: runtime.clone(),
        });

        let listener = runtime.spawn(inner.clone().listen(inbound));
        info!(peer = %local_id, ?channels, "phone listening for calls");
        Ok(Self {
            inner,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    /// Start an outbound call. Progress is reported through the configured
    /// callbacks; any previous call is torn down first.
    pub async fn call_user(&self, peer: impl Into<PeerId>, options: CallOptions) {
        self.inner.clone().call_user(peer.into(), options).await;
    }

    /// Tear down the current call, if any, and always report
    /// `on_disconnect`.
    pub async fn disconnect(&self) {
        self.inner.teardown(None).await;
    }

    pub fn state(&self) -> NegotiationState {
        if let Some(session) = self.inner.session.lock().as_ref() {
            return session.state();
        }
        if self.inner.ringing.lock().is_empty() {
            NegotiationState::Idle
        } else {
            NegotiationState::InboundRinging
        }
    }

    pub fn active_call(&self) -> Option<CallSnapshot> {
        self.inner.session.lock().as_ref().map(CallSession::snapshot)
    }

    /// Stop reacting to inbound signaling.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

impl Drop for WebRtcPhone {
    /// Stops listening and closes the live connection, if any. The host is
    /// not notified.
    fn drop(&mut self) {
        self.shutdown();
        let Some(session) = self.inner.session.lock().take() else {
            return;
        };
        if let Some(connection) = session.connection {
            debug!(call_id = %session.call_id, "closing connection of dropped phone");
            self.inner.runtime.spawn(async move {
                close_connection(connection.as_ref()).await;
            });
        }
    }
}

impl fmt::Debug for WebRtcPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcPhone")
            .field("local_id", &self.inner.local_id)
            .field("session", &*self.inner.session.lock())
            .finish()
    }
}

impl PhoneInner {
    async fn listen(self: Arc<Self>, mut inbound: Inbound) {
        while let Some(message) = inbound.recv().await {
            self.dispatch(message);
        }
        debug!(peer = %self.local_id, "signaling stream closed");
    }

    fn dispatch(self: &Arc<Self>, message: BusMessage) {
        let Some(namespace) = addressing::route(&message.channel, &self.local_id) else {
            trace!(channel = %message.channel, "ignoring message on foreign channel");
            return;
        };
        let decoded = match namespace {
            EventNamespace::IncomingCall => {
                messages::decode(&message.payload).map(|invite| self.incoming_call(invite))
            }
            EventNamespace::CallResponse => {
                messages::decode(&message.payload).map(|response| self.call_response(response))
            }
            EventNamespace::PeerIceCandidate => {
                messages::decode(&message.payload).map(|batch| self.peer_ice_candidate(batch))
            }
        };
        if let Err(err) = decoded {
            warn!(
                channel = %message.channel,
                error = %err,
                "dropping malformed signaling message"
            );
        }
    }

    fn with_session<R>(
        &self,
        attempt: AttemptToken,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> Option<R> {
        self.session
            .lock()
            .as_mut()
            .filter(|session| session.is_attempt(attempt))
            .map(f)
    }

    async fn publish<T: Serialize>(
        &self,
        namespace: EventNamespace,
        peer: &PeerId,
        message: &T,
    ) -> Result<(), PhoneError> {
        let channel = namespace.channel_for(peer);
        let payload = messages::encode(message)?;
        self.transport.publish(&channel, payload).await?;
        Ok(())
    }

    async fn call_user(self: Arc<Self>, peer: PeerId, options: CallOptions) {
        let (my_stream, rtc_config, on_peer_stream) = {
            let mut defaults = self.defaults.lock();
            if let Some(stream) = options.my_stream {
                defaults.my_stream = Some(stream);
            }
            if let Some(config) = options.rtc_config {
                defaults.rtc_config = config;
            }
            if let Some(handler) = options.on_peer_stream {
                defaults.on_peer_stream = handler;
            }
            (
                defaults.my_stream.clone(),
                defaults.rtc_config.clone(),
                defaults.on_peer_stream.clone(),
            )
        };

        let call_id = CallId::generate();
        let attempt = self.attempts.next();
        let previous = self.session.lock().replace(CallSession::outbound(
            peer.clone(),
            call_id.clone(),
            attempt,
            on_peer_stream,
        ));
        self.retire(previous).await;
        info!(peer = %peer, call_id = %call_id, %attempt, "placing call");

        let (ready_tx, ready_rx) = oneshot::channel();
        let role = PumpRole::Caller {
            offer_options: options.offer_options.unwrap_or_default(),
            rtc_config: rtc_config.clone(),
            media_ready: Some(ready_rx),
        };
        let Some((connection, events)) = self
            .open_connection(attempt, &rtc_config, role, "call_user")
            .await
        else {
            return;
        };

        match my_stream {
            Some(stream) => {
                if let Err(err) = connection.add_stream(&stream).await {
                    error!(
                        operation = "call_user",
                        call_id = %call_id,
                        error = %err,
                        "failed to attach local media"
                    );
                }
            }
            None => {
                warn!(
                    operation = "call_user",
                    call_id = %call_id,
                    "no local media stream; offering receive-only"
                );
                let _ = events.send(ConnectionEvent::NegotiationNeeded);
            }
        }
        let _ = ready_tx.send(());
    }

    fn incoming_call(self: &Arc<Self>, invite: Invite) {
        let in_progress = self
            .session
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_call(&invite.call_id));
        if in_progress || self.ringing.lock().contains_key(&invite.call_id) {
            debug!(call_id = %invite.call_id, "ignoring duplicate invite");
            return;
        }

        info!(peer = %invite.sender, call_id = %invite.call_id, "incoming call");
        self.ringing
            .lock()
            .insert(invite.call_id.clone(), invite.sender.clone());
        let sender = invite.sender.clone();
        let responder = CallResponder {
            phone: self.clone(),
            invite: Some(invite),
        };
        (self.handlers.on_incoming_call)(sender, responder);
    }

    async fn answer(self: Arc<Self>, invite: Invite, answer: CallAnswer) {
        self.ringing.lock().remove(&invite.call_id);
        let Invite {
            call_id,
            sender,
            rtc_config,
            remote_description,
        } = invite;

        if !answer.accepted_call {
            info!(peer = %sender, call_id = %call_id, "rejecting call");
            let response = CallResponse::rejected(call_id.clone());
            if let Err(err) = self
                .publish(EventNamespace::CallResponse, &sender, &response)
                .await
            {
                error!(
                    operation = "incoming_call",
                    call_id = %call_id,
                    error = %err,
                    "failed to send rejection"
                );
            }
            return;
        }

        let (my_stream, on_peer_stream) = {
            let mut defaults = self.defaults.lock();
            if let Some(stream) = answer.my_stream {
                defaults.my_stream = Some(stream);
            }
            (
                defaults.my_stream.clone(),
                answer
                    .on_peer_stream
                    .unwrap_or_else(|| defaults.on_peer_stream.clone()),
            )
        };
        if my_stream.is_none() {
            error!(
                operation = "incoming_call",
                call_id = %call_id,
                "no local media stream defined"
            );
        }

        let attempt = self.attempts.next();
        let previous = self.session.lock().replace(CallSession::inbound(
            sender.clone(),
            call_id.clone(),
            attempt,
            on_peer_stream,
        ));
        self.retire(previous).await;
        info!(peer = %sender, call_id = %call_id, %attempt, "accepting call");

        let Some((connection, _events)) = self
            .open_connection(attempt, &rtc_config, PumpRole::Callee, "incoming_call")
            .await
        else {
            return;
        };

        let result: Result<(), PhoneError> = async {
            if let Some(stream) = &my_stream {
                connection.add_stream(stream).await?;
            }
            connection.set_remote_description(remote_description).await?;
            self.remote_description_applied(attempt);
            let local = connection.create_answer().await?;
            connection.set_local_description(local.clone()).await?;

            if self.with_session(attempt, CallSession::mark_accepted).is_none() {
                debug!(call_id = %call_id, "call ended before the answer was committed");
                return Ok(());
            }
            let response = CallResponse::accepted(call_id.clone(), self.local_id.clone(), local);
            self.publish(EventNamespace::CallResponse, &sender, &response)
                .await?;
            self.flush_local_candidates(attempt, "incoming_call").await;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            error!(
                operation = "incoming_call",
                call_id = %call_id,
                error = %err,
                "answer negotiation failed"
            );
        }
    }

    fn call_response(self: &Arc<Self>, response: CallResponse) {
        let pending = {
            let mut guard = self.session.lock();
            let Some(session) = guard
                .as_mut()
                .filter(|session| session.is_call(&response.call_id))
            else {
                debug!(call_id = %response.call_id, "ignoring response for inactive call");
                return;
            };
            if session.direction != CallDirection::Outbound || session.answered {
                debug!(call_id = %response.call_id, "ignoring unexpected response");
                return;
            }
            session.answered = true;
            if response.accepted_call {
                session.mark_accepted();
                Some((session.attempt(), session.connection()))
            } else {
                None
            }
        };

        info!(
            call_id = %response.call_id,
            accepted = response.accepted_call,
            "call response received"
        );
        (self.handlers.on_call_response)(response.accepted_call);

        if let Some((attempt, connection)) = pending {
            let phone = self.clone();
            self.runtime.spawn(async move {
                phone
                    .apply_answer(attempt, connection, response.remote_description)
                    .await;
            });
        }
    }

    async fn apply_answer(
        self: Arc<Self>,
        attempt: AttemptToken,
        connection: Option<Arc<dyn MediaConnection>>,
        answer: Option<SessionDescription>,
    ) {
        let (Some(connection), Some(answer)) = (connection, answer) else {
            error!(
                operation = "call_response",
                %attempt,
                "accepted response without a connection or description"
            );
            return;
        };
        if let Err(err) = connection.set_remote_description(answer).await {
            error!(
                operation = "call_response",
                %attempt,
                error = %err,
                "failed to apply remote answer"
            );
            return;
        }
        self.remote_description_applied(attempt);
        self.flush_local_candidates(attempt, "call_response").await;
    }

    fn peer_ice_candidate(self: &Arc<Self>, batch: CandidateBatch) {
        let CandidateBatch {
            call_id,
            candidates,
        } = batch;
        let candidates: Vec<IceCandidate> = if self.ignore_non_turn {
            candidates
                .into_iter()
                .filter(|candidate| {
                    let relay = candidate.is_relay();
                    if !relay {
                        trace!(candidate = %candidate.candidate, "skipping non-relay candidate");
                    }
                    relay
                })
                .collect()
        } else {
            candidates
        };

        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut().filter(|session| session.is_call(&call_id)) else {
            debug!(call_id = %call_id, "ignoring candidates for inactive call");
            return;
        };
        if session.connection.is_none() {
            debug!(call_id = %call_id, "ignoring candidates; no connection yet");
            return;
        }
        let count = candidates.len();
        if !session.admit_remote(candidates) {
            debug!(
                call_id = %call_id,
                count,
                "holding candidates until the remote description is set"
            );
        }
    }

    /// Open the remote-candidate gate for `attempt`; anything held behind it
    /// is queued for registration first.
    fn remote_description_applied(&self, attempt: AttemptToken) {
        if let Some(released) = self.with_session(attempt, CallSession::open_remote_gate) {
            if released > 0 {
                debug!(%attempt, released, "registering held peer candidates");
            }
        }
    }

    async fn local_candidate(&self, attempt: AttemptToken, candidate: IceCandidate) {
        let accepted = self
            .with_session(attempt, |session| {
                session.outbound.push(candidate);
                session.is_accepted()
            })
            .unwrap_or(false);
        if accepted {
            self.flush_local_candidates(attempt, "local_candidate").await;
        }
    }

    /// Send everything in the outbound cache as one batch.
    async fn flush_local_candidates(&self, attempt: AttemptToken, operation: &'static str) {
        let Some((peer, call_id, candidates)) = self.with_session(attempt, |session| {
            (
                session.peer_id.clone(),
                session.call_id.clone(),
                session.outbound.drain(),
            )
        }) else {
            return;
        };
        if candidates.is_empty() {
            return;
        }
        debug!(call_id = %call_id, count = candidates.len(), "flushing local candidates");
        let batch = CandidateBatch {
            call_id: call_id.clone(),
            candidates,
        };
        if let Err(err) = self
            .publish(EventNamespace::PeerIceCandidate, &peer, &batch)
            .await
        {
            error!(
                operation,
                call_id = %call_id,
                error = %err,
                "failed to send candidates"
            );
        }
    }

    async fn open_connection(
        self: &Arc<Self>,
        attempt: AttemptToken,
        rtc_config: &RtcConfig,
        role: PumpRole,
        operation: &'static str,
    ) -> Option<(Arc<dyn MediaConnection>, ConnectionEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = match self.connections.connect(rtc_config, events_tx.clone()).await {
            Ok(connection) => connection,
            Err(err) => {
                error!(operation, %attempt, error = %err, "failed to create connection");
                return None;
            }
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        if self
            .with_session(attempt, |session| session.attach(connection.clone(), queue_tx))
            .is_none()
        {
            debug!(%attempt, "call ended while its connection was being created");
            close_connection(connection.as_ref()).await;
            return None;
        }

        self.runtime.spawn(register_candidates(connection.clone(), queue_rx));
        self.runtime.spawn(Self::pump_events(
            Arc::downgrade(self),
            attempt,
            connection.clone(),
            events_rx,
            role,
        ));
        Some((connection, events_tx))
    }

    /// Holds the phone weakly; the connection it listens to is owned by the
    /// phone's session.
    async fn pump_events(
        phone: Weak<Self>,
        attempt: AttemptToken,
        connection: Arc<dyn MediaConnection>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut role: PumpRole,
    ) {
        while let Some(event) = events.recv().await {
            let Some(this) = phone.upgrade() else {
                break;
            };
            if this.with_session(attempt, |_| ()).is_none() {
                break;
            }
            match event {
                ConnectionEvent::LocalCandidate(candidate) => {
                    this.local_candidate(attempt, candidate).await;
                }
                ConnectionEvent::ConnectivityChanged(state) => {
                    debug!(%attempt, ?state, "connectivity changed");
                    if state == IceConnectionState::Disconnected {
                        this.teardown(Some(attempt)).await;
                        break;
                    }
                }
                ConnectionEvent::NegotiationNeeded => match &mut role {
                    PumpRole::Caller {
                        offer_options,
                        rtc_config,
                        media_ready,
                    } => {
                        if let Some(ready) = media_ready.take() {
                            let _ = ready.await;
                        }
                        this.send_offer(attempt, connection.as_ref(), offer_options, rtc_config)
                            .await;
                    }
                    PumpRole::Callee => {
                        trace!(%attempt, "negotiation requested on answering side");
                    }
                },
                ConnectionEvent::RemoteTrack(track) => {
                    let handler = this.with_session(attempt, |session| session.on_peer_stream.clone());
                    if let Some(handler) = handler {
                        debug!(%attempt, track = %track.track_id, kind = %track.kind, "peer track");
                        handler(track);
                    }
                }
            }
        }
        trace!(%attempt, "connection event pump finished");
    }

    async fn send_offer(
        &self,
        attempt: AttemptToken,
        connection: &dyn MediaConnection,
        offer_options: &OfferOptions,
        rtc_config: &RtcConfig,
    ) {
        let offering = self
            .with_session(attempt, |session| {
                session.state() == NegotiationState::OutboundOffering
            })
            .unwrap_or(false);
        if !offering {
            debug!(%attempt, "offer already sent; ignoring renegotiation request");
            return;
        }

        let result: Result<(), PhoneError> = async {
            let offer = connection.create_offer(offer_options).await?;
            connection.set_local_description(offer.clone()).await?;
            let Some((peer, call_id)) = self.with_session(attempt, |session| {
                (session.peer_id.clone(), session.call_id.clone())
            }) else {
                return Ok(());
            };
            let invite = Invite {
                call_id,
                sender: self.local_id.clone(),
                rtc_config: rtc_config.clone(),
                remote_description: offer,
            };
            self.publish(EventNamespace::IncomingCall, &peer, &invite)
                .await?;
            self.with_session(attempt, |session| {
                if session.state == NegotiationState::OutboundOffering {
                    session.state = NegotiationState::OutboundAwaitingResponse;
                }
            });
            debug!(peer = %peer, %attempt, "invite sent");
            Ok(())
        }
        .await;

        if let Err(err) = result {
            error!(
                operation = "call_user",
                %attempt,
                error = %err,
                "offer negotiation failed"
            );
        }
    }

    /// Close a session that is being replaced by a new one. The host is not
    /// notified; it started the replacement.
    async fn retire(&self, previous: Option<CallSession>) {
        let Some(previous) = previous else {
            return;
        };
        info!(
            peer = %previous.peer_id,
            call_id = %previous.call_id,
            "replacing active call"
        );
        if let Some(connection) = previous.connection {
            close_connection(connection.as_ref()).await;
        }
    }

    /// Shared teardown for explicit disconnects and lost connectivity. With
    /// `only` set, a session belonging to another attempt is left alone.
    ///
    /// An explicit disconnect also forgets ringing invites. A responder the
    /// host still holds can answer its invite afterwards.
    async fn teardown(&self, only: Option<AttemptToken>) {
        let session = {
            let mut guard = self.session.lock();
            match only {
                Some(attempt) if !guard.as_ref().is_some_and(|s| s.is_attempt(attempt)) => {
                    return;
                }
                _ => guard.take(),
            }
        };
        if only.is_none() {
            let forgotten = std::mem::take(&mut *self.ringing.lock());
            if !forgotten.is_empty() {
                debug!(count = forgotten.len(), "forgetting ringing invites");
            }
        }

        if let Some(session) = session {
            info!(
                peer = %session.peer_id,
                call_id = %session.call_id,
                "call disconnected"
            );
            if let Some(connection) = session.connection {
                close_connection(connection.as_ref()).await;
            }
        }
        (self.handlers.on_disconnect)();
    }
}

/// Registers peer candidates one at a time, in the order they were queued.
/// Ends once the owning session is gone.
async fn register_candidates(
    connection: Arc<dyn MediaConnection>,
    mut queue: mpsc::UnboundedReceiver<IceCandidate>,
) {
    while let Some(candidate) = queue.recv().await {
        register_candidate(connection.as_ref(), candidate).await;
    }
}

async fn register_candidate(connection: &dyn MediaConnection, candidate: IceCandidate) {
    match connection.add_ice_candidate(candidate).await {
        Ok(()) => {}
        Err(err) if err.is_benign() => trace!(error = %err, "candidate rejected"),
        Err(err) => error!(
            operation = "peer_ice_candidate",
            error = %err,
            "failed to register candidate"
        ),
    }
}

async fn close_connection(connection: &dyn MediaConnection) {
    if let Err(err) = connection.close().await {
        warn!(error = %err, "failed to close connection");
    }
}
