#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use transport_bus::{Bus, LocalBus, Subscription};

use webrtc_phone::messages;
use webrtc_phone::{
    BusTransport, CallAnswer, CallResponder, ConnectionEvent, ConnectionEvents,
    ConnectionFactory, EventNamespace, IceCandidate, IceConnectionState, MediaConnection,
    MediaError, MediaStream, OfferOptions, PeerId, PeerTrack, PhoneConfig, RtcConfig,
    SessionDescription, WebRtcPhone,
};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or the wait budget runs out.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let result = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Give spawned tasks a chance to run, for asserting that something did
/// not happen.
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

pub fn host_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
}

pub fn relay_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 41885439 203.0.113.{n} 3478 typ relay raddr 0.0.0.0 rport 0"
    ))
    .with_sdp_mid("0")
    .with_sdp_m_line_index(0)
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub streams: Vec<String>,
    pub offers: usize,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub closes: usize,
}

/// Scriptable stand-in for a peer connection. Tests drive its events by hand.
pub struct FakeConnection {
    pub index: usize,
    pub config: RtcConfig,
    events: ConnectionEvents,
    state: Mutex<FakeState>,
    /// Delay applied before `set_remote_description` completes.
    remote_delay: Mutex<Option<Duration>>,
    /// Delay applied before each `add_ice_candidate` completes.
    candidate_delay: Mutex<Option<Duration>>,
}

impl FakeConnection {
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn discover(&self, candidate: IceCandidate) {
        self.emit(ConnectionEvent::LocalCandidate(candidate));
    }

    pub fn connectivity(&self, state: IceConnectionState) {
        self.emit(ConnectionEvent::ConnectivityChanged(state));
    }

    pub fn remote_track(&self, track: PeerTrack) {
        self.emit(ConnectionEvent::RemoteTrack(track));
    }

    pub fn delay_remote_description(&self, delay: Duration) {
        *self.remote_delay.lock() = Some(delay);
    }

    pub fn delay_candidates(&self, delay: Duration) {
        *self.candidate_delay.lock() = Some(delay);
    }

    /// Whether the phone still consumes this connection's events.
    pub fn listening(&self) -> bool {
        !self.events.is_closed()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&FakeState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn registered(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), MediaError> {
        self.state.lock().streams.push(stream.id().to_string());
        self.emit(ConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_offer(&self, _options: &OfferOptions) -> Result<SessionDescription, MediaError> {
        let mut state = self.state.lock();
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.index, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer(format!("answer-{}", self.index)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.state.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let delay = *self.remote_delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.state.lock().remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let delay = *self.candidate_delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(MediaError::Description("no remote description".into()));
        }
        if candidate.candidate_type().is_none() {
            return Err(MediaError::InvalidCandidate(candidate.candidate));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    fail: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn get(&self, index: usize) -> Option<Arc<FakeConnection>> {
        self.connections.lock().get(index).cloned()
    }

    pub async fn connection(&self, index: usize) -> Arc<FakeConnection> {
        eventually("connection to be created", || self.count() > index).await;
        self.get(index).expect("connection exists")
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(
        &self,
        config: &RtcConfig,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, MediaError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        let mut connections = self.connections.lock();
        let connection = Arc::new(FakeConnection {
            index: connections.len(),
            config: config.clone(),
            events,
            state: Mutex::new(FakeState::default()),
            remote_delay: Mutex::new(None),
            candidate_delay: Mutex::new(None),
        });
        connections.push(connection.clone());
        Ok(connection)
    }
}

/// What a test phone does when a call comes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRing {
    Accept,
    Reject,
    Hold,
}

/// Everything the phone reported to its host.
#[derive(Default)]
pub struct Recorder {
    pub incoming: Mutex<Vec<PeerId>>,
    pub held: Mutex<Vec<CallResponder>>,
    pub responses: Mutex<Vec<bool>>,
    pub tracks: Mutex<Vec<PeerTrack>>,
    pub disconnects: AtomicUsize,
}

impl Recorder {
    pub fn incoming(&self) -> Vec<PeerId> {
        self.incoming.lock().clone()
    }

    pub fn responses(&self) -> Vec<bool> {
        self.responses.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn take_held(&self) -> CallResponder {
        self.held.lock().pop().expect("a held call")
    }
}

pub struct TestPhone {
    pub phone: WebRtcPhone,
    pub factory: Arc<FakeFactory>,
    pub recorder: Arc<Recorder>,
}

impl TestPhone {
    pub fn id(&self) -> &PeerId {
        self.phone.local_id()
    }
}

pub fn stream(id: &str) -> MediaStream {
    MediaStream::new(id)
}

pub fn config(bus: &Arc<LocalBus>, id: &str, on_ring: OnRing) -> (PhoneConfig, Arc<FakeFactory>, Arc<Recorder>) {
    let factory = FakeFactory::new();
    let recorder = Arc::new(Recorder::default());
    let transport = Arc::new(BusTransport::new(id, bus.clone() as Arc<dyn Bus>));

    let incoming = recorder.clone();
    let responses = recorder.clone();
    let tracks = recorder.clone();
    let disconnects = recorder.clone();
    let config = PhoneConfig::new(transport)
        .connections(factory.clone())
        .my_stream(stream(&format!("{id}-stream")))
        .rtc_config(RtcConfig::localhost())
        .on_incoming_call(move |peer, responder| {
            incoming.incoming.lock().push(peer);
            match on_ring {
                OnRing::Accept => responder.respond(CallAnswer::accept()),
                OnRing::Reject => responder.respond(CallAnswer::reject()),
                OnRing::Hold => incoming.held.lock().push(responder),
            }
        })
        .on_call_response(move |accepted| responses.responses.lock().push(accepted))
        .on_peer_stream(move |track| tracks.tracks.lock().push(track))
        .on_disconnect(move || {
            disconnects.disconnects.fetch_add(1, Ordering::SeqCst);
        });
    (config, factory, recorder)
}

pub async fn phone(bus: &Arc<LocalBus>, id: &str, on_ring: OnRing) -> TestPhone {
    let (config, factory, recorder) = config(bus, id, on_ring);
    let phone = WebRtcPhone::new(config).await.expect("phone builds");
    TestPhone {
        phone,
        factory,
        recorder,
    }
}

/// Subscribe to one signaling channel addressed to `peer`.
pub fn tap(bus: &LocalBus, namespace: EventNamespace, peer: &str) -> Subscription {
    bus.subscribe(&[namespace.channel_for(&PeerId::from(peer))])
        .expect("subscribe")
}

pub async fn next<T: DeserializeOwned>(subscription: &mut Subscription) -> T {
    let message = timeout(WAIT, subscription.recv())
        .await
        .expect("message within the wait budget")
        .expect("subscription open");
    messages::decode(&message.payload).expect("well-formed message")
}

/// Assert nothing is queued on `subscription` right now.
pub fn assert_quiet(subscription: &mut Subscription) {
    if let Some(message) = subscription.try_recv() {
        panic!("unexpected message on {}: {:?}", message.channel, message.payload);
    }
}

pub fn send<T: Serialize>(bus: &LocalBus, namespace: EventNamespace, peer: &str, message: &T) {
    let payload = messages::encode(message).expect("encodes");
    bus.publish(&namespace.channel_for(&PeerId::from(peer)), payload)
        .expect("publish");
}

pub fn send_raw(bus: &LocalBus, namespace: EventNamespace, peer: &str, payload: &'static [u8]) {
    bus.publish(
        &namespace.channel_for(&PeerId::from(peer)),
        Bytes::from_static(payload),
    )
    .expect("publish");
}
