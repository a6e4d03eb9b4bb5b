mod support;

use std::sync::Arc;
use std::time::Duration;

use transport_bus::{LocalBus, Subscription};
use webrtc_phone::messages::{CallResponse, CandidateBatch, Invite};
use webrtc_phone::{
    BusTransport, CallId, CallOptions, ConfigError, EventNamespace, IceCandidate,
    IceConnectionState, NegotiationState, PeerId, PeerTrack, PhoneConfig, PhoneError, RtcConfig,
    SessionDescription, WebRtcPhone,
};

use support::{
    OnRing, TestPhone, assert_quiet, eventually, host_candidate, init_tracing, next, phone,
    relay_candidate, send, send_raw, settle, tap,
};

fn invite(call_id: &str, sender: &str) -> Invite {
    Invite {
        call_id: CallId::from(call_id),
        sender: PeerId::from(sender),
        rtc_config: RtcConfig::localhost(),
        remote_description: SessionDescription::offer(format!("offer-from-{sender}")),
    }
}

struct Outbound {
    caller: TestPhone,
    invite: Invite,
    candidates: Subscription,
}

/// `alice` calls a bare `bob` endpoint that the test drives by hand.
async fn call_bare_bob(bus: &Arc<LocalBus>, caller: TestPhone) -> Outbound {
    let mut invites = tap(bus, EventNamespace::IncomingCall, "bob");
    let candidates = tap(bus, EventNamespace::PeerIceCandidate, "bob");
    caller.phone.call_user("bob", CallOptions::default()).await;
    let invite: Invite = next(&mut invites).await;
    Outbound {
        caller,
        invite,
        candidates,
    }
}

fn accept(bus: &LocalBus, invite: &Invite) {
    send(
        bus,
        EventNamespace::CallResponse,
        "alice",
        &CallResponse::accepted(
            invite.call_id.clone(),
            PeerId::from("bob"),
            SessionDescription::answer("answer-from-bob"),
        ),
    );
}

async fn established(bus: &Arc<LocalBus>) -> (TestPhone, TestPhone) {
    let alice = phone(bus, "alice", OnRing::Hold).await;
    let bob = phone(bus, "bob", OnRing::Accept).await;
    alice.phone.call_user("bob", CallOptions::default()).await;
    eventually("alice to hear back", || !alice.recorder.responses().is_empty()).await;
    eventually("alice to apply the answer", || {
        alice
            .factory
            .get(0)
            .is_some_and(|connection| connection.remote().is_some())
    })
    .await;
    (alice, bob)
}

#[tokio::test]
async fn caller_and_callee_complete_a_call() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let mut responses = tap(&bus, EventNamespace::CallResponse, "alice");
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let bob = phone(&bus, "bob", OnRing::Accept).await;

    alice.phone.call_user("bob", CallOptions::default()).await;
    let call_id = alice.phone.active_call().expect("active call").call_id;

    let response: CallResponse = next(&mut responses).await;
    assert_eq!(response.call_id, call_id);
    assert!(response.accepted_call);
    assert_eq!(response.sender, Some(PeerId::from("bob")));
    assert_eq!(response.remote_description, Some(SessionDescription::answer("answer-0")));
    assert_eq!(bob.recorder.incoming(), vec![PeerId::from("alice")]);

    eventually("alice to accept the answer", || alice.recorder.responses() == vec![true]).await;
    let caller_side = alice.factory.connection(0).await;
    eventually("answer applied", || caller_side.remote().is_some()).await;
    assert_eq!(caller_side.remote(), Some(SessionDescription::answer("answer-0")));

    let callee_side = bob.factory.connection(0).await;
    assert_eq!(callee_side.remote(), Some(SessionDescription::offer("offer-0-1")));
    assert_eq!(callee_side.local(), Some(SessionDescription::answer("answer-0")));
    assert_eq!(callee_side.config, RtcConfig::localhost());
    assert_eq!(
        callee_side.with_state(|state| state.streams.clone()),
        vec!["bob-stream".to_string()]
    );

    assert_eq!(alice.phone.state(), NegotiationState::Established);
    assert_eq!(bob.phone.state(), NegotiationState::Established);
    let snapshot = bob.phone.active_call().expect("bob in call");
    assert_eq!(snapshot.call_id, call_id);
    assert!(snapshot.accepted && snapshot.in_session && snapshot.has_connection);

    settle().await;
    assert_eq!(alice.recorder.responses(), vec![true]);
    assert_quiet(&mut responses);
}

#[tokio::test]
async fn answering_an_invite_sends_one_response() {
    let bus = Arc::new(LocalBus::new());
    let mut responses = tap(&bus, EventNamespace::CallResponse, "carol");
    let bob = phone(&bus, "bob", OnRing::Accept).await;

    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c1", "carol"));

    let response: CallResponse = next(&mut responses).await;
    assert_eq!(response.call_id, CallId::from("c1"));
    assert!(response.accepted_call);
    assert_eq!(bob.factory.count(), 1);
    settle().await;
    assert_quiet(&mut responses);
}

#[tokio::test]
async fn candidates_wait_for_acceptance_then_flush_in_order() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound {
        caller,
        invite,
        mut candidates,
    } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;

    for n in 1..=3 {
        connection.discover(host_candidate(n));
    }
    settle().await;
    assert_quiet(&mut candidates);

    accept(&bus, &invite);
    let batch: CandidateBatch = next(&mut candidates).await;
    assert_eq!(batch.call_id, invite.call_id);
    assert_eq!(
        batch.candidates,
        vec![host_candidate(1), host_candidate(2), host_candidate(3)]
    );
    settle().await;
    assert_quiet(&mut candidates);
}

#[tokio::test]
async fn candidates_after_acceptance_flush_one_by_one() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound {
        caller,
        invite,
        mut candidates,
    } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;

    accept(&bus, &invite);
    eventually("acceptance", || caller.recorder.responses() == vec![true]).await;

    connection.discover(host_candidate(4));
    let first: CandidateBatch = next(&mut candidates).await;
    assert_eq!(first.candidates, vec![host_candidate(4)]);

    connection.discover(relay_candidate(5));
    let second: CandidateBatch = next(&mut candidates).await;
    assert_eq!(second.candidates, vec![relay_candidate(5)]);
    assert_quiet(&mut candidates);
}

#[tokio::test]
async fn disconnect_twice_closes_once_and_notifies_twice() {
    let bus = Arc::new(LocalBus::new());
    let (alice, _bob) = established(&bus).await;
    let connection = alice.factory.connection(0).await;

    alice.phone.disconnect().await;
    alice.phone.disconnect().await;

    assert_eq!(connection.closes(), 1);
    assert_eq!(alice.recorder.disconnects(), 2);
    assert!(alice.phone.active_call().is_none());
    assert_eq!(alice.phone.state(), NegotiationState::Idle);
}

#[tokio::test]
async fn dropping_the_phone_closes_its_connection() {
    let bus = Arc::new(LocalBus::new());
    let (alice, _bob) = established(&bus).await;
    let connection = alice.factory.connection(0).await;
    let recorder = alice.recorder.clone();

    drop(alice);
    eventually("connection closed", || connection.closes() == 1).await;

    connection.connectivity(IceConnectionState::Connected);
    eventually("event pump to stop", || !connection.listening()).await;
    settle().await;
    assert_eq!(connection.closes(), 1);
    assert_eq!(recorder.disconnects(), 0);
}

#[tokio::test]
async fn disconnect_forgets_ringing_invites() {
    let bus = Arc::new(LocalBus::new());
    let mut responses = tap(&bus, EventNamespace::CallResponse, "carol");
    let bob = phone(&bus, "bob", OnRing::Hold).await;

    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c1", "carol"));
    eventually("ring", || !bob.recorder.held.lock().is_empty()).await;
    assert_eq!(bob.phone.state(), NegotiationState::InboundRinging);

    bob.phone.disconnect().await;
    assert_eq!(bob.phone.state(), NegotiationState::Idle);
    assert_eq!(bob.recorder.disconnects(), 1);

    bob.recorder.take_held().respond(webrtc_phone::CallAnswer::reject());
    let response: CallResponse = next(&mut responses).await;
    assert!(!response.accepted_call);
    assert_eq!(bob.phone.state(), NegotiationState::Idle);
}

#[tokio::test]
async fn relay_only_mode_skips_direct_candidates() {
    let bus = Arc::new(LocalBus::new());
    let (config, factory, recorder) = support::config(&bus, "alice", OnRing::Hold);
    let alice = TestPhone {
        phone: WebRtcPhone::new(config.ignore_non_turn(true))
            .await
            .expect("phone builds"),
        factory,
        recorder,
    };
    let Outbound { caller, invite, .. } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;
    accept(&bus, &invite);
    eventually("answer applied", || connection.remote().is_some()).await;

    send(
        &bus,
        EventNamespace::PeerIceCandidate,
        "alice",
        &CandidateBatch {
            call_id: invite.call_id.clone(),
            candidates: vec![host_candidate(1), relay_candidate(2), host_candidate(3)],
        },
    );

    eventually("relay registered", || !connection.registered().is_empty()).await;
    settle().await;
    assert_eq!(connection.registered(), vec![relay_candidate(2)]);
}

#[tokio::test]
async fn rejecting_sends_refusal_without_a_connection() {
    let bus = Arc::new(LocalBus::new());
    let mut responses = tap(&bus, EventNamespace::CallResponse, "carol");
    let bob = phone(&bus, "bob", OnRing::Reject).await;

    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c1", "carol"));

    let response: CallResponse = next(&mut responses).await;
    assert_eq!(response, CallResponse::rejected(CallId::from("c1")));
    settle().await;
    assert_eq!(bob.factory.count(), 0);
    assert_eq!(bob.phone.state(), NegotiationState::Idle);
}

#[tokio::test]
async fn lost_connectivity_ends_the_call_once() {
    let bus = Arc::new(LocalBus::new());
    let (alice, _bob) = established(&bus).await;
    let connection = alice.factory.connection(0).await;

    connection.connectivity(IceConnectionState::Checking);
    connection.connectivity(IceConnectionState::Disconnected);
    eventually("teardown", || alice.recorder.disconnects() == 1).await;
    assert!(alice.phone.active_call().is_none());
    assert_eq!(connection.closes(), 1);

    connection.connectivity(IceConnectionState::Disconnected);
    settle().await;
    assert_eq!(alice.recorder.disconnects(), 1);
}

#[tokio::test]
async fn messages_for_another_call_are_ignored() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound { caller, invite, .. } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;

    send(
        &bus,
        EventNamespace::CallResponse,
        "alice",
        &CallResponse::accepted(
            CallId::from("someone-elses-call"),
            PeerId::from("bob"),
            SessionDescription::answer("stale"),
        ),
    );
    send(
        &bus,
        EventNamespace::PeerIceCandidate,
        "alice",
        &CandidateBatch {
            call_id: CallId::from("someone-elses-call"),
            candidates: vec![relay_candidate(1)],
        },
    );
    settle().await;

    assert!(caller.recorder.responses().is_empty());
    assert!(connection.remote().is_none());
    assert_eq!(caller.phone.state(), NegotiationState::OutboundAwaitingResponse);

    accept(&bus, &invite);
    eventually("real answer", || caller.recorder.responses() == vec![true]).await;
}

#[tokio::test]
async fn early_peer_candidates_are_held_until_the_answer_lands() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound { caller, invite, .. } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;
    connection.delay_remote_description(Duration::from_millis(100));

    accept(&bus, &invite);
    send(
        &bus,
        EventNamespace::PeerIceCandidate,
        "alice",
        &CandidateBatch {
            call_id: invite.call_id.clone(),
            candidates: vec![relay_candidate(1), host_candidate(2)],
        },
    );

    eventually("held candidates applied", || connection.registered().len() == 2).await;
    assert_eq!(
        connection.registered(),
        vec![relay_candidate(1), host_candidate(2)]
    );
}

#[tokio::test]
async fn held_and_later_candidates_register_in_arrival_order() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound { caller, invite, .. } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;
    connection.delay_remote_description(Duration::from_millis(50));
    connection.delay_candidates(Duration::from_millis(20));

    accept(&bus, &invite);
    send(
        &bus,
        EventNamespace::PeerIceCandidate,
        "alice",
        &CandidateBatch {
            call_id: invite.call_id.clone(),
            candidates: vec![relay_candidate(1), relay_candidate(2), relay_candidate(3)],
        },
    );
    eventually("answer applied", || connection.remote().is_some()).await;
    send(
        &bus,
        EventNamespace::PeerIceCandidate,
        "alice",
        &CandidateBatch {
            call_id: invite.call_id.clone(),
            candidates: vec![host_candidate(4), host_candidate(5)],
        },
    );

    eventually("every candidate registered", || connection.registered().len() == 5).await;
    assert_eq!(
        connection.registered(),
        vec![
            relay_candidate(1),
            relay_candidate(2),
            relay_candidate(3),
            host_candidate(4),
            host_candidate(5),
        ]
    );
}

#[tokio::test]
async fn malformed_peer_candidate_does_not_drop_the_rest() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound { caller, invite, .. } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;
    accept(&bus, &invite);
    eventually("answer applied", || connection.remote().is_some()).await;

    send(
        &bus,
        EventNamespace::PeerIceCandidate,
        "alice",
        &CandidateBatch {
            call_id: invite.call_id.clone(),
            candidates: vec![
                relay_candidate(1),
                IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 5009"),
                host_candidate(2),
            ],
        },
    );

    eventually("valid candidates registered", || connection.registered().len() == 2).await;
    settle().await;
    assert_eq!(
        connection.registered(),
        vec![relay_candidate(1), host_candidate(2)]
    );
    assert_eq!(caller.phone.state(), NegotiationState::Established);
    assert_eq!(connection.closes(), 0);
    assert_eq!(caller.recorder.disconnects(), 0);
}

#[tokio::test]
async fn late_answer_after_hangup_changes_nothing() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound {
        caller,
        invite,
        mut candidates,
    } = call_bare_bob(&bus, alice).await;
    let connection = caller.factory.connection(0).await;
    connection.delay_remote_description(Duration::from_millis(100));

    accept(&bus, &invite);
    eventually("acceptance", || caller.recorder.responses() == vec![true]).await;
    caller.phone.disconnect().await;
    eventually("answer to land", || connection.remote().is_some()).await;

    connection.discover(host_candidate(1));
    settle().await;
    assert!(caller.phone.active_call().is_none());
    assert_eq!(caller.phone.state(), NegotiationState::Idle);
    assert_eq!(caller.recorder.disconnects(), 1);
    assert_quiet(&mut candidates);
}

#[tokio::test]
async fn calling_again_retires_the_previous_attempt() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let Outbound { caller, invite, .. } = call_bare_bob(&bus, alice).await;
    let first = caller.factory.connection(0).await;

    caller.phone.call_user("carol", CallOptions::default()).await;
    assert_eq!(first.closes(), 1);
    let current = caller.phone.active_call().expect("call to carol");
    assert_eq!(current.peer_id, PeerId::from("carol"));

    accept(&bus, &invite);
    settle().await;
    assert!(caller.recorder.responses().is_empty());
    assert_eq!(caller.recorder.disconnects(), 0);
    assert!(caller.factory.connection(1).await.remote().is_none());
}

#[tokio::test]
async fn duplicate_and_malformed_invites_are_dropped() {
    let bus = Arc::new(LocalBus::new());
    let bob = phone(&bus, "bob", OnRing::Hold).await;

    send_raw(&bus, EventNamespace::IncomingCall, "bob", b"not json");
    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c1", "carol"));
    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c1", "carol"));
    eventually("ring", || bob.recorder.incoming().len() == 1).await;
    settle().await;

    assert_eq!(bob.recorder.incoming(), vec![PeerId::from("carol")]);
    assert_eq!(bob.phone.state(), NegotiationState::InboundRinging);
    drop(bob.recorder.take_held());
    assert_eq!(bob.phone.state(), NegotiationState::Idle);
}

#[tokio::test]
async fn held_call_can_be_answered_later_with_its_own_stream() {
    let bus = Arc::new(LocalBus::new());
    let mut responses = tap(&bus, EventNamespace::CallResponse, "carol");
    let bob = phone(&bus, "bob", OnRing::Hold).await;

    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c1", "carol"));
    eventually("ring", || !bob.recorder.held.lock().is_empty()).await;
    let responder = bob.recorder.take_held();
    assert_eq!(responder.caller(), Some(&PeerId::from("carol")));
    responder.respond(webrtc_phone::CallAnswer::accept().with_stream(support::stream("camera")));

    let response: CallResponse = next(&mut responses).await;
    assert!(response.accepted_call);
    let connection = bob.factory.connection(0).await;
    assert_eq!(
        connection.with_state(|state| state.streams.clone()),
        vec!["camera".to_string()]
    );
}

#[tokio::test]
async fn remote_tracks_reach_the_call_handler() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    alice
        .phone
        .call_user(
            "bob",
            CallOptions::default().on_peer_stream(move |track: PeerTrack| {
                sink.lock().push(track.track_id)
            }),
        )
        .await;
    let connection = alice.factory.connection(0).await;

    connection.remote_track(PeerTrack::new("audio-1", "stream-1", "audio"));
    eventually("track delivered", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock().clone(), vec!["audio-1".to_string()]);
    assert!(alice.recorder.tracks.lock().is_empty());
}

#[tokio::test]
async fn call_options_stick_for_later_calls() {
    let bus = Arc::new(LocalBus::new());
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    let custom = RtcConfig::builder()
        .add_ice_server(vec!["stun:stun.example.org:3478".into()])
        .build()
        .unwrap();

    alice
        .phone
        .call_user("bob", CallOptions::default().rtc_config(custom.clone()))
        .await;
    alice.phone.call_user("carol", CallOptions::default()).await;

    assert_eq!(alice.factory.connection(0).await.config, custom);
    assert_eq!(alice.factory.connection(1).await.config, custom);
}

#[tokio::test]
async fn failed_connection_leaves_the_call_without_a_handle() {
    let bus = Arc::new(LocalBus::new());
    let mut invites = tap(&bus, EventNamespace::IncomingCall, "bob");
    let alice = phone(&bus, "alice", OnRing::Hold).await;
    alice.factory.fail_next();

    alice.phone.call_user("bob", CallOptions::default()).await;
    settle().await;

    let snapshot = alice.phone.active_call().expect("session kept");
    assert!(!snapshot.has_connection);
    assert_quiet(&mut invites);
}

#[tokio::test]
async fn strict_configuration_requires_every_handler() {
    let bus = Arc::new(LocalBus::new());
    let transport = Arc::new(BusTransport::new("alice", bus.clone()));
    let config = PhoneConfig::new(transport)
        .connections(support::FakeFactory::new())
        .on_call_response(|_| {})
        .strict(true);

    match WebRtcPhone::new(config).await {
        Err(PhoneError::Config(ConfigError::Missing(fields))) => assert_eq!(fields.len(), 3),
        other => panic!("expected missing handlers, got {other:?}"),
    }
}

#[tokio::test]
async fn lenient_configuration_rejects_calls_it_cannot_ring() {
    let bus = Arc::new(LocalBus::new());
    let mut responses = tap(&bus, EventNamespace::CallResponse, "carol");
    let factory = support::FakeFactory::new();
    let transport = Arc::new(BusTransport::new("bob", bus.clone()));
    let _bob = WebRtcPhone::new(PhoneConfig::new(transport).connections(factory.clone()))
        .await
        .expect("lenient phone builds");

    send(&bus, EventNamespace::IncomingCall, "bob", &invite("c9", "carol"));
    let response: CallResponse = next(&mut responses).await;
    assert!(!response.accepted_call);
    assert_eq!(factory.count(), 0);
}
