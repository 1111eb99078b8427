use std::time::Duration;

use radio_comms::context::ContextPool;
use radio_comms::loopback::{LoopbackNetwork, LoopbackTransport};
use radio_comms::signaling::{SignalEnvelope, SignalPayload, relay_pair};
use radio_comms::spatial::{POLAR_POSITIONS, polar_to_xyz};
use radio_comms::{
    CommsConfig, CommsError, ConnectionState, LoopbackSession, NegotiationState,
    PeerConnectionManager, SignalOutcome,
};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

fn connected_session(channels: usize) -> LoopbackSession {
    let mut session = LoopbackSession::new(&CommsConfig::default().with_stream_count(channels));
    assert!(session.connect(CONNECT_TIMEOUT).expect("connect"));
    session
}

#[test]
fn two_channel_session_places_and_detects_speech() {
    let mut session = connected_session(2);
    for station in [&session.experimenter, &session.participant] {
        assert_eq!(station.connection_state(), ConnectionState::Connected);
        assert_eq!(station.negotiation_state(), NegotiationState::Connected);
    }

    let positions = session.experimenter.peer().inbound_positions();
    assert_eq!(positions.len(), 2);
    for (channel, position) in positions {
        let polar = POLAR_POSITIONS[channel];
        assert_eq!(position, polar_to_xyz(polar.yaw_deg, polar.pitch_deg, polar.distance));
    }

    session.experimenter.begin_transmit(0).expect("channel 0");
    session.experimenter_mic.set_tone(48_000, 1_000.0, 0.5);

    let start = session.participant.elapsed();
    let mut heard = false;
    while session.participant.elapsed() - start < Duration::from_millis(200) {
        session.pump().expect("pump");
        if session.participant.rx_activity().get(&0).copied().unwrap_or(false) {
            heard = true;
            break;
        }
    }
    assert!(heard, "channel 0 never became active on the participant");
    assert!(!session.participant.rx_activity().get(&1).copied().unwrap_or(false));
    assert!(session.experimenter.snapshot()[&0].transmitting);

    session.experimenter.end_transmit();
    session.advance(Duration::from_millis(300)).expect("advance");
    assert!(!session.participant.snapshot()[&0].receiving);
}

#[test]
fn repeated_signaling_messages_are_discarded() {
    let mut session = connected_session(2);
    let offer = session
        .experimenter
        .peer()
        .transport()
        .local_description()
        .cloned()
        .expect("local offer");
    let answer = session
        .participant
        .peer()
        .transport()
        .local_description()
        .cloned()
        .expect("local answer");
    let contexts_before = session.participant.peer().pool().open_count();

    let mic = session.participant.capture().source().cloned();
    let outcome = session
        .participant
        .peer_mut()
        .handle_signal(SignalEnvelope::new(SignalPayload::Offer(offer.clone())), mic.as_ref())
        .expect("duplicate offer");
    assert_eq!(outcome, SignalOutcome::Discarded);

    let mic = session.experimenter.capture().source().cloned();
    let outcome = session
        .experimenter
        .peer_mut()
        .handle_signal(SignalEnvelope::new(SignalPayload::Answer(Some(answer))), mic.as_ref())
        .expect("duplicate answer");
    assert_eq!(outcome, SignalOutcome::Discarded);

    let mut foreign = SignalEnvelope::new(SignalPayload::Offer(offer));
    foreign.event = "chat".to_string();
    let outcome = session
        .participant
        .peer_mut()
        .handle_signal(foreign, None)
        .expect("foreign event");
    assert_eq!(outcome, SignalOutcome::Discarded);

    session.advance(Duration::from_millis(50)).expect("advance");
    assert_eq!(session.participant.peer().pool().open_count(), contexts_before);
    assert_eq!(session.participant.connection_state(), ConnectionState::Connected);
    assert_eq!(session.experimenter.connection_state(), ConnectionState::Connected);
}

#[test]
fn missing_microphone_blocks_negotiation_without_side_effects() {
    let config = CommsConfig::default().with_stream_count(3);
    let network = LoopbackNetwork::new();
    let (local, remote) = relay_pair();
    let pool = ContextPool::new(config.sample_rate, config.render_quantum, config.max_contexts);
    let mut manager = PeerConnectionManager::new(
        &config,
        pool,
        Box::new(LoopbackTransport::new(&network, 48_000)),
        Box::new(local),
    );

    assert!(matches!(
        manager.create_offer(None),
        Err(CommsError::CaptureUnavailable)
    ));
    assert!(manager.transport().local_description().is_none());
    assert_eq!(manager.negotiation_state(), NegotiationState::Idle);
    assert_eq!(manager.pool().open_count(), 0);
    assert!(manager.track_controls().is_empty());
    assert_eq!(remote.pending(), 0);

    let mut session = LoopbackSession::new(&config);
    session.experimenter.notify_gesture();
    session.experimenter.create_offer().expect("offer");
    let offer = session
        .experimenter
        .peer()
        .transport()
        .local_description()
        .cloned()
        .expect("local offer");
    assert!(matches!(
        session
            .participant
            .peer_mut()
            .handle_signal(SignalEnvelope::new(SignalPayload::Offer(offer)), None),
        Err(CommsError::CaptureUnavailable)
    ));
    assert!(session.participant.peer().transport().remote_description().is_none());
    assert_eq!(session.participant.negotiation_state(), NegotiationState::Idle);
}

#[test]
fn teardown_releases_every_context_across_cycles() {
    let config = CommsConfig::default().with_stream_count(4);
    for _ in 0..3 {
        let mut session = LoopbackSession::new(&config);
        assert!(session.connect(CONNECT_TIMEOUT).expect("connect"));
        session.advance(Duration::from_millis(100)).expect("advance");
        assert_eq!(session.network.endpoint_count(), 2);
        for station in [&session.experimenter, &session.participant] {
            assert_eq!(station.peer().pool().open_count(), 5);
        }

        session.experimenter.teardown();
        session.participant.teardown();
        for station in [&session.experimenter, &session.participant] {
            assert_eq!(station.peer().pool().open_count(), 0);
            assert_eq!(station.connection_state(), ConnectionState::Closed);
            assert_eq!(station.negotiation_state(), NegotiationState::Closed);
            assert!(station.peer().inbound().is_empty());
        }
        assert_eq!(session.network.endpoint_count(), 0);
    }
}

#[test]
fn reset_supports_repeated_connect_cycles_on_the_same_stations() {
    let mut session = LoopbackSession::new(&CommsConfig::default().with_stream_count(2));
    let mut clip = vec![0.0f32; 48_000 / 2];
    radio_comms::tone::ToneGenerator::new(48_000, 800.0, 0.5).fill(&mut clip);
    let clip: std::sync::Arc<[f32]> = clip.into();

    for cycle in 0..3 {
        assert!(session.connect(CONNECT_TIMEOUT).expect("connect"), "cycle {cycle}");
        for station in [&session.experimenter, &session.participant] {
            assert_eq!(station.negotiation_state(), NegotiationState::Connected);
            assert_eq!(station.peer().pool().open_count(), 3);
            assert_eq!(station.peer().inbound().keys().copied().collect::<Vec<_>>(), [0, 1]);
        }

        session.experimenter.play_clip(1, clip.clone()).expect("clip");
        session.advance(Duration::from_millis(250)).expect("advance");
        assert!(session.participant.snapshot()[&1].receiving, "cycle {cycle}");
        assert!(!session.participant.snapshot()[&0].receiving, "cycle {cycle}");

        session.reset();
        assert_eq!(session.network.endpoint_count(), 2);
        for station in [&session.experimenter, &session.participant] {
            assert_eq!(station.negotiation_state(), NegotiationState::Idle);
            assert_eq!(station.peer().pool().open_count(), 0);
            assert!(station.peer().inbound().is_empty());
            assert!(station.peer().transport().local_description().is_none());
        }
    }
}
