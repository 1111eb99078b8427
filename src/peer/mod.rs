//! Peer connection manager: drives negotiation of N symmetric channels over one transport
//! and owns every audio graph hanging off that connection.

pub mod channels;
pub mod tab;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

pub use channels::{ChannelResolution, resolve_inbound_channel};
pub use tab::TabSlot;

use crate::CommsError;
use crate::config::{CodecTuning, CommsConfig, RadioProfile};
use crate::context::{AudioContext, ContextPool, GainParam};
use crate::graph::{ClipHandle, InboundStrip, RadioMode, TrackControl, build_outbound};
use crate::negotiation::{NegotiationEvent, NegotiationState};
use crate::ring::SharedRingBuffer;
use crate::sdp;
use crate::signaling::{SessionDescription, SignalEnvelope, SignalPayload, SignalingChannel};
use crate::spatial::{SpatialMix, SpatialPosition, SpatialRenderer};
use crate::track::AudioTrack;
use crate::transport::{ConnectionState, PeerTransport, SignalingState, TransportEvent};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Result of handling one signaling message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The message changed negotiation or transport state.
    Applied,
    /// Stale, duplicate or empty message; dropped after a state check.
    Discarded,
}

/// One received channel: its track, squelch gain and fixed spatial position.
pub struct InboundChannel {
    track: AudioTrack,
    monitoring: GainParam,
    position: SpatialPosition,
}

impl InboundChannel {
    /// The remote track.
    pub fn track(&self) -> &AudioTrack {
        &self.track
    }

    /// Whether the squelch gain is open.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.get() > 0.0
    }

    /// Fixed position of this channel.
    pub fn position(&self) -> SpatialPosition {
        self.position
    }
}

/// Negotiates N symmetric audio channels over one [`PeerTransport`] and owns the audio
/// graphs on both sides of it.
///
/// At most one manager per [`TabSlot`] holds a connection at a time.
pub struct PeerConnectionManager {
    id: u64,
    stream_count: usize,
    sample_rate: u32,
    capacity_frames: usize,
    radio: RadioProfile,
    codec: CodecTuning,
    mode: RadioMode,
    pool: ContextPool,
    transport: Box<dyn PeerTransport>,
    signaling: Box<dyn SignalingChannel>,
    tab: TabSlot,
    state: NegotiationState,
    connection: ConnectionState,
    outbound: BTreeMap<usize, TrackControl>,
    inbound: BTreeMap<usize, InboundChannel>,
    spatial: SpatialMix,
    receive_context: Option<Arc<AudioContext>>,
    listener: Arc<SharedRingBuffer>,
    observers: Vec<Sender<ConnectionState>>,
}

impl PeerConnectionManager {
    /// An idle manager using `transport` for media and `signaling` for offer/answer exchange.
    pub fn new(
        config: &CommsConfig,
        pool: ContextPool,
        transport: Box<dyn PeerTransport>,
        signaling: Box<dyn SignalingChannel>,
    ) -> Self {
        let connection = transport.connection_state();
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            stream_count: config.stream_count,
            sample_rate: config.sample_rate,
            capacity_frames: config.track_capacity_frames(),
            radio: config.radio.clone(),
            codec: config.codec.clone(),
            mode: RadioMode::default(),
            pool,
            transport,
            signaling,
            tab: TabSlot::new(),
            state: NegotiationState::Idle,
            connection,
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
            spatial: SpatialMix::new(config.sample_rate),
            receive_context: None,
            listener: Arc::new(SharedRingBuffer::new(config.track_capacity_frames(), 2)),
            observers: Vec::new(),
        }
    }

    /// Select how inbound speech is rendered (experimenters hear it clean).
    pub fn with_radio_mode(mut self, mode: RadioMode) -> Self {
        self.mode = mode;
        self
    }

    /// Share the single-connection token with other managers of the same tab.
    pub fn with_tab_slot(mut self, tab: TabSlot) -> Self {
        self.tab = tab;
        self
    }

    /// Process-unique manager id, used as the tab slot owner.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of channels negotiated in each direction.
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// How inbound speech is rendered.
    pub fn radio_mode(&self) -> RadioMode {
        self.mode
    }

    /// Current negotiation state.
    pub fn negotiation_state(&self) -> NegotiationState {
        self.state
    }

    /// Last connection state reported by the transport.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// The underlying transport.
    pub fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    /// Pool every context of this manager comes from.
    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Receive every subsequent connection state change.
    pub fn subscribe_state(&mut self) -> Receiver<ConnectionState> {
        let (tx, rx) = unbounded();
        self.observers.push(tx);
        rx
    }

    /// Start a connection as the offering side. Returns the per-channel controls.
    ///
    /// Fails without touching the transport when `microphone` is missing. A failure after
    /// the transport was touched leaves the manager [`Failed`](NegotiationState::Failed)
    /// until [`reset`](Self::reset).
    pub fn create_offer(
        &mut self,
        microphone: Option<&AudioTrack>,
    ) -> Result<&BTreeMap<usize, TrackControl>, CommsError> {
        let microphone = microphone.ok_or(CommsError::CaptureUnavailable)?;
        if self.state.is_pending() {
            return Err(CommsError::NegotiationPending);
        }
        let next = self.state.apply(NegotiationEvent::LocalOfferSent)?;
        self.tab.claim(self.id)?;

        if let Err(err) = self.send_offer(microphone) {
            self.tab.release(self.id);
            return Err(err);
        }
        self.state = next;
        info!(manager = self.id, channels = self.stream_count, "offer sent");
        self.poll_transport()?;
        Ok(&self.outbound)
    }

    fn send_offer(&mut self, microphone: &AudioTrack) -> Result<(), CommsError> {
        let controls = self.build_outbound_set(microphone)?;
        if let Err(err) = self.publish_offer(&controls) {
            self.abandon_negotiation(&err);
            return Err(err);
        }
        self.outbound = controls;
        Ok(())
    }

    fn publish_offer(&mut self, controls: &BTreeMap<usize, TrackControl>) -> Result<(), CommsError> {
        for control in controls.values() {
            self.transport.add_track(control.output_track())?;
        }
        let offer = self.transport.create_offer()?;
        let offer = SessionDescription::offer(sdp::tune_opus(&offer.sdp, &self.codec)?);
        self.transport.set_local_description(offer.clone())?;
        self.signaling
            .send(&SignalEnvelope::new(SignalPayload::Offer(offer)))
    }

    /// Drop everything a half-finished negotiation built and park in `Failed`. The transport
    /// cannot roll back, so it is closed.
    fn abandon_negotiation(&mut self, err: &CommsError) {
        warn!(manager = self.id, %err, state = %self.state, "negotiation abandoned");
        self.outbound.clear();
        self.transport.close();
        while self.transport.poll_event().is_some() {}
        self.state = NegotiationState::Failed;
        self.tab.release(self.id);
        self.on_connection_state(ConnectionState::Failed);
    }

    fn build_outbound_set(
        &self,
        microphone: &AudioTrack,
    ) -> Result<BTreeMap<usize, TrackControl>, CommsError> {
        (0..self.stream_count)
            .map(|channel| {
                build_outbound(&self.pool, microphone, channel, self.capacity_frames)
                    .map(|control| (channel, control))
            })
            .collect()
    }

    /// Dispatch one signaling message.
    pub fn handle_signal(
        &mut self,
        envelope: SignalEnvelope,
        microphone: Option<&AudioTrack>,
    ) -> Result<SignalOutcome, CommsError> {
        if !envelope.is_webrtc() {
            debug!(event = %envelope.event, "foreign signaling event ignored");
            return Ok(SignalOutcome::Discarded);
        }
        let kind = envelope.payload.kind();
        let outcome = match envelope.payload {
            SignalPayload::Offer(offer) => self.accept_offer(offer, microphone)?,
            SignalPayload::Answer(Some(answer)) => self.apply_answer(answer)?,
            SignalPayload::IceCandidate(Some(_))
                if self.state.is_terminal()
                    || self.transport.signaling_state() == SignalingState::Closed =>
            {
                SignalOutcome::Discarded
            }
            SignalPayload::IceCandidate(Some(candidate)) => {
                self.transport.add_ice_candidate(candidate)?;
                SignalOutcome::Applied
            }
            SignalPayload::Answer(None) | SignalPayload::IceCandidate(None) => {
                SignalOutcome::Discarded
            }
        };
        if outcome == SignalOutcome::Discarded {
            debug!(manager = self.id, kind, state = %self.state, "signaling message discarded");
        }
        self.poll_transport()?;
        Ok(outcome)
    }

    fn accept_offer(
        &mut self,
        offer: SessionDescription,
        microphone: Option<&AudioTrack>,
    ) -> Result<SignalOutcome, CommsError> {
        if self.state != NegotiationState::Idle
            || self.transport.signaling_state() != SignalingState::Stable
        {
            return Ok(SignalOutcome::Discarded);
        }
        let microphone = microphone.ok_or(CommsError::CaptureUnavailable)?;
        let answered = self
            .state
            .apply(NegotiationEvent::RemoteOfferApplied)?
            .apply(NegotiationEvent::LocalAnswerSent)?;
        self.tab.claim(self.id)?;

        if let Err(err) = self.send_answer(offer, microphone) {
            self.tab.release(self.id);
            return Err(err);
        }
        self.state = answered;
        info!(manager = self.id, channels = self.stream_count, "answer sent");
        Ok(SignalOutcome::Applied)
    }

    fn send_answer(&mut self, offer: SessionDescription, microphone: &AudioTrack) -> Result<(), CommsError> {
        let controls = self.build_outbound_set(microphone)?;
        if let Err(err) = self.publish_answer(offer, &controls) {
            self.abandon_negotiation(&err);
            return Err(err);
        }
        self.outbound = controls;
        Ok(())
    }

    fn publish_answer(
        &mut self,
        offer: SessionDescription,
        controls: &BTreeMap<usize, TrackControl>,
    ) -> Result<(), CommsError> {
        self.transport.set_remote_description(offer)?;
        for control in controls.values() {
            self.transport.add_track(control.output_track())?;
        }
        let answer = self.transport.create_answer()?;
        let answer = SessionDescription::answer(sdp::tune_opus(&answer.sdp, &self.codec)?);
        self.transport.set_local_description(answer.clone())?;
        self.signaling
            .send(&SignalEnvelope::new(SignalPayload::Answer(Some(answer))))
    }

    fn apply_answer(&mut self, answer: SessionDescription) -> Result<SignalOutcome, CommsError> {
        if self.state != NegotiationState::AwaitingAnswer
            || self.transport.signaling_state() != SignalingState::HaveLocalOffer
        {
            return Ok(SignalOutcome::Discarded);
        }
        self.transport.set_remote_description(answer)?;
        self.state = self.state.apply(NegotiationEvent::RemoteAnswerApplied)?;
        info!(manager = self.id, "answer applied");
        Ok(SignalOutcome::Applied)
    }

    /// Handle every message waiting on the signaling channel, in arrival order.
    ///
    /// Undecodable messages are dropped; a precondition failure stops processing and is
    /// returned, leaving later messages queued.
    pub fn process_signals(&mut self, microphone: Option<&AudioTrack>) -> Result<usize, CommsError> {
        let mut handled = 0;
        loop {
            let envelope = match self.signaling.try_recv() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(CommsError::Codec(err)) => {
                    warn!(%err, "undecodable signaling message dropped");
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.handle_signal(envelope, microphone)?;
            handled += 1;
        }
        self.poll_transport()?;
        Ok(handled)
    }

    /// Drain transport notifications: forward candidates, wire up arriving tracks and
    /// surface connection state.
    pub fn poll_transport(&mut self) -> Result<(), CommsError> {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::IceCandidate(candidate) => {
                    let envelope = SignalEnvelope::new(SignalPayload::IceCandidate(Some(candidate)));
                    if let Err(err) = self.signaling.send(&envelope) {
                        warn!(%err, "ice candidate not delivered");
                    }
                }
                TransportEvent::Track(track) => self.on_track(track)?,
                TransportEvent::ConnectionState(state) => self.on_connection_state(state),
            }
        }
        Ok(())
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        info!(manager = self.id, %state, "connection state changed");
        self.connection = state;
        self.observers.retain(|observer| observer.send(state).is_ok());
        if matches!(state, ConnectionState::Failed | ConnectionState::Disconnected) {
            if let Ok(next) = self.state.apply(NegotiationEvent::TransportFailed) {
                self.state = next;
            }
            self.tab.release(self.id);
        }
    }

    fn on_track(&mut self, track: AudioTrack) -> Result<(), CommsError> {
        let resolution =
            resolve_inbound_channel(track.channel_hint(), self.inbound.len(), self.stream_count);
        if resolution.resets() {
            warn!(
                manager = self.id,
                held = self.inbound.len(),
                "inbound channels full, clearing tracks of a previous session"
            );
            self.clear_inbound();
        }
        let channel = resolution.channel();
        self.receive_context()?;

        let monitoring = GainParam::new(1.0);
        let strip = InboundStrip::new(
            channel,
            &track,
            self.mode,
            &self.radio,
            self.sample_rate,
            monitoring.clone(),
        );
        let position = self.spatial.connect(strip);
        debug!(manager = self.id, channel, ?resolution, label = track.label(), "inbound track connected");
        self.inbound.insert(
            channel,
            InboundChannel {
                track,
                monitoring,
                position,
            },
        );
        Ok(())
    }

    fn receive_context(&mut self) -> Result<Arc<AudioContext>, CommsError> {
        if let Some(context) = &self.receive_context {
            if !context.is_closed() {
                return Ok(context.clone());
            }
        }
        let context = self.pool.open()?;
        context.attach(Box::new(SpatialRenderer::new(
            self.spatial.clone(),
            self.listener.clone(),
        )))?;
        self.receive_context = Some(context.clone());
        Ok(context)
    }

    fn clear_inbound(&mut self) {
        self.spatial.clear();
        self.inbound.clear();
    }

    /// Outbound channel controls, empty until a negotiation has started.
    pub fn track_controls(&self) -> &BTreeMap<usize, TrackControl> {
        &self.outbound
    }

    /// Received channels by index.
    pub fn inbound(&self) -> &BTreeMap<usize, InboundChannel> {
        &self.inbound
    }

    /// Inbound tracks by channel.
    pub fn inbound_tracks(&self) -> BTreeMap<usize, AudioTrack> {
        self.inbound
            .iter()
            .map(|(channel, inbound)| (*channel, inbound.track.clone()))
            .collect()
    }

    /// Outbound tracks by channel.
    pub fn outbound_tracks(&self) -> BTreeMap<usize, AudioTrack> {
        self.outbound
            .iter()
            .map(|(channel, control)| (*channel, control.output_track().clone()))
            .collect()
    }

    /// Position of every received channel.
    pub fn inbound_positions(&self) -> Vec<(usize, SpatialPosition)> {
        self.spatial.positions()
    }

    /// Interleaved stereo mix of every inbound channel.
    pub fn listener_output(&self) -> &Arc<SharedRingBuffer> {
        &self.listener
    }

    /// Open or close the microphone on one outbound channel.
    pub fn set_transmitting(&self, channel: usize, transmitting: bool) -> Result<(), CommsError> {
        self.outbound
            .get(&channel)
            .ok_or(CommsError::UnknownChannel(channel))?
            .set_transmitting(transmitting);
        Ok(())
    }

    /// Close the microphone on every outbound channel.
    pub fn mute_all(&self) {
        for control in self.outbound.values() {
            control.set_transmitting(false);
        }
    }

    /// Squelch (false) or open (true) an inbound channel.
    pub fn set_monitoring(&self, channel: usize, monitoring: bool) -> Result<(), CommsError> {
        self.inbound
            .get(&channel)
            .ok_or(CommsError::UnknownChannel(channel))?
            .monitoring
            .set(if monitoring { 1.0 } else { 0.0 });
        Ok(())
    }

    /// Whether inbound `channel` is audible.
    pub fn is_monitoring(&self, channel: usize) -> bool {
        self.inbound
            .get(&channel)
            .is_some_and(InboundChannel::is_monitoring)
    }

    /// Queue `clip` on outbound `channel`, mixed over the microphone path.
    pub fn play_clip(&self, channel: usize, clip: Arc<[f32]>) -> Result<ClipHandle, CommsError> {
        Ok(self
            .outbound
            .get(&channel)
            .ok_or(CommsError::UnknownChannel(channel))?
            .play_clip(clip))
    }

    /// Render one quantum of every outbound channel.
    pub fn render_outbound(&self) -> Result<(), CommsError> {
        for control in self.outbound.values() {
            control.context().render()?;
        }
        Ok(())
    }

    /// Render one quantum of the spatial listener mix.
    pub fn render_inbound(&self) -> Result<(), CommsError> {
        match &self.receive_context {
            Some(context) => context.render().map(|_| ()),
            None => Ok(()),
        }
    }

    /// Let the transport move media and collect its events.
    pub fn pump_media(&mut self) -> Result<(), CommsError> {
        self.transport.pump_media();
        self.poll_transport()
    }

    /// Close the connection and every context and analyser hanging off it.
    pub fn teardown(&mut self) {
        self.outbound.clear();
        if let Some(context) = self.receive_context.take() {
            context.close();
        }
        self.clear_inbound();
        self.transport.close();
        if let Ok(next) = self.state.apply(NegotiationEvent::Close) {
            self.state = next;
        }
        self.tab.release(self.id);
        if self.connection != ConnectionState::Closed {
            self.on_connection_state(ConnectionState::Closed);
        }
        info!(manager = self.id, open_contexts = self.pool.open_count(), "peer connection torn down");
    }

    /// Tear down and start over on a fresh transport, ready for a new offer/answer cycle.
    pub fn reset(&mut self, transport: Box<dyn PeerTransport>) {
        self.teardown();
        self.connection = transport.connection_state();
        self.transport = transport;
        self.state = NegotiationState::Idle;
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackTransport};
    use crate::signaling::{IceCandidate, RelayEndpoint, relay_pair};

    struct Pair {
        a: PeerConnectionManager,
        b: PeerConnectionManager,
        mic_a: AudioTrack,
        mic_b: AudioTrack,
    }

    fn config() -> CommsConfig {
        CommsConfig::default().with_stream_count(2)
    }

    fn manager(
        network: &LoopbackNetwork,
        relay: RelayEndpoint,
        transport: impl FnOnce(LoopbackTransport) -> LoopbackTransport,
    ) -> PeerConnectionManager {
        let config = config();
        let pool = ContextPool::new(config.sample_rate, config.render_quantum, 16);
        let transport = transport(LoopbackTransport::new(network, 4_800));
        PeerConnectionManager::new(&config, pool, Box::new(transport), Box::new(relay))
    }

    fn pair_with(b_transport: impl FnOnce(LoopbackTransport) -> LoopbackTransport) -> Pair {
        let network = LoopbackNetwork::new();
        let (relay_a, relay_b) = relay_pair();
        Pair {
            a: manager(&network, relay_a, |t| t),
            b: manager(&network, relay_b, b_transport),
            mic_a: AudioTrack::new("microphone", 4_800),
            mic_b: AudioTrack::new("microphone", 4_800),
        }
    }

    fn exchange(pair: &mut Pair) {
        for _ in 0..4 {
            pair.b.process_signals(Some(&pair.mic_b)).unwrap();
            pair.a.process_signals(Some(&pair.mic_a)).unwrap();
        }
    }

    #[test]
    fn offer_without_capture_has_no_side_effects() {
        let mut pair = pair_with(|t| t);
        assert!(matches!(
            pair.a.create_offer(None),
            Err(CommsError::CaptureUnavailable)
        ));
        assert!(pair.a.transport().local_description().is_none());
        assert_eq!(pair.a.pool().open_count(), 0);
        assert_eq!(pair.a.negotiation_state(), NegotiationState::Idle);
    }

    #[test]
    fn symmetric_channels_after_exchange() {
        let mut pair = pair_with(|t| t);
        let state = pair.a.subscribe_state();
        assert_eq!(pair.a.create_offer(Some(&pair.mic_a)).unwrap().len(), 2);
        assert!(matches!(
            pair.a.create_offer(Some(&pair.mic_a)),
            Err(CommsError::NegotiationPending)
        ));
        exchange(&mut pair);

        for manager in [&pair.a, &pair.b] {
            assert_eq!(manager.connection_state(), ConnectionState::Connected);
            assert_eq!(manager.negotiation_state(), NegotiationState::Connected);
            assert_eq!(manager.inbound().len(), 2);
            assert_eq!(manager.track_controls().len(), 2);
            assert!(manager.track_controls().values().all(|c| !c.is_transmitting()));
        }
        let seen: Vec<_> = state.try_iter().collect();
        assert_eq!(
            seen,
            [ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn labels_fix_channels_when_tracks_arrive_reversed() {
        let mut pair = pair_with(LoopbackTransport::with_reversed_track_order);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        exchange(&mut pair);
        for (channel, inbound) in pair.b.inbound() {
            assert_eq!(inbound.track().channel_hint(), Some(*channel));
        }
    }

    #[test]
    fn duplicate_offer_and_answer_are_discarded() {
        let mut pair = pair_with(|t| t);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        exchange(&mut pair);

        let offer = pair.a.transport().local_description().cloned().unwrap();
        let answer = pair.b.transport().local_description().cloned().unwrap();
        let before = pair.a.transport().signaling_state();
        let outcome = pair
            .a
            .handle_signal(SignalEnvelope::new(SignalPayload::Answer(Some(answer))), None)
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded);
        assert_eq!(pair.a.transport().signaling_state(), before);

        let outcome = pair
            .b
            .handle_signal(SignalEnvelope::new(SignalPayload::Offer(offer)), None)
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded);
        assert_eq!(pair.b.negotiation_state(), NegotiationState::Connected);
    }

    #[test]
    fn incoming_offer_without_capture_fails_loudly() {
        let mut pair = pair_with(|t| t);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        assert!(matches!(
            pair.b.process_signals(None),
            Err(CommsError::CaptureUnavailable)
        ));
        assert!(pair.b.transport().local_description().is_none());
        assert!(pair.b.transport().remote_description().is_none());
    }

    #[test]
    fn failure_releases_tab_and_is_terminal() {
        let network = LoopbackNetwork::new();
        let (relay_a, relay_b) = relay_pair();
        let tab = TabSlot::new();
        let transport = LoopbackTransport::new(&network, 4_800);
        let link = transport.link_control();
        let config = config();
        let mut a = PeerConnectionManager::new(
            &config,
            ContextPool::new(48_000, 128, 16),
            Box::new(transport),
            Box::new(relay_a),
        )
        .with_tab_slot(tab.clone());
        let mut b = manager(&network, relay_b, |t| t);
        let mic = AudioTrack::new("microphone", 4_800);

        a.create_offer(Some(&mic)).unwrap();
        assert_eq!(tab.holder(), Some(a.id()));
        for _ in 0..4 {
            b.process_signals(Some(&mic)).unwrap();
            a.process_signals(Some(&mic)).unwrap();
        }
        assert_eq!(a.connection_state(), ConnectionState::Connected);

        link.sever();
        a.pump_media().unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Failed);
        assert_eq!(a.negotiation_state(), NegotiationState::Failed);
        assert_eq!(tab.holder(), None);
        assert!(a.create_offer(Some(&mic)).is_err());
    }

    #[test]
    fn offer_that_cannot_be_sent_parks_in_failed_until_reset() {
        let network = LoopbackNetwork::new();
        let (relay_a, relay_b) = relay_pair();
        drop(relay_b);
        let tab = TabSlot::new();
        let mut a = manager(&network, relay_a, |t| t).with_tab_slot(tab.clone());
        let state = a.subscribe_state();
        let mic = AudioTrack::new("microphone", 4_800);

        assert!(matches!(a.create_offer(Some(&mic)), Err(CommsError::Relay)));
        assert_eq!(a.negotiation_state(), NegotiationState::Failed);
        assert!(a.track_controls().is_empty());
        assert_eq!(a.pool().open_count(), 0);
        assert_eq!(mic.reader_count(), 0);
        assert_eq!(tab.holder(), None);
        assert_eq!(a.transport().signaling_state(), SignalingState::Closed);
        assert!(state.try_iter().any(|s| s == ConnectionState::Failed));
        assert!(matches!(
            a.create_offer(Some(&mic)),
            Err(CommsError::InvalidTransition { .. })
        ));

        a.reset(Box::new(LoopbackTransport::new(&network, 4_800)));
        assert_eq!(a.negotiation_state(), NegotiationState::Idle);
        assert!(a.transport().local_description().is_none());
    }

    #[test]
    fn answer_that_cannot_be_sent_parks_in_failed_until_reset() {
        let mut pair = pair_with(|t| t);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        let Pair { a, mut b, mic_b, .. } = pair;
        drop(a);

        assert!(matches!(
            b.process_signals(Some(&mic_b)),
            Err(CommsError::Relay)
        ));
        assert_eq!(b.negotiation_state(), NegotiationState::Failed);
        assert!(b.track_controls().is_empty());
        assert_eq!(b.pool().open_count(), 0);
        assert_eq!(mic_b.reader_count(), 0);
        assert_eq!(b.transport().signaling_state(), SignalingState::Closed);
        assert!(matches!(
            b.create_offer(Some(&mic_b)),
            Err(CommsError::InvalidTransition { .. })
        ));

        b.reset(Box::new(LoopbackTransport::new(&LoopbackNetwork::new(), 4_800)));
        assert_eq!(b.negotiation_state(), NegotiationState::Idle);
        assert!(b.transport().remote_description().is_none());
    }

    #[test]
    fn late_candidate_after_teardown_is_discarded() {
        let mut pair = pair_with(|t| t);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        exchange(&mut pair);
        pair.a.teardown();

        let late = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
        };
        let outcome = pair
            .a
            .handle_signal(SignalEnvelope::new(SignalPayload::IceCandidate(Some(late))), None)
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded);
        assert_eq!(pair.a.negotiation_state(), NegotiationState::Closed);
    }

    #[test]
    fn second_manager_in_tab_is_refused() {
        let network = LoopbackNetwork::new();
        let tab = TabSlot::new();
        let (relay_a, _peer_a) = relay_pair();
        let (relay_b, _peer_b) = relay_pair();
        let mut first = manager(&network, relay_a, |t| t).with_tab_slot(tab.clone());
        let mut second = manager(&network, relay_b, |t| t).with_tab_slot(tab.clone());
        let mic = AudioTrack::new("microphone", 4_800);

        first.create_offer(Some(&mic)).unwrap();
        assert!(matches!(
            second.create_offer(Some(&mic)),
            Err(CommsError::ConnectionActive)
        ));
        assert!(second.transport().local_description().is_none());
        first.teardown();
        second.create_offer(Some(&mic)).unwrap();
    }

    #[test]
    fn teardown_closes_every_context() {
        let mut pair = pair_with(|t| t);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        exchange(&mut pair);
        assert_eq!(pair.a.pool().open_count(), 3);

        pair.a.teardown();
        assert_eq!(pair.a.pool().open_count(), 0);
        assert_eq!(pair.a.connection_state(), ConnectionState::Closed);
        assert_eq!(pair.mic_a.reader_count(), 0);
        assert!(pair.a.inbound().is_empty());
    }

    #[test]
    fn anonymous_tracks_use_arrival_order_and_reset_when_full() {
        let mut pair = pair_with(LoopbackTransport::with_anonymous_tracks);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        exchange(&mut pair);
        assert_eq!(pair.b.inbound().keys().copied().collect::<Vec<_>>(), [0, 1]);

        let stale = pair.b.inbound()[&0].track().clone();
        pair.b.on_track(AudioTrack::new("", 64)).unwrap();
        assert_eq!(pair.b.inbound().len(), 1);
        assert_ne!(pair.b.inbound()[&0].track(), &stale);
    }

    #[test]
    fn monitoring_and_transmit_controls_validate_channel() {
        let mut pair = pair_with(|t| t);
        pair.a.create_offer(Some(&pair.mic_a)).unwrap();
        exchange(&mut pair);

        pair.a.set_transmitting(1, true).unwrap();
        assert!(pair.a.track_controls()[&1].is_transmitting());
        assert!(!pair.a.track_controls()[&0].is_transmitting());
        pair.a.mute_all();
        assert!(!pair.a.track_controls()[&1].is_transmitting());

        pair.a.set_monitoring(0, false).unwrap();
        assert!(!pair.a.is_monitoring(0));
        assert!(pair.a.is_monitoring(1));
        assert!(matches!(
            pair.a.set_monitoring(5, true),
            Err(CommsError::UnknownChannel(5))
        ));
        assert!(pair.a.play_clip(7, vec![0.0f32; 4].into()).is_err());
    }
}
