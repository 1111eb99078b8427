//! One participant's comms stack: capture, peer manager and the Tx/Rx activity monitors,
//! advanced one render quantum at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::{CaptureManager, CaptureState, MicrophoneBackend, MicrophoneControl, SyntheticMicrophone};
use crate::config::CommsConfig;
use crate::context::ContextPool;
use crate::graph::{ClipHandle, RadioMode};
use crate::loopback::{LoopbackNetwork, LoopbackTransport};
use crate::monitor::ActivityMonitor;
use crate::negotiation::NegotiationState;
use crate::peer::PeerConnectionManager;
use crate::signaling::{SignalingChannel, relay_pair};
use crate::track::{AudioTrack, TrackReader};
use crate::transport::{ConnectionState, PeerTransport};
use crate::vad::{VadEvent, VoiceActivityDetector};
use crate::{CommsError, init_tracing, push_log};

/// Per-channel state consumed by a control surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Inbound squelch gain is open.
    pub monitoring: bool,
    /// Outbound mute gain is open.
    pub transmitting: bool,
    /// Energy detected on the inbound track.
    pub receiving: bool,
}

/// Utterance boundary on the local microphone, stamped with the station's audio clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoiceEvent {
    /// Audio clock at the block that crossed the threshold.
    pub at: Duration,
    /// Start or stop.
    pub event: VadEvent,
}

const VOICE_EVENT_CAPACITY: usize = 256;

/// One participant's comms stack on a virtual audio clock.
pub struct Station {
    name: String,
    sample_rate: u32,
    render_quantum: usize,
    stream_count: usize,
    capture: CaptureManager,
    peer: PeerConnectionManager,
    tx_monitor: ActivityMonitor,
    rx_monitor: ActivityMonitor,
    vad: VoiceActivityDetector,
    vad_reader: Option<TrackReader>,
    vad_block: Vec<f32>,
    voice_events: Vec<VoiceEvent>,
    epoch: Instant,
    frames: u64,
    last_connection: ConnectionState,
}

impl Station {
    /// A station named `name` whose peer manager talks over `transport` and `signaling`.
    pub fn new(
        name: impl Into<String>,
        config: &CommsConfig,
        microphone: Box<dyn MicrophoneBackend>,
        transport: Box<dyn PeerTransport>,
        signaling: Box<dyn SignalingChannel>,
        mode: RadioMode,
    ) -> Self {
        let pool = ContextPool::new(config.sample_rate, config.render_quantum, config.max_contexts);
        let peer = PeerConnectionManager::new(config, pool, transport, signaling).with_radio_mode(mode);
        let last_connection = peer.connection_state();
        Self {
            name: name.into(),
            sample_rate: config.sample_rate,
            render_quantum: config.render_quantum,
            stream_count: config.stream_count,
            capture: CaptureManager::new(microphone, config.capture_poll_interval),
            peer,
            tx_monitor: ActivityMonitor::new(config),
            rx_monitor: ActivityMonitor::new(config),
            vad: VoiceActivityDetector::new(&config.vad, config.sample_rate),
            vad_reader: None,
            vad_block: vec![0.0; config.render_quantum.max(1)],
            voice_events: Vec::new(),
            epoch: Instant::now(),
            frames: 0,
            last_connection,
        }
    }

    /// Station name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channels negotiated in each direction.
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Audio clock: station start plus frames rendered so far.
    pub fn now(&self) -> Instant {
        self.epoch + self.elapsed()
    }

    /// Audio time rendered so far.
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.frames as f64 / self.sample_rate.max(1) as f64)
    }

    /// Microphone acquisition.
    pub fn capture(&self) -> &CaptureManager {
        &self.capture
    }

    /// Current microphone state.
    pub fn capture_state(&self) -> &CaptureState {
        self.capture.state()
    }

    /// The peer manager.
    pub fn peer(&self) -> &PeerConnectionManager {
        &self.peer
    }

    /// Mutable access to the peer manager.
    pub fn peer_mut(&mut self) -> &mut PeerConnectionManager {
        &mut self.peer
    }

    /// Forward a click or key press to the capture manager.
    pub fn notify_gesture(&mut self) {
        let now = self.now();
        if let CaptureState::Ready(_) = self.capture.notify_gesture(now) {
            push_log(format!("{}: microphone ready", self.name));
        }
    }

    /// Start a connection as the offering side once the microphone is ready.
    pub fn create_offer(&mut self) -> Result<(), CommsError> {
        let channels = self.peer.create_offer(self.capture.source())?.len();
        push_log(format!("{}: offer sent on {channels} channels", self.name));
        Ok(())
    }

    /// Advance by one render quantum: signaling, capture, outbound graphs, media transport,
    /// the listener mix and the activity monitors, in that order.
    pub fn pump(&mut self) -> Result<(), CommsError> {
        let now = self.now();
        self.capture.tick(now);
        self.peer.process_signals(self.capture.source())?;

        self.capture.render(self.render_quantum);
        self.detect_voice();
        self.peer.render_outbound()?;
        self.peer.pump_media()?;
        self.peer.render_inbound()?;

        self.tx_monitor.sync_tracks(&self.peer.outbound_tracks());
        self.rx_monitor.sync_tracks(&self.peer.inbound_tracks());
        self.tx_monitor.poll(now);
        self.rx_monitor.poll(now);

        let connection = self.peer.connection_state();
        if connection != self.last_connection {
            push_log(format!("{}: connection {connection}", self.name));
            self.last_connection = connection;
        }
        self.frames += self.render_quantum as u64;
        Ok(())
    }

    /// Run the voice activity detector over microphone audio rendered since the last call.
    fn detect_voice(&mut self) {
        if self.vad_reader.is_none() {
            self.vad_reader = self.capture.source().map(AudioTrack::subscribe);
        }
        let at = self.elapsed();
        let Some(reader) = self.vad_reader.as_mut() else {
            return;
        };
        loop {
            let read = reader.read(&mut self.vad_block);
            if read == 0 {
                break;
            }
            let Some(event) = self.vad.process(&self.vad_block[..read]) else {
                continue;
            };
            let label = match event {
                VadEvent::VoiceStart => "voice start",
                VadEvent::VoiceStop => "voice stop",
            };
            info!(station = %self.name, ?at, label, "voice activity");
            push_log(format!("{}: {label}", self.name));
            if self.voice_events.len() == VOICE_EVENT_CAPACITY {
                self.voice_events.remove(0);
            }
            self.voice_events.push(VoiceEvent { at, event });
        }
    }

    /// Whether the local microphone currently carries speech.
    pub fn is_speaking(&self) -> bool {
        self.vad.is_speaking()
    }

    /// Utterance boundaries detected since the previous call, oldest first.
    pub fn take_voice_events(&mut self) -> Vec<VoiceEvent> {
        std::mem::take(&mut self.voice_events)
    }

    /// Pump until at least `duration` of audio has been rendered.
    pub fn advance(&mut self, duration: Duration) -> Result<(), CommsError> {
        let target = self.elapsed() + duration;
        while self.elapsed() < target {
            self.pump()?;
        }
        Ok(())
    }

    /// Push-to-talk pressed on `channel`.
    pub fn begin_transmit(&mut self, channel: usize) -> Result<(), CommsError> {
        self.peer.set_transmitting(channel, true)?;
        debug!(station = %self.name, channel, "transmit");
        Ok(())
    }

    /// Push-to-talk released: every channel is muted.
    pub fn end_transmit(&mut self) {
        self.peer.mute_all();
    }

    /// Open or close the squelch gain of inbound `channel`.
    pub fn set_monitoring(&mut self, channel: usize, monitoring: bool) -> Result<(), CommsError> {
        self.peer.set_monitoring(channel, monitoring)
    }

    /// Queue `clip` on outbound `channel`.
    pub fn play_clip(&mut self, channel: usize, clip: Arc<[f32]>) -> Result<ClipHandle, CommsError> {
        self.peer.play_clip(channel, clip)
    }

    /// Threshold for both activity monitors.
    pub fn set_monitor_threshold(&mut self, threshold: f32) {
        self.tx_monitor.set_threshold(threshold);
        self.rx_monitor.set_threshold(threshold);
    }

    /// Outbound ("Tx") activity per channel.
    pub fn tx_activity(&self) -> &BTreeMap<usize, bool> {
        self.tx_monitor.activity()
    }

    /// Inbound ("Rx") activity per channel.
    pub fn rx_activity(&self) -> &BTreeMap<usize, bool> {
        self.rx_monitor.activity()
    }

    /// Channel states for a control surface.
    pub fn snapshot(&self) -> BTreeMap<usize, ChannelStatus> {
        (0..self.stream_count)
            .map(|channel| {
                let status = ChannelStatus {
                    monitoring: self.peer.is_monitoring(channel),
                    transmitting: self
                        .peer
                        .track_controls()
                        .get(&channel)
                        .is_some_and(|control| control.is_transmitting()),
                    receiving: self.rx_monitor.is_active(channel),
                };
                (channel, status)
            })
            .collect()
    }

    /// Connection state of the peer manager.
    pub fn connection_state(&self) -> ConnectionState {
        self.peer.connection_state()
    }

    /// Negotiation state of the peer manager.
    pub fn negotiation_state(&self) -> NegotiationState {
        self.peer.negotiation_state()
    }

    /// Close the connection and disconnect every analyser.
    pub fn teardown(&mut self) {
        self.peer.teardown();
        self.tx_monitor.teardown();
        self.rx_monitor.teardown();
        push_log(format!("{}: torn down", self.name));
    }

    /// Tear down and start over on `transport`. The microphone grant is kept.
    pub fn reset(&mut self, transport: Box<dyn PeerTransport>) {
        self.peer.reset(transport);
        self.tx_monitor.teardown();
        self.rx_monitor.teardown();
        self.last_connection = self.peer.connection_state();
        push_log(format!("{}: reset", self.name));
    }
}

/// An experimenter and a participant wired together in-process.
pub struct LoopbackSession {
    /// Offering side, rendering speech clean.
    pub experimenter: Station,
    /// Answering side, rendering speech through the radio strip.
    pub participant: Station,
    /// Steers the experimenter's microphone.
    pub experimenter_mic: MicrophoneControl,
    /// Steers the participant's microphone.
    pub participant_mic: MicrophoneControl,
    /// Network both transports are registered on.
    pub network: LoopbackNetwork,
    capacity_frames: usize,
}

impl LoopbackSession {
    /// Both stations start without microphone access; call [`Station::notify_gesture`]
    /// on each before negotiating.
    pub fn new(config: &CommsConfig) -> Self {
        init_tracing();
        let network = LoopbackNetwork::new();
        let (relay_experimenter, relay_participant) = relay_pair();
        let capacity = config.track_capacity_frames();

        let experimenter_backend = SyntheticMicrophone::new(capacity);
        let participant_backend = SyntheticMicrophone::new(capacity);
        let experimenter_mic = experimenter_backend.control();
        let participant_mic = participant_backend.control();

        let experimenter = Station::new(
            "experimenter",
            config,
            Box::new(experimenter_backend),
            Box::new(LoopbackTransport::new(&network, capacity)),
            Box::new(relay_experimenter),
            RadioMode::Clean,
        );
        let participant = Station::new(
            "participant",
            config,
            Box::new(participant_backend),
            Box::new(LoopbackTransport::new(&network, capacity)),
            Box::new(relay_participant),
            RadioMode::Band,
        );
        info!(channels = config.stream_count, "loopback session created");
        Self {
            experimenter,
            participant,
            experimenter_mic,
            participant_mic,
            network,
            capacity_frames: capacity,
        }
    }

    /// Advance both stations by one quantum each.
    pub fn pump(&mut self) -> Result<(), CommsError> {
        self.experimenter.pump()?;
        self.participant.pump()
    }

    /// Pump both stations until `duration` of audio has been rendered.
    pub fn advance(&mut self, duration: Duration) -> Result<(), CommsError> {
        let target = self.experimenter.elapsed() + duration;
        while self.experimenter.elapsed() < target {
            self.pump()?;
        }
        Ok(())
    }

    /// Reset both stations onto fresh transports on the same network.
    pub fn reset(&mut self) {
        let experimenter = LoopbackTransport::new(&self.network, self.capacity_frames);
        let participant = LoopbackTransport::new(&self.network, self.capacity_frames);
        self.experimenter.reset(Box::new(experimenter));
        self.participant.reset(Box::new(participant));
    }

    /// Grant both microphones, offer from the experimenter and pump until both sides are
    /// connected or `timeout` of audio time has passed.
    pub fn connect(&mut self, timeout: Duration) -> Result<bool, CommsError> {
        self.experimenter.notify_gesture();
        self.participant.notify_gesture();
        self.experimenter.create_offer()?;
        let deadline = self.experimenter.elapsed() + timeout;
        while self.experimenter.elapsed() < deadline {
            self.pump()?;
            if self.experimenter.connection_state() == ConnectionState::Connected
                && self.participant.connection_state() == ConnectionState::Connected
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
