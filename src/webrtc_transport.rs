//! [`PeerTransport`] over a real `RTCPeerConnection`: one Opus track per channel, trickle
//! ICE, connection state forwarded from the peer connection callbacks.
//!
//! The peer connection is asynchronous; this transport owns a small runtime and blocks on
//! it, so the peer manager keeps its synchronous, render-quantum driven shape. Callbacks
//! never touch manager state directly: they queue [`TransportEvent`]s that the manager
//! drains through [`poll_event`](PeerTransport::poll_event).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::CommsError;
use crate::config::{CodecTuning, CommsConfig};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::track::{AudioTrack, TrackReader};
use crate::transport::{ConnectionState, PeerTransport, SignalingState, TransportEvent};

const OPUS_SAMPLE_RATE: u32 = 48_000;
/// 20 ms at 48 kHz.
const OPUS_FRAME: usize = 960;
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_PACKET: usize = 4_000;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl From<webrtc::Error> for CommsError {
    fn from(err: webrtc::Error) -> Self {
        CommsError::Transport(err.to_string())
    }
}

impl From<opus::Error> for CommsError {
    fn from(err: opus::Error) -> Self {
        CommsError::Transport(format!("opus: {err}"))
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_owned(),
        clock_rate: OPUS_SAMPLE_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Local channel track: microphone-graph output encoded to Opus in 20 ms packets.
struct OpusSender {
    reader: TrackReader,
    track: Arc<TrackLocalStaticSample>,
    encoder: opus::Encoder,
    pending: Vec<f32>,
    packet: Vec<u8>,
}

impl OpusSender {
    fn new(source: &AudioTrack, stream_id: &str, tuning: &CodecTuning) -> Result<Self, CommsError> {
        let mut encoder =
            opus::Encoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(tuning.max_average_bitrate as i32))?;
        encoder.set_inband_fec(tuning.inband_fec)?;
        Ok(Self {
            reader: source.subscribe(),
            track: Arc::new(TrackLocalStaticSample::new(
                opus_capability(),
                source.label().to_owned(),
                stream_id.to_owned(),
            )),
            encoder,
            pending: Vec::with_capacity(OPUS_FRAME * 4),
            packet: vec![0; MAX_PACKET],
        })
    }

    /// Encode every complete frame queued on the source.
    fn encode_ready(&mut self, scratch: &mut [f32]) -> Result<Vec<Bytes>, CommsError> {
        loop {
            let read = self.reader.read(scratch);
            if read == 0 {
                break;
            }
            self.pending.extend_from_slice(&scratch[..read]);
        }
        let mut packets = Vec::new();
        while self.pending.len() >= OPUS_FRAME {
            let written = self.encoder.encode_float(&self.pending[..OPUS_FRAME], &mut self.packet)?;
            packets.push(Bytes::copy_from_slice(&self.packet[..written]));
            self.pending.drain(..OPUS_FRAME);
        }
        Ok(packets)
    }
}

/// Receive loop for one remote track: decode every RTP payload into `sink` until the
/// track ends.
async fn receive_track(remote: Arc<TrackRemote>, sink: AudioTrack) {
    let mut decoder = match opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono) {
        Ok(decoder) => decoder,
        Err(err) => {
            warn!(%err, label = sink.label(), "opus decoder unavailable");
            sink.stop();
            return;
        }
    };
    let mut pcm = vec![0.0f32; OPUS_FRAME * 6];
    loop {
        let packet = match remote.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(err) => {
                debug!(%err, label = sink.label(), "remote track ended");
                break;
            }
        };
        if packet.payload.is_empty() {
            continue;
        }
        match decoder.decode_float(&packet.payload, &mut pcm, false) {
            Ok(frames) => sink.write(&pcm[..frames]),
            Err(err) => warn!(%err, label = sink.label(), "opus packet dropped"),
        }
    }
    sink.stop();
}

/// Peer transport backed by a WebRTC peer connection.
pub struct WebRtcTransport {
    runtime: Runtime,
    pc: Arc<RTCPeerConnection>,
    events: Receiver<TransportEvent>,
    connection: Arc<Mutex<ConnectionState>>,
    stream_id: String,
    codec: CodecTuning,
    senders: Vec<OpusSender>,
    scratch: Vec<f32>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    closed: bool,
}

impl WebRtcTransport {
    /// Open a peer connection using the ICE servers and codec tuning of `config`.
    pub fn new(config: &CommsConfig) -> Result<Self, CommsError> {
        if config.sample_rate != OPUS_SAMPLE_RATE {
            return Err(CommsError::Transport(format!(
                "sample rate {} is not supported, expected {OPUS_SAMPLE_RATE}",
                config.sample_rate
            )));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("radio-comms-rtc")
            .enable_all()
            .build()
            .map_err(|err| CommsError::Transport(err.to_string()))?;

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = runtime.block_on(async {
            let mut media = MediaEngine::default();
            media.register_default_codecs()?;
            let registry = register_default_interceptors(Registry::new(), &mut media)?;
            let mut settings = SettingEngine::default();
            // lets two peers on one host connect without any other interface
            settings.set_include_loopback_candidate(true);
            let api = APIBuilder::new()
                .with_media_engine(media)
                .with_interceptor_registry(registry)
                .with_setting_engine(settings)
                .build();
            let pc = api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await?;
            Ok::<_, webrtc::Error>(Arc::new(pc))
        })?;

        let (event_tx, events) = unbounded();
        let connection = Arc::new(Mutex::new(ConnectionState::New));
        register_callbacks(&pc, &event_tx, &connection, config.track_capacity_frames());
        let stream_id = format!("radio-comms-{}", NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));
        info!(stream = %stream_id, "webrtc transport created");

        Ok(Self {
            runtime,
            pc,
            events,
            connection,
            stream_id,
            codec: config.codec.clone(),
            senders: Vec::new(),
            scratch: vec![0.0; OPUS_FRAME],
            local: None,
            remote: None,
            pending_candidates: Vec::new(),
            closed: false,
        })
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), CommsError> {
        if self.closed {
            return Err(CommsError::InvalidSignalingState {
                operation,
                state: SignalingState::Closed,
            });
        }
        Ok(())
    }

    fn rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, CommsError> {
        let sdp = description.sdp.clone();
        Ok(match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        })
    }

    fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), CommsError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.runtime.block_on(self.pc.add_ice_candidate(init))?;
        Ok(())
    }
}

fn register_callbacks(
    pc: &RTCPeerConnection,
    events: &Sender<TransportEvent>,
    connection: &Arc<Mutex<ConnectionState>>,
    capacity_frames: usize,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => warn!(%err, "local candidate not serialisable"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |remote: Arc<TrackRemote>, _, _| {
        let sink = AudioTrack::new(remote.id(), capacity_frames);
        debug!(label = sink.label(), "remote track");
        let _ = tx.send(TransportEvent::Track(sink.clone()));
        tokio::spawn(receive_track(remote, sink));
        Box::pin(async {})
    }));

    let tx = events.clone();
    let connection = connection.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(state) = connection_state(state) {
            *connection.lock() = state;
            let _ = tx.send(TransportEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));
}

impl PeerTransport for WebRtcTransport {
    fn add_track(&mut self, track: &AudioTrack) -> Result<(), CommsError> {
        self.ensure_open("add_track")?;
        let sender = OpusSender::new(track, &self.stream_id, &self.codec)?;
        let local: Arc<dyn TrackLocal + Send + Sync> = sender.track.clone();
        let rtp_sender = self.runtime.block_on(self.pc.add_track(local))?;
        // RTCP has to be drained for the interceptors to run
        self.runtime.spawn(async move {
            let mut buffer = vec![0u8; 1_500];
            while rtp_sender.read(&mut buffer).await.is_ok() {}
        });
        self.senders.push(sender);
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, CommsError> {
        self.ensure_open("create_offer")?;
        let offer = self.runtime.block_on(self.pc.create_offer(None))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, CommsError> {
        self.ensure_open("create_answer")?;
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(CommsError::InvalidSignalingState {
                operation: "create_answer",
                state: self.signaling_state(),
            });
        }
        let answer = self.runtime.block_on(self.pc.create_answer(None))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CommsError> {
        self.ensure_open("set_local_description")?;
        let rtc = Self::rtc_description(&description)?;
        self.runtime.block_on(self.pc.set_local_description(rtc))?;
        self.local = Some(description);
        Ok(())
    }

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), CommsError> {
        self.ensure_open("set_remote_description")?;
        let rtc = Self::rtc_description(&description)?;
        self.runtime.block_on(self.pc.set_remote_description(rtc))?;
        self.remote = Some(description);
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.apply_candidate(candidate) {
                warn!(%err, "queued candidate rejected");
            }
        }
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CommsError> {
        self.ensure_open("add_ice_candidate")?;
        if self.remote.is_none() {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate)
    }

    fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    fn signaling_state(&self) -> SignalingState {
        if self.closed {
            return SignalingState::Closed;
        }
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    fn pump_media(&mut self) {
        for sender in self.senders.iter_mut() {
            let packets = match sender.encode_ready(&mut self.scratch) {
                Ok(packets) => packets,
                Err(err) => {
                    warn!(%err, "opus encode failed");
                    continue;
                }
            };
            for data in packets {
                let sample = Sample {
                    data,
                    duration: OPUS_FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(err) = self.runtime.block_on(sender.track.write_sample(&sample)) {
                    debug!(%err, "sample not sent");
                }
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.senders.clear();
        self.pending_candidates.clear();
        if let Err(err) = self.runtime.block_on(self.pc.close()) {
            warn!(%err, "peer connection close failed");
        }
        *self.connection.lock() = ConnectionState::Closed;
        info!(stream = %self.stream_id, "webrtc transport closed");
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        self.close();
    }
}
