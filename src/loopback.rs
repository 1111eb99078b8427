//! In-process [`PeerTransport`] pair: real offer/answer/ICE state handling, media copied
//! between tracks instead of sent over the network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::CommsError;
use crate::sdp::{self, Direction, MediaSection};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::track::{AudioTrack, TrackReader};
use crate::transport::{ConnectionState, PeerTransport, SignalingState, TransportEvent};

const CANDIDATE_ADDRESS: &str = "loopback";

/// Inbound tracks of one transport, keyed by media section id.
#[derive(Default)]
struct Endpoint {
    receivers: Mutex<BTreeMap<String, AudioTrack>>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<u64, Weak<Endpoint>>>,
    next_id: AtomicU64,
}

/// Address space in which loopback transports find each other through ICE candidates.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, endpoint: &Arc<Endpoint>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .endpoints
            .lock()
            .insert(id, Arc::downgrade(endpoint));
        id
    }

    fn resolve(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.lock().get(&id).and_then(Weak::upgrade)
    }

    fn unregister(&self, id: u64) {
        self.inner.endpoints.lock().remove(&id);
    }

    /// Transports currently reachable.
    pub fn endpoint_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .values()
            .filter(|endpoint| endpoint.strong_count() > 0)
            .count()
    }
}

/// Remote-controlled path failure for a transport that has already been boxed away.
#[derive(Clone, Debug, Default)]
pub struct LinkControl {
    severed: Arc<AtomicBool>,
}

impl LinkControl {
    /// Break the path; the transport reports `failed` on its next media pump.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Release);
    }

    /// Whether [`sever`](Self::sever) was called.
    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }
}

struct OutboundSender {
    track: AudioTrack,
    reader: TrackReader,
    mid: Option<String>,
}

/// In-process [`PeerTransport`] that exchanges media with another endpoint of the same
/// [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    endpoint: Arc<Endpoint>,
    endpoint_id: u64,
    stream_id: String,
    capacity_frames: usize,
    senders: Vec<OutboundSender>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: SignalingState,
    connection: ConnectionState,
    remote_endpoint: Option<Weak<Endpoint>>,
    pending_candidates: Vec<IceCandidate>,
    gathered: bool,
    events: VecDeque<TransportEvent>,
    reversed_track_order: bool,
    anonymous_tracks: bool,
    link: LinkControl,
    scratch: Vec<f32>,
}

impl LoopbackTransport {
    /// New transport on `network`; inbound tracks buffer up to `capacity_frames`.
    pub fn new(network: &LoopbackNetwork, capacity_frames: usize) -> Self {
        let endpoint = Arc::new(Endpoint::default());
        let endpoint_id = network.register(&endpoint);
        Self {
            network: network.clone(),
            endpoint,
            endpoint_id,
            stream_id: format!("stream-{endpoint_id}"),
            capacity_frames,
            senders: Vec::new(),
            local: None,
            remote: None,
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            remote_endpoint: None,
            pending_candidates: Vec::new(),
            gathered: false,
            events: VecDeque::new(),
            reversed_track_order: false,
            anonymous_tracks: false,
            link: LinkControl::default(),
            scratch: vec![0.0; capacity_frames.max(1)],
        }
    }

    /// Announce remote tracks in reverse section order.
    pub fn with_reversed_track_order(mut self) -> Self {
        self.reversed_track_order = true;
        self
    }

    /// Strip application labels from remote tracks, leaving arrival order as the only cue.
    pub fn with_anonymous_tracks(mut self) -> Self {
        self.anonymous_tracks = true;
        self
    }

    /// Network address of this endpoint, as advertised in its ICE candidates.
    pub fn endpoint_id(&self) -> u64 {
        self.endpoint_id
    }

    /// Local tracks currently attached.
    pub fn sender_tracks(&self) -> Vec<AudioTrack> {
        self.senders.iter().map(|s| s.track.clone()).collect()
    }

    /// Handle for failing the path to the remote peer, as an ICE consent failure would.
    pub fn link_control(&self) -> LinkControl {
        self.link.clone()
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 {CANDIDATE_ADDRESS} {} typ host",
                self.endpoint_id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        debug!(endpoint = self.endpoint_id, from = %self.connection, to = %state, "connection state");
        self.connection = state;
        self.events.push_back(TransportEvent::ConnectionState(state));
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), CommsError> {
        if self.signaling == SignalingState::Closed {
            return Err(CommsError::InvalidSignalingState {
                operation,
                state: self.signaling,
            });
        }
        Ok(())
    }

    fn update_connection(&mut self) {
        if matches!(
            self.connection,
            ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Closed
        ) {
            return;
        }
        let negotiated = self.local.is_some()
            && self.remote.is_some()
            && self.signaling == SignalingState::Stable;
        if !negotiated {
            return;
        }
        self.set_connection(ConnectionState::Connecting);
        if self
            .remote_endpoint
            .as_ref()
            .is_some_and(|endpoint| endpoint.strong_count() > 0)
        {
            info!(endpoint = self.endpoint_id, "loopback transport connected");
            self.set_connection(ConnectionState::Connected);
        }
    }

    fn apply_candidate(&mut self, candidate: &IceCandidate) -> Result<(), CommsError> {
        let fields: Vec<&str> = candidate.candidate.split_whitespace().collect();
        if fields.len() < 8 || !fields[0].starts_with("candidate:") {
            return Err(CommsError::Sdp(format!(
                "malformed candidate '{}'",
                candidate.candidate
            )));
        }
        if fields[4] != CANDIDATE_ADDRESS {
            debug!(candidate = %candidate.candidate, "unreachable candidate ignored");
            return Ok(());
        }
        let peer = fields[5]
            .parse::<u64>()
            .ok()
            .and_then(|id| self.network.resolve(id));
        match peer {
            Some(endpoint) => {
                self.remote_endpoint = Some(Arc::downgrade(&endpoint));
                self.update_connection();
            }
            None => warn!(candidate = %candidate.candidate, "candidate names no live endpoint"),
        }
        Ok(())
    }

    fn announce_remote_tracks(&mut self, sections: &[MediaSection]) {
        let mut announced = Vec::new();
        {
            let mut receivers = self.endpoint.receivers.lock();
            for section in sections {
                let Some(label) = &section.track_label else {
                    continue;
                };
                if matches!(section.direction, Direction::RecvOnly | Direction::Inactive) {
                    continue;
                }
                let label = if self.anonymous_tracks { "" } else { label.as_str() };
                let track = AudioTrack::new(label, self.capacity_frames);
                if let Some(previous) = receivers.insert(section.mid.clone(), track.clone()) {
                    previous.stop();
                }
                announced.push(track);
            }
        }
        if self.reversed_track_order {
            announced.reverse();
        }
        for track in announced {
            debug!(endpoint = self.endpoint_id, label = track.label(), "remote track");
            self.events.push_back(TransportEvent::Track(track));
        }
    }
}

impl PeerTransport for LoopbackTransport {
    fn add_track(&mut self, track: &AudioTrack) -> Result<(), CommsError> {
        self.ensure_open("add_track")?;
        self.senders.push(OutboundSender {
            reader: track.subscribe(),
            track: track.clone(),
            mid: None,
        });
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, CommsError> {
        self.ensure_open("create_offer")?;
        let sections: Vec<MediaSection> = self
            .senders
            .iter_mut()
            .enumerate()
            .map(|(index, sender)| {
                let mid = sender.mid.get_or_insert_with(|| index.to_string()).clone();
                MediaSection::new(mid, Direction::SendRecv, Some(sender.track.label().to_string()))
            })
            .collect();
        Ok(SessionDescription::offer(sdp::build_description(
            self.endpoint_id,
            &self.stream_id,
            &sections,
        )))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, CommsError> {
        if self.signaling != SignalingState::HaveRemoteOffer {
            return Err(CommsError::InvalidSignalingState {
                operation: "create_answer",
                state: self.signaling,
            });
        }
        let offered = match &self.remote {
            Some(remote) => sdp::parse_media_sections(&remote.sdp)?,
            None => Vec::new(),
        };
        let sections: Vec<MediaSection> = offered
            .iter()
            .enumerate()
            .map(|(index, offered)| match self.senders.get_mut(index) {
                Some(sender) => {
                    sender.mid = Some(offered.mid.clone());
                    MediaSection::new(
                        offered.mid.clone(),
                        Direction::SendRecv,
                        Some(sender.track.label().to_string()),
                    )
                }
                None => MediaSection::new(offered.mid.clone(), Direction::RecvOnly, None),
            })
            .collect();
        Ok(SessionDescription::answer(sdp::build_description(
            self.endpoint_id,
            &self.stream_id,
            &sections,
        )))
    }

    fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CommsError> {
        let next = match (description.kind, self.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, state) => {
                return Err(CommsError::InvalidSignalingState {
                    operation: "set_local_description",
                    state,
                });
            }
        };
        sdp::parse_media_sections(&description.sdp)?;
        self.signaling = next;
        self.local = Some(description);
        if !self.gathered {
            self.gathered = true;
            let candidate = self.local_candidate();
            self.events.push_back(TransportEvent::IceCandidate(candidate));
        }
        self.update_connection();
        Ok(())
    }

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), CommsError> {
        let next = match (description.kind, self.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, state) => {
                return Err(CommsError::InvalidSignalingState {
                    operation: "set_remote_description",
                    state,
                });
            }
        };
        let sections = sdp::parse_media_sections(&description.sdp)?;
        self.signaling = next;
        self.remote = Some(description);
        self.announce_remote_tracks(&sections);

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.apply_candidate(&candidate) {
                warn!(%err, "queued candidate rejected");
            }
        }
        self.update_connection();
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CommsError> {
        self.ensure_open("add_ice_candidate")?;
        if self.remote.is_none() {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.apply_candidate(&candidate)
    }

    fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn pump_media(&mut self) {
        if self.link.is_severed()
            && matches!(
                self.connection,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            warn!(endpoint = self.endpoint_id, "loopback path severed");
            self.remote_endpoint = None;
            self.set_connection(ConnectionState::Failed);
        }
        let remote = match self.connection {
            ConnectionState::Connected => self.remote_endpoint.as_ref().and_then(Weak::upgrade),
            _ => None,
        };
        if self.connection == ConnectionState::Connected && remote.is_none() {
            self.set_connection(ConnectionState::Disconnected);
        }

        let receivers = remote.as_ref().map(|endpoint| endpoint.receivers.lock());
        for sender in self.senders.iter_mut() {
            let target = match (&receivers, &sender.mid) {
                (Some(receivers), Some(mid)) => receivers.get(mid),
                _ => None,
            };
            loop {
                let read = sender.reader.read(&mut self.scratch);
                if read == 0 {
                    break;
                }
                if let Some(track) = target {
                    track.write(&self.scratch[..read]);
                }
            }
        }
    }

    fn close(&mut self) {
        if self.signaling == SignalingState::Closed {
            return;
        }
        self.signaling = SignalingState::Closed;
        self.connection = ConnectionState::Closed;
        self.senders.clear();
        self.pending_candidates.clear();
        self.remote_endpoint = None;
        for (_, track) in std::mem::take(&mut *self.endpoint.receivers.lock()) {
            track.stop();
        }
        self.network.unregister(self.endpoint_id);
        debug!(endpoint = self.endpoint_id, "loopback transport closed");
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}
