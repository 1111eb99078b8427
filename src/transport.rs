//! Peer transport seam: the operations the peer manager needs from a WebRTC-style connection.

use std::fmt;

use crate::CommsError;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::track::AudioTrack;

/// Offer/answer progress of the transport itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    /// No negotiation in progress.
    Stable,
    /// A local offer is applied.
    HaveLocalOffer,
    /// A remote offer is applied.
    HaveRemoteOffer,
    /// Closed for good.
    Closed,
}

/// Connection state, surfaced verbatim to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet connecting.
    New,
    /// Candidates are being checked.
    Connecting,
    /// Media can flow.
    Connected,
    /// Connectivity was lost and may come back.
    Disconnected,
    /// Connectivity checks failed.
    Failed,
    /// Closed locally.
    Closed,
}

impl ConnectionState {
    /// Lowercase name as reported by browsers.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous notifications queued by a transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be sent to the remote side.
    IceCandidate(IceCandidate),
    /// A remote track became available.
    Track(AudioTrack),
    /// The connection state changed.
    ConnectionState(ConnectionState),
}

/// A WebRTC-style peer connection as seen by [`PeerConnectionManager`](crate::PeerConnectionManager).
pub trait PeerTransport: Send {
    /// Send `track` to the remote side on the next negotiated media section.
    fn add_track(&mut self, track: &AudioTrack) -> Result<(), CommsError>;

    /// Describe every added track in a new offer.
    fn create_offer(&mut self) -> Result<SessionDescription, CommsError>;

    /// Only valid while a remote offer is applied.
    fn create_answer(&mut self) -> Result<SessionDescription, CommsError>;

    /// Apply a description created by this transport.
    fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CommsError>;

    /// Apply the remote side's description.
    fn set_remote_description(&mut self, description: SessionDescription)
    -> Result<(), CommsError>;

    /// Candidates arriving before the remote description are queued by the transport.
    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CommsError>;

    /// Last applied local description.
    fn local_description(&self) -> Option<&SessionDescription>;

    /// Last applied remote description.
    fn remote_description(&self) -> Option<&SessionDescription>;

    /// Current offer/answer state.
    fn signaling_state(&self) -> SignalingState;

    /// Current connectivity.
    fn connection_state(&self) -> ConnectionState;

    /// Next queued event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Move whatever media is queued on local tracks to the remote side.
    fn pump_media(&mut self) {}

    /// Stop media and release the connection. Idempotent.
    fn close(&mut self);
}
