//! Signaling wire protocol and the in-process relay that carries it.
//!
//! Every message is the JSON envelope
//! `{ "event": "webrtc", "payload": { "event": "offer" | "answer" | "ice-candidate", "data": … } }`.

use std::fmt;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::CommsError;

/// Event name both endpoints subscribe to.
pub const SIGNALING_EVENT: &str = "webrtc";

/// Which half of the exchange a description is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initiates a negotiation.
    Offer,
    /// Completes a negotiation.
    Answer,
}

/// Session description in the shape browsers serialise it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// Session description text.
    pub sdp: String,
}

impl SessionDescription {
    /// An offer carrying `sdp`.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer carrying `sdp`.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line without the `a=` prefix.
    pub candidate: String,
    /// Media section the candidate belongs to, by `mid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media section the candidate belongs to, by position.
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation message, dispatched on its `event` tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Remote offer.
    Offer(SessionDescription),
    /// Remote answer; `None` is discarded.
    Answer(Option<SessionDescription>),
    /// Trickled candidate; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
}

impl SignalPayload {
    /// Event name carried on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// What crosses the relay: an event name plus its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Event name, `webrtc` for everything this crate sends.
    pub event: String,
    /// Decoded payload.
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    /// Wrap `payload` under the `webrtc` event.
    pub fn new(payload: SignalPayload) -> Self {
        Self {
            event: SIGNALING_EVENT.to_string(),
            payload,
        }
    }

    /// Whether this envelope belongs to peer negotiation.
    pub fn is_webrtc(&self) -> bool {
        self.event == SIGNALING_EVENT
    }

    /// Encode for the relay.
    pub fn to_json(&self) -> Result<String, CommsError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a relay message.
    pub fn from_json(text: &str) -> Result<Self, CommsError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl fmt::Display for SignalEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event, self.payload.kind())
    }
}

/// Ordered, two-party message channel.
pub trait SignalingChannel: Send {
    /// Queue `envelope` for the remote side.
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), CommsError>;

    /// Next pending envelope, or `None` when nothing is queued.
    fn try_recv(&self) -> Result<Option<SignalEnvelope>, CommsError>;
}

/// One end of an in-process relay scoped to exactly two participants.
pub struct RelayEndpoint {
    tx: Sender<String>,
    rx: Receiver<String>,
}

/// Create both ends of a relay.
pub fn relay_pair() -> (RelayEndpoint, RelayEndpoint) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (
        RelayEndpoint { tx: a_tx, rx: a_rx },
        RelayEndpoint { tx: b_tx, rx: b_rx },
    )
}

impl RelayEndpoint {
    /// Send raw text, as a misbehaving or foreign client might.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), CommsError> {
        self.tx.send(text.into()).map_err(|_| CommsError::Relay)
    }

    /// Messages waiting to be received on this end.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl SignalingChannel for RelayEndpoint {
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), CommsError> {
        trace!(%envelope, "relay send");
        self.send_text(envelope.to_json()?)
    }

    fn try_recv(&self) -> Result<Option<SignalEnvelope>, CommsError> {
        match self.rx.try_recv() {
            Ok(text) => SignalEnvelope::from_json(&text).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CommsError::Relay),
        }
    }
}
