#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! Real-time multi-channel radio comms core for ATC training sessions.
//!
//! A [`PeerConnectionManager`](peer::PeerConnectionManager) negotiates N symmetric audio
//! channels over one peer transport. Each outbound channel gets its own audio context with
//! a mute gain in front of the shared microphone; each inbound channel runs through a radio
//! emulation strip and is placed at a fixed point around the listener. Activity monitors
//! turn track energy into per-channel booleans for indicators and control surfaces.
//!
//! Audio moves between stages through per-reader [`SharedRingBuffer`](ring::SharedRingBuffer)
//! instances, so the render path never blocks on control code.

use std::collections::VecDeque;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub mod capture;
pub mod config;
pub mod context;
/// Developer-facing control surface and console.
pub mod control;
pub mod dsp;
pub mod graph;
pub mod loopback;
pub mod monitor;
pub mod negotiation;
pub mod peer;
pub mod ring;
pub mod sdp;
pub mod signaling;
pub mod spatial;
pub mod station;
pub mod tone;
pub mod track;
pub mod transport;
pub mod vad;
#[cfg(feature = "webrtc")]
pub mod webrtc_transport;

#[cfg(test)]
mod tests;

pub use config::CommsConfig;
pub use negotiation::{NegotiationEvent, NegotiationState};
pub use peer::{PeerConnectionManager, SignalOutcome, TabSlot};
pub use station::{ChannelStatus, LoopbackSession, Station};
pub use transport::{ConnectionState, PeerTransport, SignalingState};

const LOG_CAPACITY: usize = 256;

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)));
static TRACING_INIT: Once = Once::new();

/// Install the fmt subscriber once per process. Later calls are no-ops, and an already
/// installed global subscriber is left in place.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Append an operator-facing line to the in-memory log ring.
pub fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// The newest `count` lines, oldest first.
pub fn recent_logs(count: usize) -> Vec<String> {
    let guard = LOG_BUFFER.lock();
    let skip = guard.len().saturating_sub(count);
    guard.iter().skip(skip).cloned().collect()
}

/// Pop the oldest log line.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug)]
pub enum CommsError {
    /// No microphone track yet, typically because the user has not interacted with the page.
    #[error("local capture unavailable: the user has not interacted with the page yet")]
    CaptureUnavailable,
    /// The microphone was refused for the rest of the session.
    #[error("microphone access denied: {0}")]
    CaptureDenied(String),
    /// A negotiation is already in flight.
    #[error("a negotiation is already pending")]
    NegotiationPending,
    /// The negotiation state machine refused an event.
    #[error("negotiation event {event:?} is invalid in state {from}")]
    InvalidTransition {
        /// State the event was applied to.
        from: NegotiationState,
        /// The refused event.
        event: NegotiationEvent,
    },
    /// The transport cannot run an operation in its signaling state.
    #[error("{operation} is invalid in signaling state {state:?}")]
    InvalidSignalingState {
        /// Transport operation that was attempted.
        operation: &'static str,
        /// Signaling state at the time.
        state: SignalingState,
    },
    /// Another peer manager of this tab holds the connection slot.
    #[error("another connection is active in this tab")]
    ConnectionActive,
    /// Every context of the pool is open.
    #[error("audio context limit of {0} reached")]
    ContextLimit(usize),
    /// The context was closed.
    #[error("audio context {0} is closed")]
    ContextClosed(u32),
    /// No such channel.
    #[error("unknown channel {0}")]
    UnknownChannel(usize),
    /// Malformed session description.
    #[error("invalid session description: {0}")]
    Sdp(String),
    /// A signaling message could not be decoded or encoded.
    #[error("signaling message could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
    /// The other end of the relay is gone.
    #[error("signaling relay disconnected")]
    Relay,
    /// The underlying peer connection or codec reported an error.
    #[error("transport error: {0}")]
    Transport(String),
}
