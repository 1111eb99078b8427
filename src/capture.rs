//! Local microphone capture, deferred until the user interacts with the page.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::CommsError;
use crate::tone::ToneGenerator;
use crate::track::AudioTrack;

/// Why a microphone request did not produce a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// The host refuses capture until a user gesture has happened. Worth retrying.
    GestureRequired,
    /// The user or platform refused access. Never retried.
    PermissionDenied(String),
}

/// Host microphone access.
pub trait MicrophoneBackend: Send {
    /// Request the microphone. `gesture` tells whether a user gesture has been seen.
    fn acquire(&mut self, gesture: bool) -> Result<AudioTrack, AcquireError>;

    /// Produce `frames` frames into the acquired track. Device-driven backends push from
    /// their own thread and leave this empty.
    fn produce(&mut self, _frames: usize) {}
}

/// Where microphone acquisition stands.
#[derive(Clone, Debug)]
pub enum CaptureState {
    /// No answer from the backend yet; retried on gesture and poll.
    Pending,
    /// The microphone track every outbound channel reads from.
    Ready(AudioTrack),
    /// Terminal for this session.
    Unavailable(String),
}

/// Owns the single microphone-derived source of a tab.
///
/// Attempts on every gesture and on a fixed poll interval until the backend settles,
/// then stops listening for good.
pub struct CaptureManager {
    backend: Box<dyn MicrophoneBackend>,
    poll_interval: Duration,
    state: CaptureState,
    gesture_seen: bool,
    last_attempt: Option<Instant>,
    attempts: u32,
}

impl CaptureManager {
    /// Manage `backend`, retrying every `poll_interval` while pending.
    pub fn new(backend: Box<dyn MicrophoneBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            state: CaptureState::Pending,
            gesture_seen: false,
            last_attempt: None,
            attempts: 0,
        }
    }

    /// Current acquisition state.
    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Whether gesture listeners and the poll are still attached.
    pub fn is_listening(&self) -> bool {
        matches!(self.state, CaptureState::Pending)
    }

    /// Acquisition attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A click or key press happened.
    pub fn notify_gesture(&mut self, now: Instant) -> &CaptureState {
        if self.is_listening() {
            self.gesture_seen = true;
            self.attempt(now);
        }
        &self.state
    }

    /// Poll step; attempts again once `poll_interval` has passed since the last attempt.
    pub fn tick(&mut self, now: Instant) -> &CaptureState {
        let due = self
            .last_attempt
            .is_none_or(|last| now.saturating_duration_since(last) >= self.poll_interval);
        if self.is_listening() && due {
            self.attempt(now);
        }
        &self.state
    }

    fn attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
        self.attempts += 1;
        match self.backend.acquire(self.gesture_seen) {
            Ok(track) => {
                info!(track = %track.id(), attempts = self.attempts, "microphone acquired");
                self.state = CaptureState::Ready(track);
            }
            Err(AcquireError::GestureRequired) => {
                debug!(attempts = self.attempts, "microphone waits for a user gesture");
            }
            Err(AcquireError::PermissionDenied(reason)) => {
                warn!(%reason, "microphone access denied");
                self.state = CaptureState::Unavailable(reason);
            }
        }
    }

    /// The cached track, if capture succeeded.
    pub fn source(&self) -> Option<&AudioTrack> {
        match &self.state {
            CaptureState::Ready(track) => Some(track),
            _ => None,
        }
    }

    /// The cached track, or the reason there is none.
    pub fn track(&self) -> Result<&AudioTrack, CommsError> {
        match &self.state {
            CaptureState::Ready(track) => Ok(track),
            CaptureState::Pending => Err(CommsError::CaptureUnavailable),
            CaptureState::Unavailable(reason) => Err(CommsError::CaptureDenied(reason.clone())),
        }
    }

    /// Let the backend produce one block of audio.
    pub fn render(&mut self, frames: usize) {
        if matches!(self.state, CaptureState::Ready(_)) {
            self.backend.produce(frames);
        }
    }
}

#[derive(Default)]
struct SyntheticSignal {
    tone: Option<ToneGenerator>,
}

/// Handle for changing what a [`SyntheticMicrophone`] "hears".
#[derive(Clone, Default)]
pub struct MicrophoneControl {
    signal: Arc<Mutex<SyntheticSignal>>,
}

impl MicrophoneControl {
    /// Play a sine at `frequency_hz` into the microphone.
    pub fn set_tone(&self, sample_rate: u32, frequency_hz: f32, amplitude: f32) {
        self.signal.lock().tone = Some(ToneGenerator::new(sample_rate, frequency_hz, amplitude));
    }

    /// Stop the tone; the microphone then produces silence.
    pub fn silence(&self) {
        self.signal.lock().tone = None;
    }

    /// Whether no tone is playing.
    pub fn is_silent(&self) -> bool {
        self.signal.lock().tone.is_none()
    }
}

/// Generator-backed microphone for tests and the console demo.
pub struct SyntheticMicrophone {
    capacity_frames: usize,
    requires_gesture: bool,
    denial: Option<String>,
    control: MicrophoneControl,
    track: Option<AudioTrack>,
    block: Vec<f32>,
}

impl SyntheticMicrophone {
    /// A microphone whose track buffers `capacity_frames` frames per reader. Access waits for
    /// a user gesture unless [`without_gesture`](Self::without_gesture) is applied.
    pub fn new(capacity_frames: usize) -> Self {
        Self {
            capacity_frames,
            requires_gesture: true,
            denial: None,
            control: MicrophoneControl::default(),
            track: None,
            block: Vec::new(),
        }
    }

    /// Grant access without waiting for a gesture.
    pub fn without_gesture(mut self) -> Self {
        self.requires_gesture = false;
        self
    }

    /// Refuse access once a request is made with a gesture.
    pub fn denied(mut self, reason: impl Into<String>) -> Self {
        self.denial = Some(reason.into());
        self
    }

    /// Handle for steering the signal after the microphone is boxed into a [`CaptureManager`].
    pub fn control(&self) -> MicrophoneControl {
        self.control.clone()
    }
}

impl MicrophoneBackend for SyntheticMicrophone {
    fn acquire(&mut self, gesture: bool) -> Result<AudioTrack, AcquireError> {
        if self.requires_gesture && !gesture {
            return Err(AcquireError::GestureRequired);
        }
        if let Some(reason) = &self.denial {
            return Err(AcquireError::PermissionDenied(reason.clone()));
        }
        let track = self
            .track
            .get_or_insert_with(|| AudioTrack::new("microphone", self.capacity_frames));
        Ok(track.clone())
    }

    fn produce(&mut self, frames: usize) {
        let Some(track) = &self.track else { return };
        self.block.resize(frames, 0.0);
        match self.control.signal.lock().tone.as_mut() {
            Some(tone) => tone.fill(&mut self.block),
            None => self.block.fill(0.0),
        }
        track.write(&self.block);
    }
}
