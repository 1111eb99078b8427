//! Mono PCM tracks with fan-out to any number of readers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::ring::{SharedRingBuffer, monotonic_timestamp_ns};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

const CHANNEL_LABEL_PREFIX: &str = "ch-";

/// Process-unique track identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// Label carried by the outbound track of `channel`.
pub fn channel_label(channel: usize) -> String {
    format!("{CHANNEL_LABEL_PREFIX}{channel}")
}

/// Recover the channel index from a label produced by [`channel_label`].
pub fn parse_channel_label(label: &str) -> Option<usize> {
    label.strip_prefix(CHANNEL_LABEL_PREFIX)?.parse().ok()
}

struct TrackInner {
    id: TrackId,
    label: String,
    capacity_frames: usize,
    readers: RwLock<Vec<Weak<SharedRingBuffer>>>,
    ended: AtomicBool,
    frames_written: AtomicU64,
}

/// A live mono audio track. Cloning yields another handle to the same track.
///
/// Writes are broadcast: each [`TrackReader`] owns its own ring, so one track can feed a
/// processing graph and an analyser at the same time without either stealing frames.
#[derive(Clone)]
pub struct AudioTrack {
    inner: Arc<TrackInner>,
}

impl AudioTrack {
    /// Create a track whose readers buffer up to `capacity_frames` frames.
    pub fn new(label: impl Into<String>, capacity_frames: usize) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId(NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed)),
                label: label.into(),
                capacity_frames,
                readers: RwLock::new(Vec::new()),
                ended: AtomicBool::new(false),
                frames_written: AtomicU64::new(0),
            }),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    /// Track label, `ch-<n>` for channel tracks.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Channel index encoded in the label, if any.
    pub fn channel_hint(&self) -> Option<usize> {
        parse_channel_label(&self.inner.label)
    }

    /// Attach a new reader. It only sees frames written after this call.
    pub fn subscribe(&self) -> TrackReader {
        let ring = Arc::new(SharedRingBuffer::new(self.inner.capacity_frames, 1));
        self.inner.readers.write().push(Arc::downgrade(&ring));
        TrackReader {
            ring,
            track: self.clone(),
        }
    }

    /// Broadcast samples to every live reader. Ended tracks drop writes.
    pub fn write(&self, samples: &[f32]) {
        if self.is_ended() || samples.is_empty() {
            return;
        }
        let timestamp = monotonic_timestamp_ns();
        let mut prune = false;
        for reader in self.inner.readers.read().iter() {
            match reader.upgrade() {
                Some(ring) => {
                    ring.push_latest(samples, Some(timestamp));
                }
                None => prune = true,
            }
        }
        if prune {
            self.inner
                .readers
                .write()
                .retain(|reader| reader.strong_count() > 0);
        }
        self.inner
            .frames_written
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
    }

    /// End the track. Readers drain what is queued and then observe [`TrackReader::is_ended`].
    pub fn stop(&self) {
        self.inner.ended.store(true, Ordering::Release);
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Number of attached readers still alive.
    pub fn reader_count(&self) -> usize {
        self.inner
            .readers
            .read()
            .iter()
            .filter(|reader| reader.strong_count() > 0)
            .count()
    }

    /// Total samples written since creation.
    pub fn frames_written(&self) -> u64 {
        self.inner.frames_written.load(Ordering::Relaxed)
    }
}

impl PartialEq for AudioTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AudioTrack {}

impl fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioTrack")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Consumer side of one track subscription.
pub struct TrackReader {
    ring: Arc<SharedRingBuffer>,
    track: AudioTrack,
}

impl TrackReader {
    /// Pop up to `out.len()` samples, returning how many were read.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        self.ring.pop(out)
    }

    /// Read exactly `out.len()` samples, zero-filling whatever is not yet available.
    pub fn read_or_silence(&mut self, out: &mut [f32]) -> usize {
        let read = self.ring.pop(out);
        out[read..].fill(0.0);
        read
    }

    /// Samples buffered for this reader.
    pub fn available(&self) -> usize {
        self.ring.available_read()
    }

    /// The track this reader is attached to.
    pub fn track(&self) -> &AudioTrack {
        &self.track
    }

    /// True once the track has ended and every queued sample was consumed.
    pub fn is_ended(&self) -> bool {
        self.track.is_ended() && self.ring.available_read() == 0
    }
}
