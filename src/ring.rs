//! Single-producer/single-consumer ring buffer carrying interleaved `f32` PCM between
//! audio graph nodes.
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

/// Extra attempts a reader makes while the producer keeps lapping it.
const MAX_READ_RETRIES: usize = 4;

/// Queue bookkeeping shared by the producer and consumer sides.
///
/// Only the producer stores `claim_index` and `write_index`; only the consumer stores
/// `read_index`.
#[repr(C, align(64))]
struct RingHeader {
    /// Highest frame index the producer has started writing.
    claim_index: AtomicU64,
    /// Highest frame index that is fully written.
    write_index: AtomicU64,
    read_index: AtomicU64,
    last_timestamp_ns: AtomicU64,
}

impl RingHeader {
    fn new() -> Self {
        Self {
            claim_index: AtomicU64::new(0),
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            last_timestamp_ns: AtomicU64::new(0),
        }
    }
}

/// Lock-free ring buffer for interleaved `f32` audio data.
///
/// One thread writes with [`push`](Self::push) or [`push_latest`](Self::push_latest), one
/// thread reads with [`pop`](Self::pop). Indices grow monotonically; the slot is
/// `index % capacity`. Samples are stored as `f32` bit patterns in atomics so an
/// overwriting producer and a reader never race on plain memory.
pub struct SharedRingBuffer {
    header: RingHeader,
    data: Box<[AtomicU32]>,
    capacity_frames: usize,
    channels: usize,
}

impl SharedRingBuffer {
    /// Allocate a ring holding `capacity_frames` frames of `channels` samples each.
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let capacity_frames = capacity_frames.max(1);
        let channels = channels.max(1);
        Self {
            header: RingHeader::new(),
            data: (0..capacity_frames * channels)
                .map(|_| AtomicU32::new(0))
                .collect(),
            capacity_frames,
            channels,
        }
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Interleaved samples per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    fn store_frames(&self, start_index: u64, frames: &[f32]) {
        let start = (start_index % self.capacity_frames as u64) as usize * self.channels;
        let len = self.data.len();
        for (offset, sample) in frames.iter().enumerate() {
            self.data[(start + offset) % len].store(sample.to_bits(), Ordering::Relaxed);
        }
    }

    fn load_frames(&self, start_index: u64, out: &mut [f32]) {
        let start = (start_index % self.capacity_frames as u64) as usize * self.channels;
        let len = self.data.len();
        for (offset, sample) in out.iter_mut().enumerate() {
            *sample = f32::from_bits(self.data[(start + offset) % len].load(Ordering::Relaxed));
        }
    }

    fn commit(&self, write_index: u64, frames: usize, timestamp_ns: Option<u64>) {
        self.header
            .write_index
            .store(write_index + frames as u64, Ordering::Release);
        let timestamp = timestamp_ns.unwrap_or_else(monotonic_timestamp_ns);
        self.header
            .last_timestamp_ns
            .store(timestamp, Ordering::Release);
    }

    /// Push frames into the ring, returning frames written. Frames that do not fit are dropped.
    pub fn push(&self, frames: &[f32], timestamp_ns: Option<u64>) -> usize {
        let frames_count = frames.len() / self.channels;
        if frames_count == 0 {
            return 0;
        }

        let capacity = self.capacity_frames as u64;
        let write_index = self.header.write_index.load(Ordering::Relaxed);
        let read_index = self.header.read_index.load(Ordering::Acquire);
        let used = write_index.saturating_sub(read_index).min(capacity);
        let free = capacity.saturating_sub(used);
        if free == 0 {
            return 0;
        }
        let frames_to_write = frames_count.min(free as usize);
        self.header
            .claim_index
            .store(write_index + frames_to_write as u64, Ordering::Relaxed);
        fence(Ordering::Release);
        self.store_frames(write_index, &frames[..frames_to_write * self.channels]);
        self.commit(write_index, frames_to_write, timestamp_ns);
        frames_to_write
    }

    /// Push frames, overwriting the oldest queued audio when the reader has fallen behind.
    ///
    /// Live tracks prefer fresh audio over complete audio: a stalled analyser must not
    /// freeze on stale frames. The producer never moves the read index; a lagging reader
    /// skips ahead on its next [`pop`](Self::pop).
    pub fn push_latest(&self, frames: &[f32], timestamp_ns: Option<u64>) -> usize {
        let total = frames.len() / self.channels;
        if total == 0 {
            return 0;
        }
        let keep = total.min(self.capacity_frames);
        let tail = &frames[(total - keep) * self.channels..total * self.channels];
        let write_index = self.header.write_index.load(Ordering::Relaxed);
        self.header
            .claim_index
            .store(write_index + keep as u64, Ordering::Relaxed);
        fence(Ordering::Release);
        self.store_frames(write_index, tail);
        self.commit(write_index, keep, timestamp_ns);
        keep
    }

    /// Pop frames into the provided buffer, returning frames read.
    ///
    /// A reader lapped by [`push_latest`](Self::push_latest) resumes at the oldest frame
    /// still held. A copy the producer overwrote mid-read is retried, and after
    /// repeated laps nothing is returned for this call.
    pub fn pop(&self, out: &mut [f32]) -> usize {
        let requested_frames = out.len() / self.channels;
        if requested_frames == 0 {
            return 0;
        }
        let capacity = self.capacity_frames as u64;
        let mut read_index = self.header.read_index.load(Ordering::Relaxed);
        for attempt in 0..=MAX_READ_RETRIES {
            let write_index = self.header.write_index.load(Ordering::Acquire);
            read_index = read_index.max(write_index.saturating_sub(capacity));
            let available = write_index.saturating_sub(read_index);
            if available == 0 {
                self.header.read_index.store(read_index, Ordering::Release);
                return 0;
            }
            let frames_to_read = requested_frames.min(available as usize);
            self.load_frames(read_index, &mut out[..frames_to_read * self.channels]);
            fence(Ordering::Acquire);
            let claim_index = self.header.claim_index.load(Ordering::Relaxed);
            let oldest_intact = claim_index.saturating_sub(capacity);
            if oldest_intact <= read_index {
                self.header
                    .read_index
                    .store(read_index + frames_to_read as u64, Ordering::Release);
                return frames_to_read;
            }
            read_index = oldest_intact;
            if attempt == MAX_READ_RETRIES {
                self.header.read_index.store(read_index, Ordering::Release);
            }
        }
        0
    }

    /// Drop queued frames without copying, returning the number discarded. Reader side only.
    pub fn discard(&self, frames: usize) -> usize {
        let available = self.available_read();
        if available == 0 {
            return 0;
        }
        let frames = frames.min(available);
        let capacity = self.capacity_frames as u64;
        let write_index = self.header.write_index.load(Ordering::Acquire);
        let read_index = self
            .header
            .read_index
            .load(Ordering::Relaxed)
            .max(write_index.saturating_sub(capacity));
        self.header
            .read_index
            .store(read_index + frames as u64, Ordering::Release);
        frames
    }

    /// Frames ready for reading.
    pub fn available_read(&self) -> usize {
        let capacity = self.capacity_frames as u64;
        let write_index = self.header.write_index.load(Ordering::Acquire);
        let read_index = self.header.read_index.load(Ordering::Acquire);
        write_index.saturating_sub(read_index).min(capacity) as usize
    }

    /// Timestamp of the last write.
    pub fn last_timestamp_ns(&self) -> u64 {
        self.header.last_timestamp_ns.load(Ordering::Acquire)
    }
}

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (info.numer as u64, info.denom as u64)
    });
    *TIMEBASE
}

/// Monotonic timestamp in nanoseconds.
pub fn monotonic_timestamp_ns() -> u64 {
    #[cfg(target_os = "macos")]
    {
        let host_time = unsafe { mach_absolute_time() };
        let (numer, denom) = timebase();
        ((host_time as u128 * numer as u128) / denom as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around_capacity() {
        let ring = SharedRingBuffer::new(4, 1);
        assert_eq!(ring.push(&[1.0, 2.0, 3.0], None), 3);
        let mut out = [0.0f32; 2];
        assert_eq!(ring.pop(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(ring.push(&[4.0, 5.0, 6.0], None), 3);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn push_latest_keeps_newest_frames() {
        let ring = SharedRingBuffer::new(3, 1);
        ring.push(&[1.0, 2.0], None);
        ring.push_latest(&[3.0, 4.0, 5.0, 6.0], None);
        let mut out = [0.0f32; 3];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(out, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn push_latest_leaves_read_index_to_the_reader() {
        let ring = SharedRingBuffer::new(4, 1);
        ring.push(&[1.0, 2.0, 3.0, 4.0], None);
        ring.push_latest(&[5.0, 6.0], None);
        assert_eq!(ring.header.read_index.load(Ordering::Relaxed), 0);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
        assert_eq!(ring.pop(&mut out), 0);
    }

    #[test]
    fn lapped_reader_sees_only_consecutive_frames() {
        use std::sync::Arc;

        let ring = Arc::new(SharedRingBuffer::new(64, 1));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut next = 0.0f32;
                for _ in 0..20_000 {
                    let block: Vec<f32> = (0..48).map(|i| next + i as f32).collect();
                    next += 48.0;
                    ring.push_latest(&block, Some(0));
                }
            })
        };

        let mut last = -1.0f32;
        let mut out = [0.0f32; 32];
        while !producer.is_finished() {
            let read = ring.pop(&mut out);
            for window in out[..read].windows(2) {
                assert_eq!(window[1], window[0] + 1.0, "torn read {:?}", &out[..read]);
            }
            if read > 0 {
                assert!(out[0] > last, "reader went backwards");
                last = out[read - 1];
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn stereo_frames_count_per_frame() {
        let ring = SharedRingBuffer::new(8, 2);
        assert_eq!(ring.push(&[0.1, 0.2, 0.3, 0.4], Some(7)), 2);
        assert_eq!(ring.available_read(), 2);
        assert_eq!(ring.last_timestamp_ns(), 7);
    }
}
