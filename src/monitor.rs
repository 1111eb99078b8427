//! Coarse per-channel activity detection from spectrum energy.
//!
//! Drives Tx/Rx indicators and control-panel LEDs only; utterance segmentation lives in
//! [`vad`](crate::vad).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftPlanner};
use tracing::{debug, trace};

use crate::config::CommsConfig;
use crate::track::{AudioTrack, TrackId, TrackReader};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Frequency analyser over one track, reporting magnitudes on a 0–255 decibel scale.
pub struct Analyser {
    reader: TrackReader,
    fft: Arc<dyn Fft<f32>>,
    history: VecDeque<f32>,
    window: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    drain: Vec<f32>,
}

impl Analyser {
    fn new(track: &AudioTrack, fft: Arc<dyn Fft<f32>>) -> Self {
        let size = fft.len();
        Self {
            reader: track.subscribe(),
            history: VecDeque::from(vec![0.0; size]),
            window: blackman(size),
            spectrum: vec![Complex::zero(); size],
            drain: vec![0.0; size],
            fft,
        }
    }

    /// Id of the analysed track.
    pub fn track_id(&self) -> TrackId {
        self.reader.track().id()
    }

    /// Number of frequency bins, half the FFT size.
    pub fn bin_count(&self) -> usize {
        self.spectrum.len() / 2
    }

    /// Pull everything queued on the track, keeping the newest window. Returns frames read.
    fn ingest(&mut self) -> usize {
        let size = self.history.len();
        let mut total = 0;
        loop {
            let read = self.reader.read(&mut self.drain);
            if read == 0 {
                break;
            }
            total += read;
            self.history.extend(&self.drain[..read]);
            let excess = self.history.len().saturating_sub(size);
            self.history.drain(..excess);
        }
        total
    }

    /// Fill `out` with the byte-scale spectrum of the newest window. No temporal smoothing is
    /// applied, so a change in energy shows up on the next read.
    ///
    /// A track that delivered nothing since the previous read counts as silent.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        if self.ingest() == 0 {
            self.history.iter_mut().for_each(|sample| *sample = 0.0);
        }
        let size = self.history.len();
        for ((slot, sample), weight) in self
            .spectrum
            .iter_mut()
            .zip(self.history.iter())
            .zip(self.window.iter())
        {
            *slot = Complex::new(sample * weight, 0.0);
        }
        self.fft.process(&mut self.spectrum);

        let scale = 1.0 / size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let bins = self.bin_count();
        for (bin, out) in self.spectrum[..bins].iter().zip(out.iter_mut()) {
            let magnitude = bin.norm() * scale;
            let decibels = if magnitude > 0.0 {
                20.0 * magnitude.log10()
            } else {
                f32::NEG_INFINITY
            };
            *out = (255.0 * (decibels - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8;
        }
    }
}

fn blackman(size: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    (0..size)
        .map(|n| {
            let x = n as f32 / size as f32;
            a0 - a1 * (std::f32::consts::TAU * x).cos() + a2 * (2.0 * std::f32::consts::TAU * x).cos()
        })
        .collect()
}

/// Mean of a byte spectrum.
pub fn mean_magnitude(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|b| *b as u32).sum::<u32>() as f32 / bins.len() as f32
}

/// Live `channel -> active` map over a changing set of tracks.
pub struct ActivityMonitor {
    fft: Arc<dyn Fft<f32>>,
    threshold: f32,
    tick: Duration,
    analysers: BTreeMap<usize, Analyser>,
    activity: BTreeMap<usize, bool>,
    bins: Vec<u8>,
    last_sample: Option<Instant>,
}

impl ActivityMonitor {
    /// Monitor using the analyser size, threshold and tick of `config`.
    pub fn new(config: &CommsConfig) -> Self {
        let size = config.analyser_fft_size.next_power_of_two().max(32);
        Self {
            fft: FftPlanner::new().plan_fft_forward(size),
            threshold: config.monitor_threshold,
            tick: config.monitor_tick,
            analysers: BTreeMap::new(),
            activity: BTreeMap::new(),
            bins: vec![0; size / 2],
            last_sample: None,
        }
    }

    /// Mean byte magnitude above which a track counts as active.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Recalibrate for a different microphone gain staging.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    /// Reconcile analysers with `tracks`: new or replaced tracks get a fresh analyser, ended
    /// or vanished ones are disconnected.
    pub fn sync_tracks(&mut self, tracks: &BTreeMap<usize, AudioTrack>) {
        self.analysers.retain(|channel, analyser| {
            let keep = tracks
                .get(channel)
                .is_some_and(|track| track.id() == analyser.track_id() && !track.is_ended());
            if !keep {
                debug!(channel, "analyser disconnected");
            }
            keep
        });
        self.activity
            .retain(|channel, _| self.analysers.contains_key(channel) || tracks.contains_key(channel));

        for (channel, track) in tracks {
            if track.is_ended() || self.analysers.contains_key(channel) {
                continue;
            }
            self.analysers
                .insert(*channel, Analyser::new(track, self.fft.clone()));
            self.activity.entry(*channel).or_insert(false);
        }
    }

    /// Sample every analyser now.
    pub fn sample(&mut self) -> &BTreeMap<usize, bool> {
        for (channel, analyser) in self.analysers.iter_mut() {
            analyser.byte_frequency_data(&mut self.bins);
            let mean = mean_magnitude(&self.bins);
            let active = mean > self.threshold;
            trace!(channel, mean, active, "activity sample");
            self.activity.insert(*channel, active);
        }
        let ended: Vec<usize> = self
            .analysers
            .iter()
            .filter(|(_, analyser)| analyser.reader.is_ended())
            .map(|(channel, _)| *channel)
            .collect();
        for channel in ended {
            self.analysers.remove(&channel);
            self.activity.insert(channel, false);
        }
        &self.activity
    }

    /// Sample if a tick has elapsed since the last sample. Returns whether it sampled.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = self
            .last_sample
            .is_none_or(|last| now.saturating_duration_since(last) >= self.tick);
        if due {
            self.last_sample = Some(now);
            self.sample();
        }
        due
    }

    /// Last computed activity per channel.
    pub fn activity(&self) -> &BTreeMap<usize, bool> {
        &self.activity
    }

    /// Activity of `channel`; unknown channels are inactive.
    pub fn is_active(&self, channel: usize) -> bool {
        self.activity.get(&channel).copied().unwrap_or(false)
    }

    /// Tracks currently analysed.
    pub fn analyser_count(&self) -> usize {
        self.analysers.len()
    }

    /// Disconnect every analyser and forget all activity.
    pub fn teardown(&mut self) {
        self.analysers.clear();
        self.activity.clear();
        self.last_sample = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn tone(frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .map(|n| (TAU * 1_000.0 * n as f32 / 48_000.0).sin() * amplitude)
            .collect()
    }

    fn tracks(entries: &[(usize, &AudioTrack)]) -> BTreeMap<usize, AudioTrack> {
        entries.iter().map(|(c, t)| (*c, (*t).clone())).collect()
    }

    #[test]
    fn silence_is_inactive_and_tone_is_active() {
        let config = CommsConfig::default();
        let mut monitor = ActivityMonitor::new(&config);
        let quiet = AudioTrack::new("ch-0", 8_192);
        let loud = AudioTrack::new("ch-1", 8_192);
        monitor.sync_tracks(&tracks(&[(0, &quiet), (1, &loud)]));

        quiet.write(&vec![0.0; 4_800]);
        loud.write(&tone(4_800, 0.5));
        monitor.sample();
        assert!(!monitor.is_active(0));
        assert!(monitor.is_active(1));
    }

    #[test]
    fn activity_follows_energy_within_one_tick() {
        let config = CommsConfig::default();
        let mut monitor = ActivityMonitor::new(&config);
        let track = AudioTrack::new("ch-0", 8_192);
        monitor.sync_tracks(&tracks(&[(0, &track)]));

        track.write(&tone(4_800, 0.5));
        monitor.sample();
        assert!(monitor.is_active(0));

        track.write(&vec![0.0; 4_800]);
        monitor.sample();
        assert!(!monitor.is_active(0));

        track.write(&tone(4_800, 0.5));
        monitor.sample();
        assert!(monitor.is_active(0));
    }

    #[test]
    fn stalled_track_reads_as_silence() {
        let config = CommsConfig::default();
        let mut monitor = ActivityMonitor::new(&config);
        let track = AudioTrack::new("ch-0", 8_192);
        monitor.sync_tracks(&tracks(&[(0, &track)]));

        track.write(&tone(4_800, 0.5));
        monitor.sample();
        assert!(monitor.is_active(0));

        monitor.sample();
        assert!(!monitor.is_active(0), "no media since the last tick must read inactive");

        track.write(&tone(4_800, 0.5));
        monitor.sample();
        assert!(monitor.is_active(0));
    }

    #[test]
    fn replaced_track_gets_new_analyser_and_removed_track_is_disconnected() {
        let config = CommsConfig::default();
        let mut monitor = ActivityMonitor::new(&config);
        let first = AudioTrack::new("ch-0", 8_192);
        monitor.sync_tracks(&tracks(&[(0, &first)]));
        assert_eq!(first.reader_count(), 1);

        let second = AudioTrack::new("ch-0", 8_192);
        monitor.sync_tracks(&tracks(&[(0, &second)]));
        assert_eq!(first.reader_count(), 0);
        assert_eq!(second.reader_count(), 1);

        monitor.sync_tracks(&BTreeMap::new());
        assert_eq!(monitor.analyser_count(), 0);
        assert!(monitor.activity().is_empty());
    }

    #[test]
    fn teardown_releases_every_reader() {
        let config = CommsConfig::default();
        let mut monitor = ActivityMonitor::new(&config);
        let a = AudioTrack::new("ch-0", 1_024);
        let b = AudioTrack::new("ch-1", 1_024);
        monitor.sync_tracks(&tracks(&[(0, &a), (1, &b)]));
        monitor.teardown();
        assert_eq!(a.reader_count() + b.reader_count(), 0);
    }

    #[test]
    fn poll_respects_tick() {
        let config = CommsConfig::default();
        let mut monitor = ActivityMonitor::new(&config);
        let start = Instant::now();
        assert!(monitor.poll(start));
        assert!(!monitor.poll(start + Duration::from_millis(50)));
        assert!(monitor.poll(start + Duration::from_millis(100)));
    }

    #[test]
    fn mean_of_bytes() {
        assert_eq!(mean_magnitude(&[]), 0.0);
        assert_eq!(mean_magnitude(&[0, 10, 20]), 10.0);
    }
}
