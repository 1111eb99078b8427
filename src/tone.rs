//! Tone generation and correlation-based delay estimation for end-to-end audio checks.

use crate::ring::monotonic_timestamp_ns;

/// Phase-continuous mono sine source.
#[derive(Clone, Debug)]
pub struct ToneGenerator {
    step: f32,
    phase: f32,
    amplitude: f32,
}

impl ToneGenerator {
    /// Sine at `frequency_hz` with peak `amplitude`.
    pub fn new(sample_rate: u32, frequency_hz: f32, amplitude: f32) -> Self {
        Self {
            step: frequency_hz / sample_rate.max(1) as f32,
            phase: 0.0,
            amplitude,
        }
    }

    /// Peak amplitude.
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Overwrite `out` with the next samples of the tone.
    pub fn fill(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = (self.phase * std::f32::consts::TAU).sin() * self.amplitude;
            self.phase = (self.phase + self.step).fract();
        }
    }
}

/// Best-fit alignment of a recording against the probe reference.
#[derive(Debug, Clone, Copy)]
pub struct DelayReport {
    /// Delay in frames.
    pub offset_frames: usize,
    /// Delay in seconds.
    pub offset_seconds: f32,
    /// Normalised cross-correlation at the best offset (0.0 - 1.0).
    pub correlation: f32,
    /// Monotonic timestamp of the estimate.
    pub measured_at_ns: u64,
}

/// Deterministic reference burst plus a delay estimator.
pub struct ToneProbe {
    sample_rate: u32,
    reference: Vec<f32>,
}

impl ToneProbe {
    /// Probe whose reference is `window_frames` frames of a sine at `frequency_hz`.
    pub fn new(sample_rate: u32, frequency_hz: f32, window_frames: usize) -> Self {
        let mut reference = vec![0.0f32; window_frames];
        ToneGenerator::new(sample_rate, frequency_hz, 0.5).fill(&mut reference);
        Self {
            sample_rate,
            reference,
        }
    }

    /// The burst to play.
    pub fn reference(&self) -> &[f32] {
        &self.reference
    }

    /// Slide the reference over `recorded` and report the offset with the highest
    /// normalised correlation.
    pub fn measure(&self, recorded: &[f32]) -> DelayReport {
        let mut best = (0usize, 0.0f32);
        if !self.reference.is_empty() && recorded.len() >= self.reference.len() {
            let reference_norm = energy(&self.reference);
            let max_offset = recorded.len() - self.reference.len();
            for offset in 0..=max_offset {
                let slice = &recorded[offset..offset + self.reference.len()];
                let corr = correlation(&self.reference, slice, reference_norm);
                if corr > best.1 {
                    best = (offset, corr);
                }
            }
        }
        DelayReport {
            offset_frames: best.0,
            offset_seconds: best.0 as f32 / self.sample_rate.max(1) as f32,
            correlation: best.1,
            measured_at_ns: monotonic_timestamp_ns(),
        }
    }
}

fn correlation(reference: &[f32], recorded: &[f32], reference_norm: f32) -> f32 {
    let recorded_norm = energy(recorded);
    if reference_norm == 0.0 || recorded_norm == 0.0 {
        return 0.0;
    }
    dot(reference, recorded) / (reference_norm * recorded_norm)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn energy(buf: &[f32]) -> f32 {
    buf.iter().map(|x| x * x).sum::<f32>().sqrt()
}
