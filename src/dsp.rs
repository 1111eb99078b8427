//! Sample-level building blocks for the radio emulation graph.

use std::f32::consts::{FRAC_1_SQRT_2, PI};
use std::time::Duration;

use dasp_signal::{self as signal, Signal};

/// Soft-clip waveshaper. `amount` in `[0, 1)`; zero is transparent.
#[derive(Clone, Debug)]
pub struct SoftDistortion {
    k: f32,
}

impl SoftDistortion {
    /// Waveshaper for `amount`, clamped below 1.
    pub fn new(amount: f32) -> Self {
        let amount = amount.clamp(0.0, 0.99);
        Self {
            k: 2.0 * amount / (1.0 - amount),
        }
    }

    /// Shape one sample.
    #[inline]
    pub fn process(&self, x: f32) -> f32 {
        (1.0 + self.k) * x / (1.0 + self.k * x.abs())
    }
}

/// Response of a [`Biquad`] section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    /// Attenuates below the corner.
    HighPass,
    /// Attenuates above the corner.
    LowPass,
}

/// Direct form I biquad with Butterworth Q.
#[derive(Clone, Debug)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    /// Butterworth section (Q = 1/sqrt 2) with its corner at `corner_hz`.
    pub fn new(kind: FilterKind, corner_hz: f32, sample_rate: u32) -> Self {
        let nyquist = sample_rate as f32 * 0.5;
        let corner = corner_hz.clamp(1.0, nyquist * 0.99);
        let w0 = 2.0 * PI * corner / sample_rate as f32;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;
        let (b0, b1, b2) = match kind {
            FilterKind::LowPass => ((1.0 - cos) * 0.5, 1.0 - cos, (1.0 - cos) * 0.5),
            FilterKind::HighPass => ((1.0 + cos) * 0.5, -(1.0 + cos), (1.0 + cos) * 0.5),
        };
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Filter one sample.
    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Cascade of identical biquads; each stage adds 12 dB/octave of rolloff.
#[derive(Clone, Debug)]
pub struct FilterCascade {
    stages: Vec<Biquad>,
}

impl FilterCascade {
    /// `stages` identical sections in series.
    pub fn new(kind: FilterKind, corner_hz: f32, stages: usize, sample_rate: u32) -> Self {
        Self {
            stages: (0..stages.max(1))
                .map(|_| Biquad::new(kind, corner_hz, sample_rate))
                .collect(),
        }
    }

    /// Filter one sample through every stage.
    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        self.stages.iter_mut().fold(x, |acc, stage| stage.process(acc))
    }
}

/// One-pole amplitude follower over `|x|`.
#[derive(Clone, Debug)]
pub struct EnvelopeFollower {
    coefficient: f32,
    level: f32,
}

impl EnvelopeFollower {
    /// Follower with a time constant of `smoothing`.
    pub fn new(smoothing: Duration, sample_rate: u32) -> Self {
        let samples = smoothing.as_secs_f32() * sample_rate as f32;
        let coefficient = if samples > 0.0 {
            (-1.0 / samples).exp()
        } else {
            0.0
        };
        Self {
            coefficient,
            level: 0.0,
        }
    }

    /// Feed one sample and return the updated level.
    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        self.level = self.coefficient * self.level + (1.0 - self.coefficient) * x.abs();
        self.level
    }

    /// Last computed level.
    pub fn level(&self) -> f32 {
        self.level
    }
}

/// Binary gate: 1 above `threshold`, 0 otherwise.
#[inline]
pub fn threshold_gate(level: f32, threshold: f32) -> f32 {
    if level > threshold { 1.0 } else { 0.0 }
}

/// Pink noise by filtering white noise through a bank of one-pole sections.
pub struct PinkNoise {
    white: signal::Noise,
    b: [f32; 7],
}

impl PinkNoise {
    /// Noise source seeded with `seed`; equal seeds give equal sequences.
    pub fn new(seed: u64) -> Self {
        Self {
            white: signal::noise(seed),
            b: [0.0; 7],
        }
    }

    /// Next sample, roughly within `[-1, 1]`.
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        let white = self.white.next() as f32;
        let b = &mut self.b;
        b[0] = 0.99886 * b[0] + white * 0.055_517_9;
        b[1] = 0.99332 * b[1] + white * 0.075_075_9;
        b[2] = 0.969 * b[2] + white * 0.153_852;
        b[3] = 0.8665 * b[3] + white * 0.310_485_6;
        b[4] = 0.55 * b[4] + white * 0.532_952_2;
        b[5] = -0.7616 * b[5] - white * 0.016_898;
        let pink = b[0] + b[1] + b[2] + b[3] + b[4] + b[5] + b[6] + white * 0.5362;
        b[6] = white * 0.115_926;
        pink * 0.11
    }
}

/// Root-mean-square level of a block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn sine_rms_through(filter: &mut FilterCascade, frequency: f32, sample_rate: u32) -> f32 {
        let frames = sample_rate as usize / 5;
        let output: Vec<f32> = (0..frames)
            .map(|n| filter.process((TAU * frequency * n as f32 / sample_rate as f32).sin()))
            .collect();
        rms(&output[frames / 2..])
    }

    #[test]
    fn band_pass_passes_voice_and_rejects_extremes() {
        let sr = 48_000;
        let mut hp = FilterCascade::new(FilterKind::HighPass, 300.0, 4, sr);
        let mut lp = FilterCascade::new(FilterKind::LowPass, 2_700.0, 4, sr);
        let in_band = {
            let mut hp = hp.clone();
            let mut lp = lp.clone();
            let mut chain = FilterCascade {
                stages: hp.stages.drain(..).chain(lp.stages.drain(..)).collect(),
            };
            sine_rms_through(&mut chain, 1_000.0, sr)
        };
        let low = sine_rms_through(&mut hp, 75.0, sr);
        let high = sine_rms_through(&mut lp, 10_800.0, sr);
        assert!(in_band > 0.6, "in-band rms {in_band}");
        assert!(low < 0.01, "two octaves below corner should be ~-96 dB, got {low}");
        assert!(high < 0.01, "two octaves above corner should be ~-96 dB, got {high}");
    }

    #[test]
    fn distortion_is_odd_and_bounded() {
        let shaper = SoftDistortion::new(0.1);
        assert_eq!(shaper.process(0.0), 0.0);
        assert!((shaper.process(0.5) + shaper.process(-0.5)).abs() < 1e-6);
        assert!(shaper.process(1.0) <= 1.0 + 1e-6);
        assert!(SoftDistortion::new(0.0).process(0.3) == 0.3);
    }

    #[test]
    fn envelope_follower_tracks_amplitude() {
        let sr = 48_000;
        let mut follower = EnvelopeFollower::new(Duration::from_millis(100), sr);
        for _ in 0..sr {
            follower.process(0.5);
        }
        assert!((follower.level() - 0.5).abs() < 0.01);
        for _ in 0..sr {
            follower.process(0.0);
        }
        assert!(follower.level() < 0.001);
    }

    #[test]
    fn pink_noise_is_bounded_and_non_silent() {
        let mut noise = PinkNoise::new(7);
        let block: Vec<f32> = (0..48_000).map(|_| noise.next_sample()).collect();
        let level = rms(&block);
        assert!(level > 0.01 && level < 1.0, "pink rms {level}");
        assert!(block.iter().all(|s| s.abs() < 2.0));
    }

    #[test]
    fn gate_opens_above_threshold() {
        assert_eq!(threshold_gate(0.0005, 0.001), 0.0);
        assert_eq!(threshold_gate(0.002, 0.001), 1.0);
    }
}
