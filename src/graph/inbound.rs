//! Receive-side radio emulation for one inbound channel.
//!
//! ```text
//! track ─┬─ clean gain ─────────────────────────────┐ (mode selects one path)
//!        ├─ distortion ─ high-pass ─ low-pass ──────┤
//!        └─ envelope ─ gate ─┐                      ├─ makeup ─ monitor ─ panner
//!     pink noise ─ noise gain┴──────────────────────┘
//! ```

use crate::config::RadioProfile;
use crate::context::GainParam;
use crate::dsp::{EnvelopeFollower, FilterCascade, FilterKind, PinkNoise, SoftDistortion, threshold_gate};
use crate::track::{AudioTrack, TrackReader};

/// Which speech path feeds the channel mix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RadioMode {
    /// Unprocessed speech (the experimenter listening to participants).
    Clean,
    /// Distorted, band-limited VHF voice.
    #[default]
    Band,
}

/// Mono processing strip producing radio-like audio from an inbound track.
pub struct InboundStrip {
    channel: usize,
    reader: TrackReader,
    mode: RadioMode,
    distortion: SoftDistortion,
    highpass: FilterCascade,
    lowpass: FilterCascade,
    follower: EnvelopeFollower,
    noise: PinkNoise,
    noise_base_gain: f32,
    gate_threshold: f32,
    gate_noise_scale: f32,
    makeup_gain: f32,
    monitoring: GainParam,
    input: Vec<f32>,
}

impl InboundStrip {
    /// Wrap `track` in a new strip. The noise bed starts immediately and never stops.
    pub fn new(
        channel: usize,
        track: &AudioTrack,
        mode: RadioMode,
        profile: &RadioProfile,
        sample_rate: u32,
        monitoring: GainParam,
    ) -> Self {
        Self {
            channel,
            reader: track.subscribe(),
            mode,
            distortion: SoftDistortion::new(profile.distortion_amount),
            highpass: FilterCascade::new(
                FilterKind::HighPass,
                profile.highpass_hz,
                profile.filter_stages,
                sample_rate,
            ),
            lowpass: FilterCascade::new(
                FilterKind::LowPass,
                profile.lowpass_hz,
                profile.filter_stages,
                sample_rate,
            ),
            follower: EnvelopeFollower::new(profile.envelope_smoothing, sample_rate),
            noise: PinkNoise::new(0x5eed_0000 + channel as u64),
            noise_base_gain: profile.noise_base_gain,
            gate_threshold: profile.gate_threshold,
            gate_noise_scale: profile.gate_noise_scale,
            makeup_gain: profile.makeup_gain,
            monitoring,
            input: Vec::new(),
        }
    }

    /// Channel this strip renders.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Rendering mode chosen at construction.
    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    /// The remote track feeding this strip.
    pub fn track(&self) -> &AudioTrack {
        self.reader.track()
    }

    /// Current output of the envelope follower.
    pub fn envelope(&self) -> f32 {
        self.follower.level()
    }

    /// Process `out.len()` frames of mono output.
    pub fn process(&mut self, out: &mut [f32]) {
        let frames = out.len();
        if self.input.len() < frames {
            self.input.resize(frames, 0.0);
        }
        self.reader.read_or_silence(&mut self.input[..frames]);
        let output_gain = self.makeup_gain * self.monitoring.get();

        for (x, y) in self.input[..frames].iter().zip(out.iter_mut()) {
            let clean = *x;
            let level = self.follower.process(clean);
            let noise_gain =
                self.noise_base_gain + threshold_gate(level, self.gate_threshold) * self.gate_noise_scale;
            let noise = self.noise.next_sample() * noise_gain;
            let speech = match self.mode {
                RadioMode::Clean => clean,
                RadioMode::Band => {
                    let shaped = self.distortion.process(clean);
                    self.lowpass.process(self.highpass.process(shaped))
                }
            };
            *y = (speech + noise) * output_gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::rms;
    use std::f32::consts::TAU;

    const SR: u32 = 48_000;

    fn tone(frequency: f32, frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .map(|n| (TAU * frequency * n as f32 / SR as f32).sin() * amplitude)
            .collect()
    }

    fn run(strip: &mut InboundStrip, track: &AudioTrack, input: &[f32]) -> Vec<f32> {
        let mut output = Vec::with_capacity(input.len());
        for block in input.chunks(128) {
            track.write(block);
            let mut out = vec![0.0f32; block.len()];
            strip.process(&mut out);
            output.extend_from_slice(&out);
        }
        output
    }

    fn strip(mode: RadioMode, track: &AudioTrack) -> InboundStrip {
        InboundStrip::new(0, track, mode, &RadioProfile::default(), SR, GainParam::new(1.0))
    }

    #[test]
    fn noise_bed_rises_with_speech() {
        let track = AudioTrack::new("ch-0", 8_192);
        let mut strip = strip(RadioMode::Clean, &track);
        let ms = |n: usize| SR as usize * n / 1_000;

        let idle = run(&mut strip, &track, &vec![0.0; ms(500)]);
        let idle_rms = rms(&idle[ms(250)..]);
        assert!(idle_rms > 0.0, "noise bed must keep running");
        assert!(idle_rms < 0.05, "idle static should be near silent, got {idle_rms}");

        run(&mut strip, &track, &tone(800.0, ms(250), 0.3));
        // in clean mode the output after speech ends is pure static, so its level is
        // the noise gain the envelope left behind
        let tail = run(&mut strip, &track, &vec![0.0; ms(2_000)]);
        let raised = rms(&tail[ms(20)..ms(220)]);
        let settled = rms(&tail[ms(1_500)..]);
        assert!(raised > idle_rms * 2.5, "idle {idle_rms} after speech {raised}");
        assert!(settled < idle_rms * 1.5, "idle {idle_rms} settled {settled}");
    }

    #[test]
    fn band_mode_rejects_low_rumble() {
        let track = AudioTrack::new("ch-0", 8_192);
        let mut clean = strip(RadioMode::Clean, &track);
        let clean_out = run(&mut clean, &track, &tone(60.0, SR as usize / 2, 0.5));

        let track = AudioTrack::new("ch-0", 8_192);
        let mut band = strip(RadioMode::Band, &track);
        let band_out = run(&mut band, &track, &tone(60.0, SR as usize / 2, 0.5));

        let half = clean_out.len() / 2;
        assert!(rms(&band_out[half..]) < rms(&clean_out[half..]) * 0.2);
    }

    #[test]
    fn monitoring_gain_silences_channel() {
        let track = AudioTrack::new("ch-0", 8_192);
        let monitoring = GainParam::new(0.0);
        let mut strip = InboundStrip::new(
            0,
            &track,
            RadioMode::Band,
            &RadioProfile::default(),
            SR,
            monitoring.clone(),
        );
        let out = run(&mut strip, &track, &tone(1_000.0, 1_024, 0.5));
        assert!(out.iter().all(|s| *s == 0.0));
        monitoring.set(1.0);
        let out = run(&mut strip, &track, &tone(1_000.0, 1_024, 0.5));
        assert!(rms(&out) > 0.1);
    }

    #[test]
    fn envelope_opens_gate_during_speech() {
        let track = AudioTrack::new("ch-0", 8_192);
        let mut strip = strip(RadioMode::Band, &track);
        run(&mut strip, &track, &tone(800.0, SR as usize / 4, 0.3));
        assert!(strip.envelope() > RadioProfile::default().gate_threshold);
    }
}
