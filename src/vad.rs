//! Block-wise voice activity detection with hysteresis, used to segment recorded utterances.
//!
//! Voice starts on the first loud block and stops only after `silence_hold` of quiet blocks.
//! Pure state machine: safe to run directly inside an audio callback.

use std::time::Duration;

use crate::config::VadConfig;

/// Utterance boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VadEvent {
    /// First loud block after silence.
    VoiceStart,
    /// End of the silence hold.
    VoiceStop,
}

/// Hysteresis detector over block RMS.
#[derive(Clone, Debug)]
pub struct VoiceActivityDetector {
    threshold: f32,
    silence_hold: Duration,
    sample_rate: u32,
    speaking: bool,
    silence: Duration,
}

impl VoiceActivityDetector {
    /// Detector with the threshold and hold of `config`.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        Self {
            threshold: config.threshold,
            silence_hold: config.silence_hold,
            sample_rate: sample_rate.max(1),
            speaking: false,
            silence: Duration::ZERO,
        }
    }

    /// Change the RMS threshold.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    /// Change how long quiet blocks must last before voice stops.
    pub fn set_silence_hold(&mut self, hold: Duration) {
        self.silence_hold = hold;
    }

    /// Whether an utterance is in progress.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one block of mono samples; returns a transition if one happened.
    pub fn process(&mut self, block: &[f32]) -> Option<VadEvent> {
        if block.is_empty() {
            return None;
        }
        let average = block.iter().map(|s| s.abs()).sum::<f32>() / block.len() as f32;

        if average > self.threshold {
            self.silence = Duration::ZERO;
            if !self.speaking {
                self.speaking = true;
                return Some(VadEvent::VoiceStart);
            }
            return None;
        }

        if self.speaking {
            self.silence += Duration::from_secs_f64(block.len() as f64 / self.sample_rate as f64);
            if self.silence > self.silence_hold {
                self.speaking = false;
                self.silence = Duration::ZERO;
                return Some(VadEvent::VoiceStop);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;
    const BLOCK: usize = 128;

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(&VadConfig::default(), SR)
    }

    #[test]
    fn voice_starts_immediately() {
        let mut vad = detector();
        assert_eq!(vad.process(&[0.0; BLOCK]), None);
        assert_eq!(vad.process(&[0.2; BLOCK]), Some(VadEvent::VoiceStart));
        assert_eq!(vad.process(&[0.2; BLOCK]), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn voice_stops_after_hold() {
        let mut vad = detector();
        vad.process(&[0.2; BLOCK]);
        // 300 ms at 48 kHz is 112.5 blocks of 128 frames
        let mut stopped_at = None;
        for i in 1..=200 {
            if vad.process(&[0.0; BLOCK]) == Some(VadEvent::VoiceStop) {
                stopped_at = Some(i);
                break;
            }
        }
        assert_eq!(stopped_at, Some(113));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn brief_pause_does_not_stop_voice() {
        let mut vad = detector();
        vad.process(&[0.2; BLOCK]);
        for _ in 0..50 {
            assert_eq!(vad.process(&[0.0; BLOCK]), None);
        }
        assert_eq!(vad.process(&[0.2; BLOCK]), None);
        for _ in 0..100 {
            assert_eq!(vad.process(&[0.0; BLOCK]), None);
        }
    }

    #[test]
    fn thresholds_are_adjustable() {
        let mut vad = detector();
        vad.set_threshold(0.5);
        assert_eq!(vad.process(&[0.2; BLOCK]), None);
        vad.set_threshold(0.1);
        assert_eq!(vad.process(&[0.2; BLOCK]), Some(VadEvent::VoiceStart));
        vad.set_silence_hold(Duration::ZERO);
        assert_eq!(vad.process(&[0.0; 1]), Some(VadEvent::VoiceStop));
    }
}
