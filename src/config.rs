//! Session-wide tunables. Every value has a working default; callers override fields directly.

use std::time::Duration;

/// Channels multiplexed over one peer connection unless configured otherwise.
pub const DEFAULT_STREAM_COUNT: usize = 8;
/// Session sample rate in Hertz.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
/// Frames rendered per audio context quantum.
pub const DEFAULT_RENDER_QUANTUM: usize = 128;

/// Numeric defaults of the receive-side radio emulation graph.
#[derive(Clone, Debug, PartialEq)]
pub struct RadioProfile {
    /// Soft-clip drive of the distortion stage (0 = bypass).
    pub distortion_amount: f32,
    /// High-pass corner in Hertz.
    pub highpass_hz: f32,
    /// Low-pass corner in Hertz.
    pub lowpass_hz: f32,
    /// Filter stages per corner; each stage contributes 12 dB/octave.
    pub filter_stages: usize,
    /// Intrinsic gain of the pink-noise bed.
    pub noise_base_gain: f32,
    /// Envelope follower smoothing time constant.
    pub envelope_smoothing: Duration,
    /// Linear amplitude above which the speech gate opens.
    pub gate_threshold: f32,
    /// Gain added to the noise bed while the gate is open.
    pub gate_noise_scale: f32,
    /// Final per-channel makeup gain.
    pub makeup_gain: f32,
}

impl Default for RadioProfile {
    fn default() -> Self {
        Self {
            distortion_amount: 0.1,
            highpass_hz: 300.0,
            lowpass_hz: 2_700.0,
            // -48 dB/octave
            filter_stages: 4,
            noise_base_gain: 0.02,
            envelope_smoothing: Duration::from_millis(100),
            gate_threshold: 0.001,
            gate_noise_scale: 0.05,
            makeup_gain: 3.0,
        }
    }
}

/// Opus parameters requested through SDP munging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecTuning {
    /// Enable discontinuous transmission. Off keeps quiet radio static intact.
    pub dtx: bool,
    /// Target average bitrate in bits per second.
    pub max_average_bitrate: u32,
    /// Request stereo decoding.
    pub stereo: bool,
    /// Request in-band forward error correction.
    pub inband_fec: bool,
}

impl Default for CodecTuning {
    fn default() -> Self {
        Self {
            dtx: false,
            max_average_bitrate: 128_000,
            stereo: false,
            inband_fec: true,
        }
    }
}

/// Parameters of the block-wise voice activity detector.
#[derive(Clone, Debug, PartialEq)]
pub struct VadConfig {
    /// Mean absolute amplitude above which a block counts as voice.
    pub threshold: f32,
    /// Silence that must accumulate before voice is considered stopped.
    pub silence_hold: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            silence_hold: Duration::from_millis(300),
        }
    }
}

/// Top-level configuration handed to a [`Station`](crate::station::Station) or its parts.
#[derive(Clone, Debug, PartialEq)]
pub struct CommsConfig {
    /// Channels per peer connection, agreed out of band with the remote side.
    pub stream_count: usize,
    /// Sample rate shared by every audio context.
    pub sample_rate: u32,
    /// Frames per render quantum.
    pub render_quantum: usize,
    /// Upper bound on simultaneously open audio contexts.
    pub max_contexts: usize,
    /// Interval between microphone acquisition attempts while waiting for a gesture.
    pub capture_poll_interval: Duration,
    /// Activity monitor sampling cadence.
    pub monitor_tick: Duration,
    /// Mean byte-scale spectrum magnitude above which a channel counts as active.
    pub monitor_threshold: f32,
    /// Analyser FFT window length (power of two).
    pub analyser_fft_size: usize,
    /// Receive-side radio emulation.
    pub radio: RadioProfile,
    /// Outbound codec tuning.
    pub codec: CodecTuning,
    /// Utterance detection.
    pub vad: VadConfig,
    /// STUN/TURN URLs for real peer connections. Empty means host candidates only.
    pub ice_servers: Vec<String>,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            stream_count: DEFAULT_STREAM_COUNT,
            sample_rate: DEFAULT_SAMPLE_RATE,
            render_quantum: DEFAULT_RENDER_QUANTUM,
            max_contexts: 64,
            capture_poll_interval: Duration::from_secs(1),
            monitor_tick: Duration::from_millis(100),
            monitor_threshold: 10.0,
            analyser_fft_size: 256,
            radio: RadioProfile::default(),
            codec: CodecTuning::default(),
            vad: VadConfig::default(),
            ice_servers: Vec::new(),
        }
    }
}

impl CommsConfig {
    /// Configuration with a different channel count.
    pub fn with_stream_count(mut self, stream_count: usize) -> Self {
        self.stream_count = stream_count;
        self
    }

    /// Configuration with different ICE servers.
    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Ring capacity, in frames, sized for one second of audio.
    pub(crate) fn track_capacity_frames(&self) -> usize {
        (self.sample_rate as usize).max(self.render_quantum * 8)
    }
}
