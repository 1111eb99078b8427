//! Fixed spatial placement of inbound channels around the listener.

use std::sync::Arc;

use dasp_frame::{Frame, Stereo};
use parking_lot::Mutex;
use tracing::debug;

use crate::context::RenderNode;
use crate::dsp::{FilterCascade, FilterKind};
use crate::graph::InboundStrip;
use crate::ring::SharedRingBuffer;

/// Listener-relative placement in degrees and metres.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolarPosition {
    /// Azimuth, negative to the left.
    pub yaw_deg: f32,
    /// Elevation, positive up.
    pub pitch_deg: f32,
    /// Metres from the listener.
    pub distance: f32,
}

const fn polar(yaw_deg: f32, pitch_deg: f32) -> PolarPosition {
    PolarPosition {
        yaw_deg,
        pitch_deg,
        distance: 1.0,
    }
}

/// Two rows of four: a front row slightly raised, a rear row slightly lowered.
pub const POLAR_POSITIONS: [PolarPosition; 8] = [
    polar(-60.0, 10.0),
    polar(-20.0, 10.0),
    polar(20.0, 10.0),
    polar(60.0, 10.0),
    polar(-120.0, -10.0),
    polar(-160.0, -10.0),
    polar(160.0, -10.0),
    polar(120.0, -10.0),
];

/// Cartesian position plus an orientation pointing back at the listener.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatialPosition {
    /// Source position, listener at the origin.
    pub position: [f32; 3],
    /// Unit vector from the source towards the listener.
    pub orientation: [f32; 3],
}

/// Spherical to Cartesian: `y` is straight ahead, `x` to the right, `z` up.
pub fn polar_to_xyz(yaw_deg: f32, pitch_deg: f32, distance: f32) -> SpatialPosition {
    let yaw = yaw_deg.to_radians();
    let pitch = pitch_deg.to_radians();
    let position = [
        distance * yaw.sin() * pitch.cos(),
        distance * yaw.cos() * pitch.cos(),
        distance * pitch.sin(),
    ];
    SpatialPosition {
        position,
        orientation: [-position[0], -position[1], -position[2]],
    }
}

/// Placement of `channel`; channels beyond the table wrap around.
pub fn position_for_channel(channel: usize) -> SpatialPosition {
    let polar = POLAR_POSITIONS[channel % POLAR_POSITIONS.len()];
    polar_to_xyz(polar.yaw_deg, polar.pitch_deg, polar.distance)
}

/// Corner of the head-shadow low-pass for a source directly behind the listener.
const REAR_SHADOW_MIN_HZ: f32 = 3_000.0;
/// Corner for a source just behind the interaural axis.
const REAR_SHADOW_MAX_HZ: f32 = 12_000.0;
/// Extra attenuation for a source directly behind the listener.
const REAR_ATTENUATION_DB: f32 = -3.0;
/// Level tilt per unit of elevation sine; raised sources read slightly louder.
const ELEVATION_TILT_DB: f32 = 6.0;

fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Stereo panner for one fixed source.
///
/// Lateral placement is equal-power with inverse distance attenuation (reference distance
/// 1). Two speakers cannot separate front from back by level alone, so sources behind the
/// listener also pass a head-shadow low-pass and lose a little level, and the elevation
/// tilts the level so the raised front row and lowered rear row differ.
#[derive(Clone, Debug)]
pub struct Panner {
    left: f32,
    right: f32,
    shadow: Option<FilterCascade>,
    shadow_hz: Option<f32>,
}

impl Panner {
    /// Panner for a source at `position`.
    pub fn new(position: &SpatialPosition, sample_rate: u32) -> Self {
        let [x, y, z] = position.position;
        let distance = (x * x + y * y + z * z).sqrt();
        let mut azimuth = x.atan2(y).to_degrees();
        // front/back ambiguity folds rear sources onto the frontal arc
        if azimuth > 90.0 {
            azimuth = 180.0 - azimuth;
        } else if azimuth < -90.0 {
            azimuth = -180.0 - azimuth;
        }
        let pan = (azimuth + 90.0) / 180.0 * std::f32::consts::FRAC_PI_2;

        let (rearness, elevation) = if distance > 0.0 {
            ((-y / distance).clamp(0.0, 1.0), z / distance)
        } else {
            (0.0, 0.0)
        };
        let shadow_hz = (rearness > 0.0)
            .then(|| REAR_SHADOW_MAX_HZ - (REAR_SHADOW_MAX_HZ - REAR_SHADOW_MIN_HZ) * rearness);
        let gain = db_to_gain(REAR_ATTENUATION_DB * rearness + ELEVATION_TILT_DB * elevation)
            / distance.max(1.0);
        Self {
            left: pan.cos() * gain,
            right: pan.sin() * gain,
            shadow: shadow_hz
                .map(|hz| FilterCascade::new(FilterKind::LowPass, hz, 1, sample_rate)),
            shadow_hz,
        }
    }

    /// Place one mono sample.
    #[inline]
    pub fn pan(&mut self, sample: f32) -> Stereo<f32> {
        let sample = match self.shadow.as_mut() {
            Some(shadow) => shadow.process(sample),
            None => sample,
        };
        [sample * self.left, sample * self.right]
    }

    /// Left and right gains.
    pub fn gains(&self) -> (f32, f32) {
        (self.left, self.right)
    }

    /// Corner of the head-shadow filter, `None` for sources in front.
    pub fn shadow_hz(&self) -> Option<f32> {
        self.shadow_hz
    }
}

struct PlacedStrip {
    strip: InboundStrip,
    position: SpatialPosition,
    panner: Panner,
}

/// Shared list of positioned strips. The [`SpatialRenderer`] node renders it; the peer
/// manager adds and clears strips as tracks come and go.
#[derive(Clone)]
pub struct SpatialMix {
    strips: Arc<Mutex<Vec<PlacedStrip>>>,
    sample_rate: u32,
}

impl SpatialMix {
    /// An empty mix rendered at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            strips: Arc::default(),
            sample_rate,
        }
    }

    /// Position `strip` at its channel's fixed point and start mixing it.
    pub fn connect(&self, strip: InboundStrip) -> SpatialPosition {
        let position = position_for_channel(strip.channel());
        debug!(channel = strip.channel(), ?position, "inbound channel placed");
        let mut strips = self.strips.lock();
        strips.retain(|placed| placed.strip.channel() != strip.channel());
        strips.push(PlacedStrip {
            panner: Panner::new(&position, self.sample_rate),
            position,
            strip,
        });
        position
    }

    /// Remove every strip, releasing their track subscriptions.
    pub fn clear(&self) {
        self.strips.lock().clear();
    }

    /// Sources in the mix.
    pub fn len(&self) -> usize {
        self.strips.lock().len()
    }

    /// Whether the mix has no sources.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(channel, position)` of every connected strip.
    pub fn positions(&self) -> Vec<(usize, SpatialPosition)> {
        let mut positions: Vec<_> = self
            .strips
            .lock()
            .iter()
            .map(|placed| (placed.strip.channel(), placed.position))
            .collect();
        positions.sort_by_key(|(channel, _)| *channel);
        positions
    }
}

/// Render node summing every placed strip into an interleaved stereo listener output.
pub struct SpatialRenderer {
    mix: SpatialMix,
    output: Arc<SharedRingBuffer>,
    mono: Vec<f32>,
    stereo: Vec<f32>,
}

impl SpatialRenderer {
    /// Renderer writing `mix` into `output`.
    pub fn new(mix: SpatialMix, output: Arc<SharedRingBuffer>) -> Self {
        Self {
            mix,
            output,
            mono: Vec::new(),
            stereo: Vec::new(),
        }
    }
}

impl RenderNode for SpatialRenderer {
    fn render(&mut self, frames: usize) {
        self.mono.resize(frames, 0.0);
        self.stereo.clear();
        self.stereo.resize(frames * 2, 0.0);

        for placed in self.mix.strips.lock().iter_mut() {
            placed.strip.process(&mut self.mono[..frames]);
            for (frame, sample) in self.stereo.chunks_exact_mut(2).zip(&self.mono[..frames]) {
                let mixed = [frame[0], frame[1]].add_amp(placed.panner.pan(*sample));
                frame[0] = mixed[0];
                frame[1] = mixed[1];
            }
        }
        self.output.push_latest(&self.stereo, None);
    }

    fn disconnect(&mut self) {
        self.mix.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::rms;

    const SR: u32 = 48_000;

    fn approx(a: [f32; 3], b: [f32; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn straight_ahead_maps_to_positive_y() {
        let placed = polar_to_xyz(0.0, 0.0, 2.0);
        assert!(approx(placed.position, [0.0, 2.0, 0.0]));
        assert!(approx(placed.orientation, [0.0, -2.0, 0.0]));
    }

    #[test]
    fn quarter_turn_maps_to_positive_x() {
        let placed = polar_to_xyz(90.0, 0.0, 1.5);
        assert!(approx(placed.position, [1.5, 0.0, 0.0]));
    }

    #[test]
    fn orientation_is_negated_position() {
        for channel in 0..8 {
            let placed = position_for_channel(channel);
            for axis in 0..3 {
                assert_eq!(placed.orientation[axis], -placed.position[axis]);
            }
        }
    }

    #[test]
    fn table_places_channels_apart() {
        for a in 0..8 {
            for b in (a + 1)..8 {
                assert_ne!(position_for_channel(a), position_for_channel(b));
            }
        }
        assert_eq!(position_for_channel(9), position_for_channel(1));
    }

    #[test]
    fn panner_follows_side() {
        let (left, right) = Panner::new(&position_for_channel(0), SR).gains();
        assert!(left > right);
        let (left, right) = Panner::new(&position_for_channel(3), SR).gains();
        assert!(right > left);
        let ahead = Panner::new(&polar_to_xyz(0.0, 0.0, 1.0), SR);
        let (left, right) = ahead.gains();
        assert!((left - right).abs() < 1e-6);
        assert!((left * left + right * right - 1.0).abs() < 1e-5);
        assert_eq!(ahead.shadow_hz(), None);
    }

    #[test]
    fn every_channel_renders_differently() {
        let cues: Vec<(f32, f32, Option<f32>)> = (0..8)
            .map(|channel| {
                let panner = Panner::new(&position_for_channel(channel), SR);
                let (left, right) = panner.gains();
                (left, right, panner.shadow_hz())
            })
            .collect();
        for a in 0..8 {
            for b in (a + 1)..8 {
                assert_ne!(cues[a], cues[b], "channels {a} and {b} render identically");
            }
        }
        for channel in 0..4 {
            assert!(cues[channel].2.is_none());
            assert!(cues[channel + 4].2.is_some());
        }
    }

    #[test]
    fn rear_source_loses_high_frequencies() {
        let hiss: Vec<f32> = (0..SR as usize / 10)
            .map(|n| (std::f32::consts::TAU * 8_000.0 * n as f32 / SR as f32).sin())
            .collect();
        let render = |channel: usize| {
            let mut panner = Panner::new(&position_for_channel(channel), SR);
            let left: Vec<f32> = hiss.iter().map(|s| panner.pan(*s)[0]).collect();
            rms(&left[left.len() / 2..])
        };
        // channel 0 front-left and channel 4 rear-left share a lateral angle
        let front = render(0);
        let rear = render(4);
        assert!(rear < front * 0.6, "front {front} rear {rear}");
    }
}
