//! Transmit-side graph: microphone -> mute gain -> outbound track, one context per channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::CommsError;
use crate::context::{AudioContext, ContextPool, GainParam, RenderNode};
use crate::track::{AudioTrack, TrackReader, channel_label};

/// Completion flag of a scheduled clip.
#[derive(Clone, Debug)]
pub struct ClipHandle {
    done: Arc<AtomicBool>,
}

impl ClipHandle {
    /// Whether the clip has played to the end or was dropped.
    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

struct ClipPlayback {
    samples: Arc<[f32]>,
    position: usize,
    done: Arc<AtomicBool>,
}

type ClipQueue = Arc<Mutex<VecDeque<ClipPlayback>>>;

/// Caller-side controls for one outbound channel.
///
/// The mute gain starts at 0; transmission is toggled by moving it between 0 and 1
/// without renegotiating the connection.
pub struct TrackControl {
    channel: usize,
    mute_gain: GainParam,
    context: Arc<AudioContext>,
    output_track: AudioTrack,
    clips: ClipQueue,
}

impl TrackControl {
    /// Channel index of this control.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Mute gain between the microphone and the outbound track.
    pub fn mute_gain(&self) -> &GainParam {
        &self.mute_gain
    }

    /// Open (1) or close (0) the microphone path of this channel.
    pub fn set_transmitting(&self, transmitting: bool) {
        self.mute_gain.set(if transmitting { 1.0 } else { 0.0 });
    }

    /// Whether the mute gain is open.
    pub fn is_transmitting(&self) -> bool {
        self.mute_gain.get() > 0.0
    }

    /// The context rendering this channel.
    pub fn context(&self) -> &Arc<AudioContext> {
        &self.context
    }

    /// The synthesized track handed to the peer connection.
    pub fn output_track(&self) -> &AudioTrack {
        &self.output_track
    }

    /// Queue a pre-recorded mono clip on this channel. Clips bypass the mute gain and play
    /// back to back.
    pub fn play_clip(&self, samples: Arc<[f32]>) -> ClipHandle {
        let done = Arc::new(AtomicBool::new(samples.is_empty()));
        let handle = ClipHandle { done: done.clone() };
        if !samples.is_empty() {
            debug!(channel = self.channel, frames = samples.len(), "clip scheduled");
            self.clips.lock().push_back(ClipPlayback {
                samples,
                position: 0,
                done,
            });
        }
        handle
    }

    /// Release the context and end the outbound track.
    pub fn close(&self) {
        self.context.close();
        self.output_track.stop();
    }
}

impl Drop for TrackControl {
    fn drop(&mut self) {
        self.close();
    }
}

struct OutboundNode {
    mic: TrackReader,
    mute_gain: GainParam,
    output: AudioTrack,
    clips: ClipQueue,
    scratch: Vec<f32>,
}

impl RenderNode for OutboundNode {
    fn render(&mut self, frames: usize) {
        if self.scratch.len() < frames {
            self.scratch.resize(frames, 0.0);
        }
        let block = &mut self.scratch[..frames];
        self.mic.read_or_silence(block);

        let gain = self.mute_gain.get();
        for sample in block.iter_mut() {
            *sample *= gain;
        }

        let mut clips = self.clips.lock();
        let mut cursor = 0usize;
        while cursor < frames {
            let Some(clip) = clips.front_mut() else { break };
            let take = (clip.samples.len() - clip.position).min(frames - cursor);
            for (out, clip_sample) in block[cursor..cursor + take]
                .iter_mut()
                .zip(&clip.samples[clip.position..clip.position + take])
            {
                *out += *clip_sample;
            }
            clip.position += take;
            cursor += take;
            if clip.position >= clip.samples.len() {
                clip.done.store(true, Ordering::Release);
                clips.pop_front();
            }
        }
        drop(clips);

        self.output.write(block);
    }

    fn disconnect(&mut self) {
        self.output.stop();
        for clip in self.clips.lock().drain(..) {
            clip.done.store(true, Ordering::Release);
        }
    }
}

/// Build the transmit graph for `channel`, reading from the shared microphone track.
///
/// Each call opens its own context and mute gain, so channels never share mute state.
pub fn build_outbound(
    pool: &ContextPool,
    microphone: &AudioTrack,
    channel: usize,
    capacity_frames: usize,
) -> Result<TrackControl, CommsError> {
    let context = pool.open()?;
    let mute_gain = GainParam::new(0.0);
    let output_track = AudioTrack::new(channel_label(channel), capacity_frames);
    let clips: ClipQueue = Arc::new(Mutex::new(VecDeque::new()));

    context.attach(Box::new(OutboundNode {
        mic: microphone.subscribe(),
        mute_gain: mute_gain.clone(),
        output: output_track.clone(),
        clips: clips.clone(),
        scratch: vec![0.0; context.render_quantum()],
    }))?;
    debug!(channel, context = context.id(), "outbound graph built");

    Ok(TrackControl {
        channel,
        mute_gain,
        context,
        output_track,
        clips,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(reader: &mut TrackReader) -> Vec<f32> {
        let mut out = vec![0.0f32; reader.available()];
        reader.read(&mut out);
        out
    }

    #[test]
    fn mute_gain_defaults_to_zero() {
        let pool = ContextPool::new(48_000, 128, 8);
        let mic = AudioTrack::new("mic", 4_096);
        let control = build_outbound(&pool, &mic, 0, 4_096).unwrap();
        assert_eq!(control.mute_gain().get(), 0.0);
        assert_eq!(control.output_track().label(), "ch-0");

        let mut out = control.output_track().subscribe();
        mic.write(&[0.5; 128]);
        control.context().render().unwrap();
        assert!(drain(&mut out).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn channels_do_not_share_mute_state() {
        let pool = ContextPool::new(48_000, 128, 8);
        let mic = AudioTrack::new("mic", 4_096);
        let a = build_outbound(&pool, &mic, 0, 4_096).unwrap();
        let b = build_outbound(&pool, &mic, 1, 4_096).unwrap();
        a.set_transmitting(true);
        a.set_transmitting(true);
        assert_eq!(b.mute_gain().get(), 0.0);
        a.set_transmitting(false);
        a.set_transmitting(false);
        assert_eq!(a.mute_gain().get(), 0.0);
        assert_eq!(b.mute_gain().get(), 0.0);
        assert_eq!(pool.open_count(), 2);
    }

    #[test]
    fn unmuted_channel_passes_microphone() {
        let pool = ContextPool::new(48_000, 128, 8);
        let mic = AudioTrack::new("mic", 4_096);
        let control = build_outbound(&pool, &mic, 3, 4_096).unwrap();
        let mut out = control.output_track().subscribe();
        control.set_transmitting(true);
        mic.write(&[0.25; 128]);
        control.context().render().unwrap();
        assert!(drain(&mut out).iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn clip_bypasses_mute_and_reports_completion() {
        let pool = ContextPool::new(48_000, 128, 8);
        let mic = AudioTrack::new("mic", 4_096);
        let control = build_outbound(&pool, &mic, 0, 4_096).unwrap();
        let mut out = control.output_track().subscribe();
        let clip: Arc<[f32]> = vec![0.1f32; 200].into();
        let handle = control.play_clip(clip);

        control.context().render().unwrap();
        assert!(!handle.is_finished());
        control.context().render().unwrap();
        assert!(handle.is_finished());

        let rendered = drain(&mut out);
        assert_eq!(rendered.len(), 256);
        assert!(rendered[..200].iter().all(|s| (*s - 0.1).abs() < 1e-6));
        assert!(rendered[200..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn close_releases_context_and_ends_track() {
        let pool = ContextPool::new(48_000, 128, 8);
        let mic = AudioTrack::new("mic", 4_096);
        let control = build_outbound(&pool, &mic, 0, 4_096).unwrap();
        let track = control.output_track().clone();
        drop(control);
        assert_eq!(pool.open_count(), 0);
        assert!(track.is_ended());
        assert_eq!(mic.reader_count(), 0);
    }
}
