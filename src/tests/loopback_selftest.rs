use std::time::Duration;

use crate::config::CommsConfig;
use crate::dsp::rms;
use crate::station::LoopbackSession;
use crate::tone::ToneProbe;
use crate::track::TrackReader;
use crate::{pop_log, push_log, recent_logs};

fn drain(reader: &mut TrackReader) -> Vec<f32> {
    let mut out = vec![0.0f32; reader.available()];
    let read = reader.read(&mut out);
    out.truncate(read);
    out
}

#[test]
fn loopback_selftest_clip_delay_through_session() {
    let config = CommsConfig::default().with_stream_count(2);
    let mut session = LoopbackSession::new(&config);
    assert!(session.connect(Duration::from_millis(100)).expect("connect"));

    let mut received = session.participant.peer().inbound()[&0].track().subscribe();
    for _ in 0..10 {
        session.pump().expect("pump");
    }

    let probe = ToneProbe::new(config.sample_rate, 1_000.0, 480);
    let clip = session
        .experimenter
        .play_clip(0, probe.reference().to_vec().into())
        .expect("clip on channel 0");
    for _ in 0..20 {
        session.pump().expect("pump");
    }
    assert!(clip.is_finished());

    let recorded = drain(&mut received);
    assert_eq!(recorded.len(), 30 * config.render_quantum);

    let report = probe.measure(&recorded);
    assert_eq!(report.offset_frames, 10 * config.render_quantum);
    assert!(report.correlation > 0.99, "correlation too low: {}", report.correlation);

    let burst = &recorded[report.offset_frames..report.offset_frames + 480];
    let amplitude_error = (rms(burst) - rms(probe.reference())).abs();
    assert!(amplitude_error < 1e-3, "RMS mismatch {amplitude_error}");
}

#[test]
fn log_ring_keeps_newest_lines() {
    for n in 0..300 {
        push_log(format!("selftest line {n}"));
    }
    let recent = recent_logs(2);
    assert_eq!(recent.len(), 2);
    let mut drained = 0;
    while pop_log().is_some() {
        drained += 1;
    }
    assert!(drained <= 256);
}
