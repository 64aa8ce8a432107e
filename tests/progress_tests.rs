use narrator::kernel::audio::segment::{
    AudioFormat, DecodedSegment, JobId, SegmentDescriptor, SegmentKey, SegmentReadyState,
};
use narrator::kernel::progress::ProgressTracker;
use narrator::kernel::scheduler::{Scheduler, SchedulerConfig};
use narrator::kernel::session::PlaybackSession;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn desc(index: usize) -> SegmentDescriptor {
    SegmentDescriptor {
        index,
        segment_id: format!("{}", index),
        job_id: JobId::new("job"),
        state: SegmentReadyState::Ready,
        fetch_url: format!("http://backend/{}", index),
        format: Some(AudioFormat::Wav),
    }
}

fn cache(count: usize, seconds: f64) -> HashMap<SegmentKey, Arc<DecodedSegment>> {
    (0..count)
        .map(|i| {
            let key = desc(i).key();
            let samples = vec![0.0; (seconds * 100.0) as usize];
            (key.clone(), Arc::new(DecodedSegment::new(key, samples, 100)))
        })
        .collect()
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[test]
fn test_no_snapshot_before_audio_starts() {
    let tracker = ProgressTracker::new(4);
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let mut session = PlaybackSession::new(Uuid::new_v4(), 1.0);
    let lookup = cache(2, 2.0);

    // Idle
    assert!(tracker.sample(&session, 0.0).is_none());

    scheduler.start(&mut session, 0.0, &lookup);
    scheduler.ingest(&mut session, vec![desc(0), desc(1)], true, 0.0, &lookup);

    // Playing, but the first start is 50 ms out
    assert!(tracker.sample(&session, 0.01).is_none());
    assert!(tracker.sample(&session, 0.06).is_some());
}

#[test]
fn test_snapshot_positions_within_segment() {
    let tracker = ProgressTracker::new(4);
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let mut session = PlaybackSession::new(Uuid::new_v4(), 1.0);
    let lookup = cache(4, 2.0);

    scheduler.start(&mut session, 0.0, &lookup);
    scheduler.ingest(&mut session, (0..4).map(desc).collect(), true, 0.0, &lookup);

    // Segment 1 runs 2.05..4.05; one second in
    let snap = tracker.sample(&session, 3.05).expect("audible");
    assert_eq!(snap.index, 1);
    assert_eq!(snap.total_segments, 4);
    assert!(approx(snap.elapsed_in_segment, 1.0));
    assert!(approx(snap.remaining_in_segment, 1.0));
    assert!(approx(snap.fraction, 1.5 / 4.0));
    assert_eq!(snap.highlight, Some(1));
    // 1 s left here plus two more 2 s segments
    assert!(approx(snap.estimated_remaining.unwrap_or_default(), 5.0));
}

#[test]
fn test_speed_scales_wall_time() {
    let tracker = ProgressTracker::new(2);
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let mut session = PlaybackSession::new(Uuid::new_v4(), 2.0);
    let lookup = cache(2, 2.0);

    scheduler.start(&mut session, 0.0, &lookup);
    scheduler.ingest(&mut session, vec![desc(0), desc(1)], true, 0.0, &lookup);

    // At 2x, segment 0 lasts one wall second: 0.05..1.05
    let snap = tracker.sample(&session, 0.55).expect("audible");
    assert_eq!(snap.index, 0);
    assert!(approx(snap.elapsed_in_segment, 0.5));
    assert!(approx(snap.remaining_in_segment, 0.5));
    assert!(approx(snap.estimated_remaining.unwrap_or_default(), 1.5));
}

#[test]
fn test_paused_session_has_no_snapshot() {
    let tracker = ProgressTracker::new(2);
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let mut session = PlaybackSession::new(Uuid::new_v4(), 1.0);
    let lookup = cache(1, 2.0);

    scheduler.start(&mut session, 0.0, &lookup);
    scheduler.ingest(&mut session, vec![desc(0)], false, 0.0, &lookup);
    scheduler.pause(&mut session, 1.0);

    assert!(tracker.sample(&session, 1.5).is_none());
}

#[test]
fn test_highlight_mapping() {
    let tracker = ProgressTracker::new(3);
    assert_eq!(tracker.highlight_for(0.0), Some(0));
    assert_eq!(tracker.highlight_for(0.34), Some(1));
    assert_eq!(tracker.highlight_for(0.99), Some(2));
    // Exactly 1.0 stays on the last paragraph
    assert_eq!(tracker.highlight_for(1.0), Some(2));

    assert_eq!(ProgressTracker::new(0).highlight_for(0.5), None);
}
