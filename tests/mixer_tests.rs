use narrator::audio::mixer::{Mixer, MixerCommand, MixerQueues, MAX_VOICES};
use narrator::kernel::audio::segment::{DecodedSegment, JobId, SegmentKey};
use narrator::kernel::event::{AudioNotice, HandleId};
use ringbuf::traits::Producer;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

fn segment(samples: usize, value: f32) -> Arc<DecodedSegment> {
    let key = SegmentKey {
        job_id: JobId::new("job-a"),
        segment_id: "0".to_string(),
    };
    Arc::new(DecodedSegment::new(key, vec![value; samples], 1000))
}

fn mixer() -> (Mixer, MixerQueues, Arc<AtomicU64>, mpsc::UnboundedReceiver<AudioNotice>) {
    let frames = Arc::new(AtomicU64::new(0));
    let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
    let (tx, rx) = mpsc::unbounded_channel();
    let (mixer, queues) = Mixer::new(1000, 1, frames.clone(), volume, tx);
    (mixer, queues, frames, rx)
}

fn start(queues: &mut MixerQueues, handle: u64, segment: &Arc<DecodedSegment>, start_frame: u64) {
    let pushed = queues.commands.try_push(MixerCommand::Start {
        handle: HandleId(handle),
        segment: segment.clone(),
        start_frame,
        rate: 1.0,
    });
    assert!(pushed.is_ok());
}

#[test]
fn test_finished_segment_is_handed_back_to_owner() {
    let (mut mixer, mut queues, frames, mut notices) = mixer();
    let audio = segment(4, 0.5);

    // 1. Four frames of audio, then silence
    start(&mut queues, 1, &audio, 0);
    let mut data = [0.0f32; 8];
    mixer.render(&mut data);
    assert_eq!(data, [0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(frames.load(Ordering::Relaxed), 8);

    // 2. The voice ended and its buffer waits in the retired queue
    assert_eq!(notices.try_recv().unwrap(), AudioNotice::Ended(HandleId(1)));
    assert_eq!(mixer.active_voices(), 0);
    assert_eq!(Arc::strong_count(&audio), 2);

    // 3. The owner drops it
    assert_eq!(queues.reclaim(), 1);
    assert_eq!(Arc::strong_count(&audio), 1);
}

#[test]
fn test_stopped_voice_is_silent_and_retired() {
    let (mut mixer, mut queues, _frames, mut notices) = mixer();
    let audio = segment(100, 0.25);

    start(&mut queues, 7, &audio, 0);
    let mut data = [0.0f32; 4];
    mixer.render(&mut data);
    assert_eq!(mixer.active_voices(), 1);

    assert!(queues.commands.try_push(MixerCommand::Stop(HandleId(7))).is_ok());
    mixer.render(&mut data);
    assert_eq!(data, [0.0; 4]);
    assert_eq!(mixer.active_voices(), 0);

    // Stopped, not ended
    assert!(notices.try_recv().is_err());
    assert_eq!(queues.reclaim(), 1);
    assert_eq!(Arc::strong_count(&audio), 1);
}

#[test]
fn test_voice_limit_fails_extra_handles() {
    let (mut mixer, mut queues, _frames, mut notices) = mixer();
    let audio = segment(10, 0.1);

    // Far in the future, so nothing finishes
    for handle in 0..=MAX_VOICES as u64 {
        start(&mut queues, handle, &audio, 1_000_000);
    }
    let mut data = [0.0f32; 2];
    mixer.render(&mut data);

    assert_eq!(mixer.active_voices(), MAX_VOICES);
    match notices.try_recv().unwrap() {
        AudioNotice::Failed { handle, .. } => assert_eq!(handle, HandleId(MAX_VOICES as u64)),
        other => panic!("unexpected notice {:?}", other),
    }
    assert_eq!(queues.reclaim(), 1);
}
