use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::audio::output::{AudioError, AudioOutput};
use crate::kernel::audio::segment::{DecodedSegment, SegmentKey};
use crate::kernel::event::{AudioNotice, HandleId};
use crate::kernel::time::ClockTime;

/// One accepted `start` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRecord {
    pub handle: HandleId,
    pub key: SegmentKey,
    pub start_at: ClockTime,
    pub rate: f32,
    pub duration: f64,
}

#[derive(Debug, Clone)]
struct ActiveHandle {
    anchor: ClockTime,
    /// Source seconds consumed at `anchor`.
    consumed: f64,
    rate: f32,
    duration: f64,
}

impl ActiveHandle {
    fn end_at(&self) -> ClockTime {
        let begin = self.anchor;
        begin + (self.duration - self.consumed).max(0.0) / self.rate.max(f32::EPSILON) as f64
    }

    fn consumed_at(&self, now: ClockTime) -> f64 {
        (self.consumed + (now - self.anchor).max(0.0) * self.rate as f64).min(self.duration)
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    clock: ClockTime,
    volume: f32,
    starts: Vec<StartRecord>,
    stops: Vec<HandleId>,
    rate_changes: Vec<(HandleId, f32)>,
    active: BTreeMap<HandleId, ActiveHandle>,
    failing_starts: u32,
}

/// Audio output with a hand-driven clock. Records every call and plays
/// nothing; handles end when the clock passes their end time.
#[derive(Clone)]
pub struct VirtualOutput {
    state: Arc<Mutex<VirtualState>>,
    notices: mpsc::UnboundedSender<AudioNotice>,
}

impl VirtualOutput {
    pub fn new(notices: mpsc::UnboundedSender<AudioNotice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                volume: 1.0,
                ..VirtualState::default()
            })),
            notices,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the clock forward, ending every handle that runs out on the way.
    pub fn advance(&self, seconds: f64) {
        let target = self.lock().clock + seconds.max(0.0);
        self.set_clock(target);
    }

    pub fn set_clock(&self, at: ClockTime) {
        let mut ended: Vec<(ClockTime, HandleId)> = Vec::new();
        {
            let mut state = self.lock();
            state.clock = state.clock.max(at);
            let now = state.clock;
            state.active.retain(|handle, active| {
                let end = active.end_at();
                if end <= now {
                    ended.push((end, *handle));
                    false
                } else {
                    true
                }
            });
        }
        ended.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, handle) in ended {
            let _ = self.notices.send(AudioNotice::Ended(handle));
        }
    }

    /// End a handle right now, regardless of its length.
    pub fn finish(&self, handle: HandleId) {
        if self.lock().active.remove(&handle).is_some() {
            let _ = self.notices.send(AudioNotice::Ended(handle));
        }
    }

    /// Report an asynchronous failure for a playing handle.
    pub fn fail(&self, handle: HandleId, message: &str) {
        if self.lock().active.remove(&handle).is_some() {
            let _ = self.notices.send(AudioNotice::Failed {
                handle,
                message: message.to_string(),
            });
        }
    }

    /// Make the next `count` calls to `start` fail synchronously.
    pub fn fail_next_starts(&self, count: u32) {
        self.lock().failing_starts = count;
    }

    pub fn clock(&self) -> ClockTime {
        self.lock().clock
    }

    pub fn starts(&self) -> Vec<StartRecord> {
        self.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<HandleId> {
        self.lock().stops.clone()
    }

    pub fn rate_changes(&self) -> Vec<(HandleId, f32)> {
        self.lock().rate_changes.clone()
    }

    pub fn active_handles(&self) -> Vec<HandleId> {
        self.lock().active.keys().copied().collect()
    }

    pub fn volume(&self) -> f32 {
        self.lock().volume
    }
}

impl AudioOutput for VirtualOutput {
    fn now(&self) -> ClockTime {
        self.lock().clock
    }

    fn sample_rate(&self) -> Option<u32> {
        None
    }

    fn start(
        &mut self,
        handle: HandleId,
        segment: Arc<DecodedSegment>,
        start_at: ClockTime,
        rate: f32,
    ) -> Result<(), AudioError> {
        let mut state = self.lock();
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(AudioError::Stream("injected failure".to_string()));
        }
        state.starts.push(StartRecord {
            handle,
            key: segment.key.clone(),
            start_at,
            rate,
            duration: segment.duration_seconds,
        });
        state.active.insert(
            handle,
            ActiveHandle {
                anchor: start_at,
                consumed: 0.0,
                rate,
                duration: segment.duration_seconds,
            },
        );
        Ok(())
    }

    fn stop(&mut self, handle: HandleId) {
        let mut state = self.lock();
        state.active.remove(&handle);
        state.stops.push(handle);
    }

    fn set_rate(&mut self, handle: HandleId, rate: f32) {
        let mut state = self.lock();
        let now = state.clock;
        if let Some(active) = state.active.get_mut(&handle) {
            if active.anchor <= now {
                active.consumed = active.consumed_at(now);
                active.anchor = now;
            }
            active.rate = rate;
        }
        state.rate_changes.push((handle, rate));
    }

    fn set_volume(&mut self, volume: f32) {
        self.lock().volume = volume.clamp(0.0, 1.0);
    }
}
