use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::audio::segment::{DecodedSegment, SegmentDescriptor, SegmentKey, SegmentReadyState};
use super::event::{HandleId, SeekTarget};
use super::playback::{PlaybackGraph, PlaybackRequest, PlaybackState};
use super::session::{PlaybackSession, ScheduledHandle};
use super::telemetry::event::{SkipReason, TelemetryEvent};
use super::time::{ClockTime, Timing, GAP_EPSILON};

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 3.0;

/// Read access to decoded audio. The pass never awaits: a miss turns into
/// a `Resolve` effect and the pass stops.
pub trait DecodedLookup {
    fn decoded(&self, key: &SegmentKey) -> Option<Arc<DecodedSegment>>;
}

impl DecodedLookup for HashMap<SegmentKey, Arc<DecodedSegment>> {
    fn decoded(&self, key: &SegmentKey) -> Option<Arc<DecodedSegment>> {
        self.get(key).cloned()
    }
}

/// Work for the driver. The kernel decides, the reactor executes.
#[derive(Debug, Clone)]
pub enum SideEffect {
    StartAudio {
        handle: HandleId,
        index: usize,
        segment: Arc<DecodedSegment>,
        start_at: ClockTime,
        rate: f32,
    },
    StopAudio(HandleId),
    SetRate {
        handle: HandleId,
        rate: f32,
    },
    /// Fetch and decode this segment, then report back.
    Resolve(SegmentDescriptor),
    /// Fire-and-forget read-ahead.
    Preload(Vec<SegmentDescriptor>),
    /// Everything played; the session is over.
    Finished,
    /// Too many audio device failures; the session is over.
    Terminated { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub timing: Timing,
    pub preload_ahead: usize,
    pub max_audio_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            preload_ahead: 3,
            max_audio_failures: 3,
        }
    }
}

/// Gapless scheduler. Holds no session state of its own beyond the handle
/// counter; every operation takes the session explicitly.
pub struct Scheduler {
    config: SchedulerConfig,
    next_handle: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            next_handle: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Idle -> Playing for a freshly created session.
    pub fn start(
        &mut self,
        session: &mut PlaybackSession,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        let Some(next) = PlaybackGraph::transition(session.state, PlaybackRequest::Start) else {
            return Vec::new();
        };
        session.state = next;
        session.next_start = now + self.config.timing.settle_delay;
        self.run_pass(session, now, cache)
    }

    /// Take in a poll report. Descriptors may arrive in any order.
    pub fn ingest(
        &mut self,
        session: &mut PlaybackSession,
        segments: Vec<SegmentDescriptor>,
        synthesis_done: bool,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        let next = session.next_index();
        for descriptor in segments {
            let index = descriptor.index;
            if session.record_known(descriptor.clone())
                && !session.played.contains(&index)
                && index >= next
            {
                session.insert_pending(descriptor);
            }
        }
        if synthesis_done && !session.synthesis_complete {
            debug!(session = %session.id, known = session.total_known(), "Synthesis complete");
            session.synthesis_complete = true;
        }
        self.run_pass(session, now, cache)
    }

    /// A scheduler-requested resolve finished.
    pub fn on_resolved(
        &mut self,
        session: &mut PlaybackSession,
        index: usize,
        ok: bool,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        session.resolving.remove(&index);
        if !ok {
            session.failed.insert(index);
        }
        self.run_pass(session, now, cache)
    }

    /// Natural end of a handle.
    pub fn on_handle_ended(
        &mut self,
        session: &mut PlaybackSession,
        handle: HandleId,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        if session.seeking {
            return Vec::new();
        }
        if session.scheduled.remove(&handle).is_none() {
            // Stopped by pause/seek/stop, or from an older session.
            return Vec::new();
        }
        session.consecutive_audio_failures = 0;
        self.run_pass(session, now, cache)
    }

    /// The output refused or lost a handle. The segment counts as played;
    /// past the failure budget the whole session terminates.
    pub fn on_audio_failure(
        &mut self,
        session: &mut PlaybackSession,
        handle: HandleId,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        let Some(failed) = session.scheduled.remove(&handle) else {
            return Vec::new();
        };
        session.consecutive_audio_failures += 1;
        let consecutive = session.consecutive_audio_failures;
        session.telemetry.record(TelemetryEvent::AudioFailure {
            index: failed.index,
            consecutive,
        });
        session.skipped += 1;
        session.telemetry.record(TelemetryEvent::SegmentSkipped {
            index: failed.index,
            reason: SkipReason::AudioFailed,
        });
        warn!(index = failed.index, consecutive, "Audio output failed for segment");

        if consecutive >= self.config.max_audio_failures {
            let mut effects = self.halt(session);
            if let Some(next) = PlaybackGraph::transition(session.state, PlaybackRequest::AudioFault) {
                session.state = next;
            }
            effects.push(SideEffect::Terminated {
                reason: format!("audio output failed {} times in a row", consecutive),
            });
            return effects;
        }

        // Reclaim the slot if nothing was chained after the failed handle.
        if (session.next_start - failed.end_at()).abs() < GAP_EPSILON {
            session.next_start = failed.start_at.max(now);
        }
        self.run_pass(session, now, cache)
    }

    /// Stop audio at once. Segments already audible count as played;
    /// segments scheduled for later go back to the pending queue.
    pub fn pause(&mut self, session: &mut PlaybackSession, now: ClockTime) -> Vec<SideEffect> {
        let Some(next) = PlaybackGraph::transition(session.state, PlaybackRequest::Pause) else {
            return Vec::new();
        };
        session.state = next;

        let mut effects = Vec::new();
        let handles: Vec<ScheduledHandle> = std::mem::take(&mut session.scheduled).into_values().collect();
        let mut earliest_withdrawn: Option<usize> = None;
        for handle in handles {
            effects.push(SideEffect::StopAudio(handle.handle));
            if !handle.has_started(now) {
                earliest_withdrawn = Some(earliest_withdrawn.map_or(handle.index, |e| e.min(handle.index)));
                self.withdraw(session, &handle);
            }
        }
        if let Some(first) = earliest_withdrawn {
            session.current_index = first.checked_sub(1);
        }
        session.telemetry.record(TelemetryEvent::Paused { at: now });
        info!(session = %session.id, current = ?session.current_index, "Paused");
        effects
    }

    pub fn resume(
        &mut self,
        session: &mut PlaybackSession,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        let Some(next) = PlaybackGraph::transition(session.state, PlaybackRequest::Resume) else {
            return Vec::new();
        };
        session.state = next;
        session.next_start = now + self.config.timing.settle_delay;
        session.telemetry.record(TelemetryEvent::Resumed { at: now });
        info!(session = %session.id, next = session.next_index(), "Resumed");
        self.run_pass(session, now, cache)
    }

    /// Reposition to an absolute or relative segment.
    pub fn seek(
        &mut self,
        session: &mut PlaybackSession,
        target: SeekTarget,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        if session.state == PlaybackState::Idle {
            return Vec::new();
        }

        let from = session.audible(now).map(|h| h.index).or(session.current_index);
        let base = from.unwrap_or(0);
        let mut target = match target {
            SeekTarget::Forward(n) => base.saturating_add(n),
            SeekTarget::Backward(n) => base.saturating_sub(n),
            SeekTarget::Segment(k) => k,
        };
        if session.synthesis_complete {
            if let Some(&last) = session.known.keys().next_back() {
                target = target.min(last);
            }
        }

        session.seeking = true;
        let mut effects: Vec<SideEffect> = session
            .scheduled
            .keys()
            .map(|h| SideEffect::StopAudio(*h))
            .collect();
        session.scheduled.clear();
        session.pending.clear();
        session.played = (0..target).collect();
        session.failed.retain(|i| *i < target);
        let refill: Vec<SegmentDescriptor> = session
            .known
            .range(target..)
            .filter(|(_, d)| d.is_ready())
            .map(|(_, d)| d.clone())
            .collect();
        for descriptor in refill {
            session.insert_pending(descriptor);
        }
        session.current_index = target.checked_sub(1);
        session.next_start = now + self.config.timing.settle_delay;
        session.telemetry.record(TelemetryEvent::Seek { from, to: target });
        session.seeking = false;
        info!(session = %session.id, ?from, to = target, "Seek");

        match session.state {
            PlaybackState::Playing => effects.extend(self.run_pass(session, now, cache)),
            PlaybackState::Paused => effects.extend(self.preload_batch(session, cache)),
            PlaybackState::Idle => {}
        }
        effects
    }

    /// Change rate in place for audible handles, re-chain the rest.
    pub fn set_speed(
        &mut self,
        session: &mut PlaybackSession,
        speed: f32,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        if (speed - session.speed).abs() < f32::EPSILON {
            return Vec::new();
        }
        let previous = session.speed;
        session.speed = speed;
        session.telemetry.record(TelemetryEvent::SpeedChanged { from: previous, to: speed });

        let mut effects = Vec::new();
        let mut chain_end: Option<ClockTime> = None;
        let mut earliest_withdrawn: Option<(usize, ClockTime)> = None;

        let handles: Vec<HandleId> = session.scheduled.keys().copied().collect();
        for id in handles {
            let Some(mut handle) = session.scheduled.remove(&id) else {
                continue;
            };
            if handle.has_started(now) {
                handle.source_offset = handle.source_position(now);
                handle.start_at = now;
                handle.rate = speed;
                let end = handle.end_at();
                chain_end = Some(chain_end.map_or(end, |e: ClockTime| e.max(end)));
                effects.push(SideEffect::SetRate { handle: id, rate: speed });
                session.scheduled.insert(id, handle);
            } else {
                effects.push(SideEffect::StopAudio(id));
                if earliest_withdrawn.map_or(true, |(i, _)| handle.index < i) {
                    earliest_withdrawn = Some((handle.index, handle.start_at));
                }
                self.withdraw(session, &handle);
            }
        }

        if let Some((first, start_at)) = earliest_withdrawn {
            session.current_index = first.checked_sub(1);
            session.next_start = chain_end.unwrap_or(start_at);
        } else if let Some(end) = chain_end {
            session.next_start = end;
        }

        debug!(session = %session.id, from = previous, to = speed, "Speed changed");
        effects.extend(self.run_pass(session, now, cache));
        effects
    }

    /// Tear down audio for this session. Idempotent.
    pub fn stop(&mut self, session: &mut PlaybackSession) -> Vec<SideEffect> {
        let effects = self.halt(session);
        if let Some(next) = PlaybackGraph::transition(session.state, PlaybackRequest::Stop) {
            session.state = next;
        }
        effects
    }

    /// The gapless pass. Safe to call at any time; does nothing unless
    /// Playing and there is a next-in-order segment to act on.
    pub fn run_pass(
        &mut self,
        session: &mut PlaybackSession,
        now: ClockTime,
        cache: &dyn DecodedLookup,
    ) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        if session.state != PlaybackState::Playing || session.seeking {
            return effects;
        }

        loop {
            let want = session.next_index();

            // Anything in front of `want` is stale.
            while session
                .pending
                .front()
                .is_some_and(|d| d.index < want || session.played.contains(&d.index))
            {
                session.pending.pop_front();
            }

            if session
                .known
                .get(&want)
                .is_some_and(|d| d.state == SegmentReadyState::Failed)
            {
                self.skip(session, want, SkipReason::SynthesisFailed);
                continue;
            }
            if session.failed.contains(&want) {
                self.skip(session, want, SkipReason::ResolveFailed);
                continue;
            }
            if session.synthesis_complete
                && !session.known.contains_key(&want)
                && session.known.range(want..).next().is_some()
            {
                // Synthesis is over and this slot was never reported.
                self.skip(session, want, SkipReason::SynthesisFailed);
                continue;
            }

            if !session.pending.front().is_some_and(|d| d.index == want) {
                break;
            }
            let Some(descriptor) = session.pending.pop_front() else {
                break;
            };

            match cache.decoded(&descriptor.key()) {
                None => {
                    let request = session.resolving.insert(want);
                    session.pending.push_front(descriptor.clone());
                    if request {
                        effects.push(SideEffect::Resolve(descriptor));
                    }
                    break;
                }
                Some(segment) => {
                    effects.push(self.schedule_segment(session, want, segment, now));
                }
            }
        }

        effects.extend(self.preload_batch(session, cache));

        if self.is_finished(session) {
            effects.extend(self.finish(session));
        }
        effects
    }

    fn schedule_segment(
        &mut self,
        session: &mut PlaybackSession,
        index: usize,
        segment: Arc<DecodedSegment>,
        now: ClockTime,
    ) -> SideEffect {
        let natural = session.next_start;
        let start_at = natural.max(now + self.config.timing.safety_margin);
        if start_at - natural > GAP_EPSILON {
            session.telemetry.record(TelemetryEvent::GapDetected {
                index,
                gap_seconds: start_at - natural,
            });
            debug!(index, gap = start_at - natural, "Gap before segment");
        }

        let rate = session.speed;
        let duration = segment.duration_seconds;
        session.next_start = start_at + duration / rate as f64;
        session.played.insert(index);
        session.current_index = Some(index);
        session.scheduled_seconds += duration;
        session.scheduled_count += 1;

        let handle = self.allocate_handle();
        session.scheduled.insert(
            handle,
            ScheduledHandle {
                handle,
                index,
                segment: segment.clone(),
                start_at,
                rate,
                source_offset: 0.0,
            },
        );
        session.telemetry.record(TelemetryEvent::SegmentScheduled {
            index,
            start_at,
            duration,
            rate,
        });

        SideEffect::StartAudio {
            handle,
            index,
            segment,
            start_at,
            rate,
        }
    }

    fn skip(&mut self, session: &mut PlaybackSession, index: usize, reason: SkipReason) {
        session.played.insert(index);
        session.current_index = Some(index);
        session.skipped += 1;
        session.telemetry.record(TelemetryEvent::SegmentSkipped { index, reason });
        warn!(session = %session.id, index, ?reason, "Skipping segment");
    }

    /// Return a not-yet-audible handle's segment to the queue.
    fn withdraw(&mut self, session: &mut PlaybackSession, handle: &ScheduledHandle) {
        session.played.remove(&handle.index);
        if let Some(descriptor) = session.known.get(&handle.index).cloned() {
            session.insert_pending(descriptor);
        }
    }

    fn preload_batch(&self, session: &PlaybackSession, cache: &dyn DecodedLookup) -> Option<SideEffect> {
        let batch: Vec<SegmentDescriptor> = session
            .pending
            .iter()
            .filter(|d| !session.resolving.contains(&d.index))
            .filter(|d| cache.decoded(&d.key()).is_none())
            .take(self.config.preload_ahead)
            .cloned()
            .collect();
        if batch.is_empty() {
            None
        } else {
            Some(SideEffect::Preload(batch))
        }
    }

    fn is_finished(&self, session: &PlaybackSession) -> bool {
        session.state == PlaybackState::Playing
            && !session.seeking
            && session.synthesis_complete
            && session.scheduled.is_empty()
            && session.known.range(session.next_index()..).next().is_none()
    }

    fn finish(&mut self, session: &mut PlaybackSession) -> Vec<SideEffect> {
        let Some(next) = PlaybackGraph::transition(session.state, PlaybackRequest::Finish) else {
            return Vec::new();
        };
        session.state = next;
        session.pending.clear();
        let skipped = session.skipped;
        session.telemetry.record(TelemetryEvent::SessionFinished {
            played: session.played.len(),
            skipped,
        });
        info!(session = %session.id, played = session.played.len(), skipped, "Narration finished");
        vec![SideEffect::Finished]
    }

    fn halt(&mut self, session: &mut PlaybackSession) -> Vec<SideEffect> {
        let effects = session
            .scheduled
            .keys()
            .map(|h| SideEffect::StopAudio(*h))
            .collect();
        session.scheduled.clear();
        session.pending.clear();
        session.resolving.clear();
        effects
    }

    fn allocate_handle(&mut self) -> HandleId {
        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        id
    }
}
