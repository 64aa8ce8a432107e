use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use super::audio::segment::{DecodedSegment, SegmentDescriptor, SegmentReadyState};
use super::event::{HandleId, SessionId};
use super::playback::PlaybackState;
use super::telemetry::recorder::TelemetryRecorder;
use super::time::ClockTime;

/// A segment handed to the audio output and not yet finished.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    pub handle: HandleId,
    pub index: usize,
    pub segment: Arc<DecodedSegment>,
    pub start_at: ClockTime,
    pub rate: f32,
    /// Source seconds already consumed at `start_at`. Non-zero once the
    /// rate changed in place and the handle was re-anchored.
    pub source_offset: f64,
}

impl ScheduledHandle {
    pub fn duration(&self) -> f64 {
        self.segment.duration_seconds
    }

    pub fn has_started(&self, now: ClockTime) -> bool {
        self.start_at <= now
    }

    /// Position inside the source audio, in source seconds.
    pub fn source_position(&self, now: ClockTime) -> f64 {
        let played = (now - self.start_at).max(0.0) * self.rate as f64;
        (self.source_offset + played).min(self.duration())
    }

    pub fn end_at(&self) -> ClockTime {
        let rate = (self.rate as f64).max(f64::EPSILON);
        self.start_at + (self.duration() - self.source_offset).max(0.0) / rate
    }
}

/// Aggregate root of one narration. Created per play(), dropped on teardown.
///
/// Fields are private to the kernel; the scheduler is the only writer.
#[derive(Debug)]
pub struct PlaybackSession {
    pub id: SessionId,
    pub(crate) state: PlaybackState,
    pub(crate) seeking: bool,
    pub(crate) speed: f32,

    /// Every descriptor reported so far, by global index.
    pub(crate) known: BTreeMap<usize, SegmentDescriptor>,
    /// Ready but not yet scheduled, sorted by index.
    pub(crate) pending: VecDeque<SegmentDescriptor>,
    /// Last index that was scheduled (or skipped). None before the first.
    pub(crate) current_index: Option<usize>,
    pub(crate) next_start: ClockTime,
    pub(crate) scheduled: BTreeMap<HandleId, ScheduledHandle>,
    /// Indices that must never be scheduled again this session.
    pub(crate) played: BTreeSet<usize>,
    /// Indices with a scheduler-requested resolve in flight.
    pub(crate) resolving: HashSet<usize>,
    /// Indices whose resolve failed permanently.
    pub(crate) failed: HashSet<usize>,
    pub(crate) synthesis_complete: bool,
    pub(crate) consecutive_audio_failures: u32,
    /// Segments passed over without audio (synthesis, resolve or output failure).
    pub(crate) skipped: usize,

    pub(crate) scheduled_seconds: f64,
    pub(crate) scheduled_count: usize,

    pub telemetry: TelemetryRecorder,
}

impl PlaybackSession {
    pub fn new(id: SessionId, speed: f32) -> Self {
        Self {
            id,
            state: PlaybackState::Idle,
            seeking: false,
            speed,
            known: BTreeMap::new(),
            pending: VecDeque::new(),
            current_index: None,
            next_start: 0.0,
            scheduled: BTreeMap::new(),
            played: BTreeSet::new(),
            resolving: HashSet::new(),
            failed: HashSet::new(),
            synthesis_complete: false,
            consecutive_audio_failures: 0,
            skipped: 0,
            scheduled_seconds: 0.0,
            scheduled_count: 0,
            telemetry: TelemetryRecorder::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// The only index the scheduling pass may consider.
    pub fn next_index(&self) -> usize {
        self.current_index.map_or(0, |i| i + 1)
    }

    pub fn next_start(&self) -> ClockTime {
        self.next_start
    }

    pub fn synthesis_complete(&self) -> bool {
        self.synthesis_complete
    }

    pub fn pending_indices(&self) -> Vec<usize> {
        self.pending.iter().map(|d| d.index).collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.pending.iter()
    }

    pub fn is_played(&self, index: usize) -> bool {
        self.played.contains(&index)
    }

    pub fn played_indices(&self) -> Vec<usize> {
        self.played.iter().copied().collect()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &ScheduledHandle> {
        self.scheduled.values()
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    /// Number of segments the backend has told us about.
    pub fn total_known(&self) -> usize {
        self.known.keys().next_back().map_or(0, |last| last + 1)
    }

    pub fn known(&self, index: usize) -> Option<&SegmentDescriptor> {
        self.known.get(&index)
    }

    /// Mean source duration of everything scheduled so far.
    pub fn mean_segment_seconds(&self) -> Option<f64> {
        if self.scheduled_count == 0 {
            None
        } else {
            Some(self.scheduled_seconds / self.scheduled_count as f64)
        }
    }

    /// The handle the listener is hearing right now: the latest one that
    /// has started and not yet ended.
    pub fn audible(&self, now: ClockTime) -> Option<&ScheduledHandle> {
        self.scheduled
            .values()
            .filter(|h| h.has_started(now))
            .max_by(|a, b| a.start_at.total_cmp(&b.start_at))
    }

    pub(crate) fn insert_pending(&mut self, descriptor: SegmentDescriptor) {
        if self.pending.iter().any(|d| d.index == descriptor.index) {
            return;
        }
        let pos = self
            .pending
            .iter()
            .position(|d| d.index > descriptor.index)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, descriptor);
    }

    /// Record a descriptor. Readiness never goes backwards.
    /// Returns true when the segment became ready with this report.
    pub(crate) fn record_known(&mut self, descriptor: SegmentDescriptor) -> bool {
        let was_ready = self
            .known
            .get(&descriptor.index)
            .is_some_and(|d| d.state == SegmentReadyState::Ready);
        if was_ready {
            return false;
        }
        let became_ready = descriptor.is_ready();
        self.known.insert(descriptor.index, descriptor);
        became_ready
    }
}
