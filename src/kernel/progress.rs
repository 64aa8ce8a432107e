use serde::{Deserialize, Serialize};

use super::playback::PlaybackState;
use super::session::PlaybackSession;
use super::time::ClockTime;

/// What the reader UI needs to draw a progress bar and a highlight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub index: usize,
    pub total_segments: usize,
    /// Wall seconds into the audible segment.
    pub elapsed_in_segment: f64,
    /// Wall seconds left in the audible segment at the current speed.
    pub remaining_in_segment: f64,
    /// Rough wall seconds left for the whole narration.
    pub estimated_remaining: Option<f64>,
    /// Overall position in [0, 1].
    pub fraction: f64,
    /// Paragraph to highlight.
    pub highlight: Option<usize>,
}

/// Read-only observer of a playback session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTracker {
    paragraphs: usize,
}

impl ProgressTracker {
    pub fn new(paragraphs: usize) -> Self {
        Self { paragraphs }
    }

    pub fn paragraphs(&self) -> usize {
        self.paragraphs
    }

    /// None unless the session is playing and something is audible.
    pub fn sample(&self, session: &PlaybackSession, now: ClockTime) -> Option<ProgressSnapshot> {
        if session.state() != PlaybackState::Playing {
            return None;
        }
        let handle = session.audible(now)?;
        let total = session.total_known().max(handle.index + 1);

        let duration = handle.duration();
        let speed = (handle.rate as f64).max(f64::EPSILON);
        let position = handle.source_position(now);
        let within = if duration > 0.0 { position / duration } else { 0.0 };

        let elapsed_in_segment = position / speed;
        let remaining_in_segment = (duration - position).max(0.0) / speed;

        let fraction = ((handle.index as f64 + within) / total as f64).clamp(0.0, 1.0);
        let highlight = self.highlight_for(fraction);

        let estimated_remaining = session.mean_segment_seconds().map(|mean| {
            let after = total.saturating_sub(handle.index + 1) as f64;
            remaining_in_segment + after * mean / session.speed() as f64
        });

        Some(ProgressSnapshot {
            index: handle.index,
            total_segments: total,
            elapsed_in_segment,
            remaining_in_segment,
            estimated_remaining,
            fraction,
            highlight,
        })
    }

    /// Paragraph-granular mapping of an overall fraction.
    pub fn highlight_for(&self, fraction: f64) -> Option<usize> {
        if self.paragraphs == 0 {
            return None;
        }
        let raw = (fraction * self.paragraphs as f64).floor() as usize;
        Some(raw.min(self.paragraphs - 1))
    }
}
