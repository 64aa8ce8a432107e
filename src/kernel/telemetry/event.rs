use serde::{Deserialize, Serialize};

use crate::kernel::time::ClockTime;

// Allowed: indices, clock times, durations, counts, enums.
// Forbidden: chapter text, sample data.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEvent {
    SegmentScheduled {
        index: usize,
        start_at: ClockTime,
        duration: ClockTime,
        rate: f32,
    },

    /// Start time landed later than the natural continuation point.
    GapDetected {
        index: usize,
        gap_seconds: ClockTime,
    },

    SegmentSkipped {
        index: usize,
        reason: SkipReason,
    },

    AudioFailure {
        index: usize,
        consecutive: u32,
    },

    Seek {
        from: Option<usize>,
        to: usize,
    },

    Paused {
        at: ClockTime,
    },

    Resumed {
        at: ClockTime,
    },

    SpeedChanged {
        from: f32,
        to: f32,
    },

    SessionFinished {
        played: usize,
        skipped: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Fetch or decode of the segment failed.
    ResolveFailed,
    /// Backend reported the segment (or its job) as failed.
    SynthesisFailed,
    /// Audio output rejected the segment.
    AudioFailed,
}
