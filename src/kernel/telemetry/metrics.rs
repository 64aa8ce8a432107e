use std::collections::VecDeque;
use serde::Serialize;

use super::event::{SkipReason, TelemetryEvent};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub schedule_stats: ScheduleStats,
    pub gap_stats: GapStats,
    pub skip_stats: SkipStats,
    pub control_stats: ControlStats,
    /// Indices in the order they were handed to the audio output.
    pub scheduled_order: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleStats {
    pub scheduled: u64,
    pub total_audio_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GapStats {
    pub count: u64,
    pub total_gap_seconds: f64,
    pub max_gap_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkipStats {
    pub resolve_failed: u64,
    pub synthesis_failed: u64,
    pub audio_failed: u64,
    pub skipped_indices: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlStats {
    pub pauses: u64,
    pub resumes: u64,
    pub seeks: u64,
    pub speed_changes: u64,
    pub audio_failures: u64,
    pub finished: bool,
}

impl SkipStats {
    pub fn total(&self) -> u64 {
        self.resolve_failed + self.synthesis_failed + self.audio_failed
    }
}

pub fn compute_snapshot(events: &VecDeque<TelemetryEvent>) -> TelemetrySnapshot {
    let mut snap = TelemetrySnapshot::default();

    for event in events {
        match event {
            TelemetryEvent::SegmentScheduled { index, duration, rate, .. } => {
                snap.schedule_stats.scheduled += 1;
                if *rate > 0.0 {
                    snap.schedule_stats.total_audio_seconds += duration / *rate as f64;
                }
                snap.scheduled_order.push(*index);
            }
            TelemetryEvent::GapDetected { gap_seconds, .. } => {
                snap.gap_stats.count += 1;
                snap.gap_stats.total_gap_seconds += gap_seconds;
                if *gap_seconds > snap.gap_stats.max_gap_seconds {
                    snap.gap_stats.max_gap_seconds = *gap_seconds;
                }
            }
            TelemetryEvent::SegmentSkipped { index, reason } => {
                match reason {
                    SkipReason::ResolveFailed => snap.skip_stats.resolve_failed += 1,
                    SkipReason::SynthesisFailed => snap.skip_stats.synthesis_failed += 1,
                    SkipReason::AudioFailed => snap.skip_stats.audio_failed += 1,
                }
                snap.skip_stats.skipped_indices.push(*index);
            }
            TelemetryEvent::AudioFailure { .. } => snap.control_stats.audio_failures += 1,
            TelemetryEvent::Seek { .. } => snap.control_stats.seeks += 1,
            TelemetryEvent::Paused { .. } => snap.control_stats.pauses += 1,
            TelemetryEvent::Resumed { .. } => snap.control_stats.resumes += 1,
            TelemetryEvent::SpeedChanged { .. } => snap.control_stats.speed_changes += 1,
            TelemetryEvent::SessionFinished { .. } => snap.control_stats.finished = true,
        }
    }

    snap
}
