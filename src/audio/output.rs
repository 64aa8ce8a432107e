use std::sync::Arc;
use thiserror::Error;

use crate::kernel::audio::segment::DecodedSegment;
use crate::kernel::event::HandleId;
use crate::kernel::time::ClockTime;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("No output device: {0}")]
    Device(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Command queue full")]
    QueueFull,

    #[error("Audio output closed")]
    Closed,
}

/// A device that can play decoded segments at precise times on its own
/// monotonic clock.
///
/// Calls never block. Completion and asynchronous failures are reported
/// through the notice channel handed to the implementation at construction.
pub trait AudioOutput: Send {
    /// Current reading of the output clock, in seconds.
    fn now(&self) -> ClockTime;

    /// Device rate segments should be decoded to. None when any rate works.
    fn sample_rate(&self) -> Option<u32>;

    /// Schedule `segment` to start at `start_at` and play at `rate`.
    fn start(
        &mut self,
        handle: HandleId,
        segment: Arc<DecodedSegment>,
        start_at: ClockTime,
        rate: f32,
    ) -> Result<(), AudioError>;

    /// Silence a handle now. Unknown or finished handles are ignored.
    /// A stopped handle never reports `Ended`.
    fn stop(&mut self, handle: HandleId);

    fn set_rate(&mut self, handle: HandleId, rate: f32);

    /// Master volume in [0, 1].
    fn set_volume(&mut self, volume: f32);
}
