use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::audio::segment::{JobId, SegmentDescriptor};
use crate::controller::status::NarrationStatus;
use crate::controller::Diagnostics;
use crate::services::synthesis::{JobSet, JobState};

/// Identity of one play() call. Events tagged with an older id are stale.
pub type SessionId = Uuid;

/// One scheduled playback of one segment on the audio output.
/// Allocated by the scheduler, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// Notices pushed by the audio output from its own thread.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioNotice {
    /// The handle played to its natural end.
    Ended(HandleId),
    /// The device failed while the handle was playing.
    Failed { handle: HandleId, message: String },
    /// The stream itself broke; whatever is audible is lost.
    DeviceError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Forward(usize),
    Backward(usize),
    Segment(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stopped,
    Cancelled,
    Superseded,
}

#[derive(Debug)]
pub enum Command {
    /// Start a fresh session for already-submitted jobs.
    Begin {
        session: SessionId,
        generation: u64,
        jobs: JobSet,
        fingerprint: u64,
        paragraphs: usize,
    },
    Pause,
    Resume,
    /// Tear down the current session. Also retires every `Begin` with an
    /// older generation that has not arrived yet.
    Stop { reason: StopReason, generation: u64 },
    SetSpeed(f32),
    SetVolume(f32),
    Seek(SeekTarget),
    /// Surface a message without changing state (submission failures).
    Notice(String),
    Shutdown,
}

/// Everything the reactor reacts to.
#[derive(Debug)]
pub enum Event {
    Command {
        command: Command,
        ack: Option<oneshot::Sender<NarrationStatus>>,
    },

    SynthesisReport {
        session: SessionId,
        segments: Vec<SegmentDescriptor>,
        jobs: Vec<(JobId, JobState)>,
        overall: JobState,
        error: Option<String>,
    },

    SynthesisUnreachable {
        session: SessionId,
        consecutive_failures: u32,
    },

    SegmentResolved {
        session: SessionId,
        index: usize,
        outcome: Result<(), String>,
    },

    Audio(AudioNotice),

    Diagnostics(oneshot::Sender<Diagnostics>),
}

impl Event {
    pub fn command(command: Command) -> Self {
        Event::Command { command, ack: None }
    }
}
