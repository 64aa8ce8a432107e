use serde::{Deserialize, Serialize};

use crate::kernel::event::SessionId;
use crate::kernel::playback::PlaybackState;

/// How the last session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// Everything was played. `advance` asks the reader to load the next chapter.
    Finished { advance: bool },
    Stopped,
    Cancelled,
    Superseded,
    /// Too many consecutive audio device failures.
    AudioError(String),
    /// Synthesis ended in error or was canceled by the backend. Whatever
    /// had been produced was played.
    SynthesisFailed(String),
}

/// Snapshot published to the UI after every reactor step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationStatus {
    pub state: PlaybackState,
    pub session: Option<SessionId>,
    pub fingerprint: Option<u64>,
    /// Segment being heard, or the last one scheduled.
    pub current_index: Option<usize>,
    pub total_segments: usize,
    pub synthesis_complete: bool,
    pub speed: f32,
    pub volume: f32,
    pub outcome: Option<SessionOutcome>,
    /// Non-blocking notice for the UI (backend unreachable, submission failed).
    pub message: Option<String>,
}

impl NarrationStatus {
    pub fn idle(speed: f32, volume: f32) -> Self {
        Self {
            state: PlaybackState::Idle,
            session: None,
            fingerprint: None,
            current_index: None,
            total_segments: 0,
            synthesis_complete: false,
            speed,
            volume,
            outcome: None,
            message: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state == PlaybackState::Paused
    }
}
