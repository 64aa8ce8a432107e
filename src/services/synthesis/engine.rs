use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::kernel::audio::segment::{AudioFormat, SegmentReadyState};

/// Job-level status after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Processing,
    Complete,
    Error,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error | JobState::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRoute {
    /// `POST /v1/tts/jobs/{id}/cancel`
    PostCancel,
    /// `DELETE /v1/tts/jobs/{id}`
    Delete,
}

/// Which synthesis service sits behind the backend URL. Each one speaks a
/// slightly different dialect of the same job API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    /// Multi-segment jobs; segments report "ready".
    #[serde(alias = "pronouncex")]
    PronounceX,
    /// One mp3 segment per job.
    #[default]
    EdgeTts,
    Espeak,
    Bark,
}

impl Engine {
    /// Upper bound on characters per job, if the engine has one.
    pub fn chunk_limit(&self) -> Option<usize> {
        match self {
            Engine::PronounceX => None,
            Engine::EdgeTts => Some(3000),
            Engine::Espeak => Some(5000),
            Engine::Bark => Some(500),
        }
    }

    /// Segments per job when the engine fixes it.
    pub fn segments_per_job(&self) -> Option<usize> {
        match self {
            Engine::PronounceX => None,
            _ => Some(1),
        }
    }

    pub fn cancel_route(&self) -> CancelRoute {
        match self {
            Engine::PronounceX => CancelRoute::PostCancel,
            _ => CancelRoute::Delete,
        }
    }

    pub fn default_format(&self) -> AudioFormat {
        match self {
            Engine::EdgeTts => AudioFormat::Mpeg,
            _ => AudioFormat::Wav,
        }
    }

    pub fn segment_state(&self, word: &str) -> SegmentReadyState {
        let word = word.trim().to_ascii_lowercase();
        match self {
            Engine::PronounceX => match word.as_str() {
                "ready" | "complete" => SegmentReadyState::Ready,
                "error" | "failed" | "canceled" | "cancelled" => SegmentReadyState::Failed,
                _ => SegmentReadyState::Queued,
            },
            Engine::EdgeTts | Engine::Espeak | Engine::Bark => match word.as_str() {
                "completed" | "complete" => SegmentReadyState::Ready,
                "failed" | "error" => SegmentReadyState::Failed,
                _ => SegmentReadyState::Queued,
            },
        }
    }

    /// Unknown words count as still in progress.
    pub fn job_state(&self, word: &str) -> JobState {
        let word = word.trim().to_ascii_lowercase();
        match self {
            Engine::PronounceX => match word.as_str() {
                "queued" => JobState::Queued,
                "complete" => JobState::Complete,
                "error" => JobState::Error,
                "canceled" | "cancelled" => JobState::Canceled,
                // "ready" at job level means some segments are out, not all.
                _ => JobState::Processing,
            },
            Engine::EdgeTts | Engine::Espeak | Engine::Bark => match word.as_str() {
                "pending" => JobState::Queued,
                "completed" => JobState::Complete,
                "failed" => JobState::Error,
                "canceled" | "cancelled" => JobState::Canceled,
                _ => JobState::Processing,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::PronounceX => "pronouncex",
            Engine::EdgeTts => "edge-tts",
            Engine::Espeak => "espeak",
            Engine::Bark => "bark",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pronouncex" | "pronounce-x" => Ok(Engine::PronounceX),
            "edge-tts" | "edge" | "edgetts" => Ok(Engine::EdgeTts),
            "espeak" | "espeak-ng" => Ok(Engine::Espeak),
            "bark" => Ok(Engine::Bark),
            other => Err(format!("unknown engine '{}'", other)),
        }
    }
}
