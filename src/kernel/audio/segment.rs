use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache identity of a segment. Segment ids are only unique within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub job_id: JobId,
    pub segment_id: String,
}

/// Normalized readiness. Engines report this with different words
/// ("ready" vs "completed"); only the synthesis adapters see those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentReadyState {
    Queued,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    Mpeg,
    Wav,
}

impl AudioFormat {
    /// Parse a MIME type or file extension hint.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim().to_ascii_lowercase();
        match hint.as_str() {
            "audio/mpeg" | "audio/mp3" | "mp3" | "mpeg" => Some(AudioFormat::Mpeg),
            "audio/wav" | "audio/x-wav" | "audio/wave" | "wav" | "wave" => Some(AudioFormat::Wav),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mpeg => "mp3",
            AudioFormat::Wav => "wav",
        }
    }
}

/// One synthesized unit of audio as known to the playback core.
///
/// `index` is the global playback order across all jobs of a session and is
/// never revised once assigned. `state` is the only field that changes
/// between successive poll reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub segment_id: String,
    pub job_id: JobId,
    pub state: SegmentReadyState,
    pub fetch_url: String,
    pub format: Option<AudioFormat>,
}

impl SegmentDescriptor {
    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            job_id: self.job_id.clone(),
            segment_id: self.segment_id.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SegmentReadyState::Ready
    }
}

/// Playback-ready audio: mono f32 samples at `sample_rate`.
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    pub key: SegmentKey,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_seconds: f64,
}

impl DecodedSegment {
    pub fn new(key: SegmentKey, samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration_seconds = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };
        Self {
            key,
            samples,
            sample_rate,
            duration_seconds,
        }
    }
}
