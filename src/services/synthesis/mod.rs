//! Client for the synthesis job service.
//!
//! Engines disagree on status words and on how many segments a job yields;
//! everything leaving this module is normalized into `SegmentDescriptor`s
//! with global indices and a single `JobState`.

pub mod chunker;
pub mod engine;
pub mod http;
pub mod indexer;
pub mod poller;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NarratorConfig;
use crate::kernel::audio::segment::{JobId, SegmentDescriptor};

pub use engine::{CancelRoute, Engine, JobState};

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No text to synthesize")]
    EmptyText,
}

/// Body of one job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub text: String,
    pub voice: Option<String>,
    pub model_id: Option<String>,
    pub prefer_phonemes: bool,
    pub reading_profile: Option<String>,
}

/// Per-call synthesis options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub voice: Option<String>,
    pub model_id: Option<String>,
    pub prefer_phonemes: bool,
    pub reading_profile: Option<String>,
}

impl SynthesisOptions {
    pub fn from_config(config: &NarratorConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            model_id: config.model_id.clone(),
            prefer_phonemes: config.prefer_phonemes,
            reading_profile: config.reading_profile.clone(),
        }
    }

    fn request(&self, text: String) -> JobRequest {
        JobRequest {
            text,
            voice: self.voice.clone(),
            model_id: self.model_id.clone(),
            prefer_phonemes: self.prefer_phonemes,
            reading_profile: self.reading_profile.clone(),
        }
    }
}

/// A segment exactly as the backend reported it, URL already absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegment {
    pub id: String,
    pub index: Option<usize>,
    pub status: String,
    pub url: String,
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawJobStatus {
    pub status: String,
    pub segments: Vec<RawSegment>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "healthy" | "ok")
    }
}

/// Transport seam for the job service.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn create_job(&self, request: &JobRequest) -> Result<JobId, SynthesisError>;
    async fn job_status(&self, job: &JobId) -> Result<RawJobStatus, SynthesisError>;
    async fn cancel_job(&self, job: &JobId, route: CancelRoute) -> Result<(), SynthesisError>;
    async fn voices(&self) -> Result<Vec<Voice>, SynthesisError>;
    async fn health(&self) -> Result<HealthReport, SynthesisError>;
}

/// One submitted job and what we last heard about it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub ordinal: usize,
    pub state: JobState,
    pub segments: Vec<RawSegment>,
    pub error: Option<String>,
}

impl JobHandle {
    fn new(job_id: JobId, ordinal: usize) -> Self {
        Self {
            job_id,
            ordinal,
            state: JobState::Queued,
            segments: Vec::new(),
            error: None,
        }
    }
}

/// The jobs of one play() call, in text order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSet {
    jobs: Vec<JobHandle>,
}

impl JobSet {
    pub fn jobs(&self) -> &[JobHandle] {
        &self.jobs
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.job_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Take per-job states from a poll report. Unknown ids are ignored.
    pub fn apply_states(&mut self, states: &[(JobId, JobState)]) {
        for (id, state) in states {
            if let Some(job) = self.jobs.iter_mut().find(|j| &j.job_id == id) {
                job.state = *state;
            }
        }
    }

    /// Jobs the backend may still be working on.
    pub fn running(&self) -> JobSet {
        JobSet {
            jobs: self.jobs.iter().filter(|j| !j.state.is_terminal()).cloned().collect(),
        }
    }

    /// Mark every running job canceled and return them for cancellation.
    pub fn withdraw_running(&mut self) -> JobSet {
        let running = self.running();
        for job in self.jobs.iter_mut().filter(|j| !j.state.is_terminal()) {
            job.state = JobState::Canceled;
        }
        running
    }

    fn push(&mut self, job_id: JobId) {
        let ordinal = self.jobs.len();
        self.jobs.push(JobHandle::new(job_id, ordinal));
    }
}

/// Merged view over every job of a set.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedStatus {
    pub segments: Vec<SegmentDescriptor>,
    /// Every job's state, in text order.
    pub jobs: Vec<(JobId, JobState)>,
    pub overall: JobState,
    pub error: Option<String>,
}

/// Precedence: error > canceled > processing > complete. Queued counts as
/// processing. An empty set is complete.
pub fn combine_states<I: IntoIterator<Item = JobState>>(states: I) -> JobState {
    let mut any_error = false;
    let mut any_canceled = false;
    let mut any_running = false;
    for state in states {
        match state {
            JobState::Error => any_error = true,
            JobState::Canceled => any_canceled = true,
            JobState::Queued | JobState::Processing => any_running = true,
            JobState::Complete => {}
        }
    }
    if any_error {
        JobState::Error
    } else if any_canceled {
        JobState::Canceled
    } else if any_running {
        JobState::Processing
    } else {
        JobState::Complete
    }
}

#[derive(Clone)]
pub struct SynthesisClient {
    backend: Arc<dyn SynthesisBackend>,
    engine: Engine,
}

impl SynthesisClient {
    pub fn new(backend: Arc<dyn SynthesisBackend>, engine: Engine) -> Self {
        Self { backend, engine }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Submit `text` as one job, or one job per chunk for engines with a
    /// request bound. All-or-nothing: on failure, jobs already created by
    /// this call are cancelled before the error is returned.
    pub async fn submit(&self, text: &str, options: &SynthesisOptions) -> Result<JobSet, SynthesisError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SynthesisError::EmptyText);
        }
        let chunks = match self.engine.chunk_limit() {
            Some(limit) => chunker::chunk_text(text, limit),
            None => vec![text.to_string()],
        };

        let mut jobs = JobSet::default();
        for (ordinal, chunk) in chunks.into_iter().enumerate() {
            match self.backend.create_job(&options.request(chunk)).await {
                Ok(job_id) => jobs.push(job_id),
                Err(e) => {
                    warn!(ordinal, error = %e, "Submission failed, rolling back {} job(s)", jobs.len());
                    self.cancel_all(&jobs).await;
                    return Err(e);
                }
            }
        }
        info!(engine = %self.engine, jobs = jobs.len(), "Submitted narration");
        Ok(jobs)
    }

    /// Poll every non-terminal job concurrently and merge.
    ///
    /// Successful reports are applied even when another job's poll failed;
    /// the first failure is then returned so the caller can retry.
    pub async fn poll_combined(&self, jobs: &mut JobSet) -> Result<CombinedStatus, SynthesisError> {
        let targets: Vec<usize> = jobs
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| !j.state.is_terminal())
            .map(|(i, _)| i)
            .collect();

        let requests = targets.iter().map(|&i| {
            let backend = self.backend.clone();
            let job_id = jobs.jobs[i].job_id.clone();
            async move { backend.job_status(&job_id).await }
        });
        let results = join_all(requests).await;

        let mut first_error = None;
        for (i, result) in targets.into_iter().zip(results) {
            let job = &mut jobs.jobs[i];
            match result {
                Ok(raw) => {
                    job.state = self.engine.job_state(&raw.status);
                    job.segments = raw.segments;
                    job.error = raw.error;
                }
                Err(SynthesisError::NotFound(_)) => {
                    // Removed on the backend side; nothing more will come.
                    debug!(job = %job.job_id, "Job vanished, treating as canceled");
                    job.state = JobState::Canceled;
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let overall = combine_states(jobs.jobs.iter().map(|j| j.state));
        let error = jobs.jobs.iter().find_map(|j| j.error.clone());
        Ok(CombinedStatus {
            segments: indexer::assign_indices(self.engine, &jobs.jobs),
            jobs: jobs.jobs.iter().map(|j| (j.job_id.clone(), j.state)).collect(),
            overall,
            error,
        })
    }

    /// Best effort. A job the backend no longer knows is already cancelled.
    pub async fn cancel(&self, job: &JobId) -> Result<(), SynthesisError> {
        match self.backend.cancel_job(job, self.engine.cancel_route()).await {
            Ok(()) | Err(SynthesisError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_all(&self, jobs: &JobSet) {
        let cancels = jobs.jobs.iter().map(|j| async move {
            if let Err(e) = self.cancel(&j.job_id).await {
                warn!(job = %j.job_id, error = %e, "Cancel failed");
            }
        });
        join_all(cancels).await;
    }

    pub async fn list_voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        self.backend.voices().await
    }

    pub async fn health(&self) -> Result<HealthReport, SynthesisError> {
        self.backend.health().await
    }
}
