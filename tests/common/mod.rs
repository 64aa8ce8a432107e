#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use narrator::kernel::audio::segment::JobId;
use narrator::services::cache::{AudioFetcher, CacheError};
use narrator::services::synthesis::{
    CancelRoute, Engine, HealthReport, JobRequest, RawJobStatus, RawSegment, SynthesisBackend,
    SynthesisError, Voice,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub fn wav_bytes(frames: usize, rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec).unwrap();
        for i in 0..frames {
            writer.write_sample(((i % 50) as i16) * 200).unwrap();
        }
        writer.finalize().unwrap();
    }
    buffer
}

/// In-memory job service.
///
/// With `auto_complete` every job finishes at creation with
/// `segments_per_job` segments. Otherwise jobs stay "processing" until a
/// test sets their status.
pub struct FakeBackend {
    pub engine: Engine,
    pub segments_per_job: usize,
    pub auto_complete: AtomicBool,
    next_id: AtomicU64,
    pub created: Mutex<Vec<JobRequest>>,
    pub cancelled: Mutex<Vec<(JobId, CancelRoute)>>,
    pub fail_create_at: Mutex<Option<usize>>,
    statuses: Mutex<HashMap<JobId, RawJobStatus>>,
    pub poll_errors: AtomicU32,
    pub polls: AtomicU64,
}

impl FakeBackend {
    pub fn new(engine: Engine, segments_per_job: usize) -> Self {
        Self {
            engine,
            segments_per_job,
            auto_complete: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_create_at: Mutex::new(None),
            statuses: Mutex::new(HashMap::new()),
            poll_errors: AtomicU32::new(0),
            polls: AtomicU64::new(0),
        }
    }

    pub fn manual(engine: Engine) -> Self {
        let backend = Self::new(engine, 1);
        backend.auto_complete.store(false, Ordering::SeqCst);
        backend
    }

    pub fn ready_word(&self) -> &'static str {
        match self.engine {
            Engine::PronounceX => "ready",
            _ => "completed",
        }
    }

    pub fn complete_word(&self) -> &'static str {
        match self.engine {
            Engine::PronounceX => "complete",
            _ => "completed",
        }
    }

    pub fn segment(&self, job: &JobId, index: usize) -> RawSegment {
        RawSegment {
            id: format!("{}", index),
            index: Some(index),
            status: self.ready_word().to_string(),
            url: format!("http://fake/{}/{}.wav", job, index),
            format: Some("wav".to_string()),
        }
    }

    pub fn set_status(&self, job: &JobId, status: RawJobStatus) {
        self.statuses.lock().unwrap().insert(job.clone(), status);
    }

    /// Finish `job` with its full segment list.
    pub fn complete(&self, job: &JobId) {
        let segments = (0..self.segments_per_job).map(|i| self.segment(job, i)).collect();
        self.set_status(
            job,
            RawJobStatus {
                status: self.complete_word().to_string(),
                segments,
                error: None,
            },
        );
    }

    pub fn forget(&self, job: &JobId) {
        self.statuses.lock().unwrap().remove(job);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn cancelled_ids(&self) -> Vec<JobId> {
        self.cancelled.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl SynthesisBackend for FakeBackend {
    async fn create_job(&self, request: &JobRequest) -> Result<JobId, SynthesisError> {
        let ordinal = self.created.lock().unwrap().len();
        if *self.fail_create_at.lock().unwrap() == Some(ordinal) {
            return Err(SynthesisError::Status {
                code: 500,
                message: "engine crashed".to_string(),
            });
        }
        self.created.lock().unwrap().push(request.clone());
        let job = JobId(format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        if self.auto_complete.load(Ordering::SeqCst) {
            self.complete(&job);
        } else {
            self.set_status(
                &job,
                RawJobStatus {
                    status: "processing".to_string(),
                    segments: Vec::new(),
                    error: None,
                },
            );
        }
        Ok(job)
    }

    async fn job_status(&self, job: &JobId) -> Result<RawJobStatus, SynthesisError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let pending_errors = self.poll_errors.load(Ordering::SeqCst);
        if pending_errors > 0 {
            self.poll_errors.store(pending_errors - 1, Ordering::SeqCst);
            return Err(SynthesisError::Status {
                code: 503,
                message: "unavailable".to_string(),
            });
        }
        self.statuses
            .lock()
            .unwrap()
            .get(job)
            .cloned()
            .ok_or_else(|| SynthesisError::NotFound(job.clone()))
    }

    async fn cancel_job(&self, job: &JobId, route: CancelRoute) -> Result<(), SynthesisError> {
        self.cancelled.lock().unwrap().push((job.clone(), route));
        if self.statuses.lock().unwrap().contains_key(job) {
            Ok(())
        } else {
            Err(SynthesisError::NotFound(job.clone()))
        }
    }

    async fn voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        Ok(vec![Voice {
            id: "en-US-AriaNeural".to_string(),
            name: Some("Aria".to_string()),
            short_name: None,
            gender: Some("Female".to_string()),
            locale: Some("en-US".to_string()),
        }])
    }

    async fn health(&self) -> Result<HealthReport, SynthesisError> {
        Ok(HealthReport {
            status: "healthy".to_string(),
            details: serde_json::Map::new(),
        })
    }
}

/// Serves a fixed-length WAV for every URL. URLs containing "missing" 404.
pub struct WavFetcher {
    pub body: Vec<u8>,
    pub fetches: AtomicU64,
}

impl WavFetcher {
    /// `seconds` of audio at 8 kHz.
    pub fn new(seconds: f64) -> Self {
        Self {
            body: wav_bytes((seconds * 8000.0) as usize, 8000),
            fetches: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl AudioFetcher for WavFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if url.contains("missing") {
            return Err(CacheError::Status {
                url: url.to_string(),
                code: 404,
            });
        }
        Ok(Bytes::from(self.body.clone()))
    }
}
