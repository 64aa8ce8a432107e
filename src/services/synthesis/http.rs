use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::engine::CancelRoute;
use super::{
    HealthReport, JobRequest, RawJobStatus, RawSegment, SynthesisBackend, SynthesisError, Voice,
};
use crate::kernel::audio::segment::JobId;

/// The job API over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

#[derive(Serialize)]
struct CreateJobBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_id: Option<&'a str>,
    prefer_phonemes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reading_profile: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateJobResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatusResponse {
    status: String,
    #[serde(default)]
    segments: Vec<SegmentWire>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SegmentWire {
    #[serde(alias = "segment_id")]
    id: String,
    #[serde(default)]
    index: Option<usize>,
    status: String,
    #[serde(alias = "url")]
    audio_url: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<Voice>,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SynthesisError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SynthesisError::InvalidResponse(format!("bad backend url '{}': {}", base_url, e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, SynthesisError> {
        resolve_url(&self.base_url, path)
    }
}

/// Absolute URLs pass through; relative ones are joined onto the base.
pub fn resolve_url(base: &Url, path: &str) -> Result<Url, SynthesisError> {
    base.join(path)
        .map_err(|e| SynthesisError::InvalidResponse(format!("bad url '{}': {}", path, e)))
}

async fn error_for(response: reqwest::Response) -> SynthesisError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    SynthesisError::Status {
        code: status.as_u16(),
        message: body,
    }
}

#[async_trait]
impl SynthesisBackend for HttpBackend {
    async fn create_job(&self, request: &JobRequest) -> Result<JobId, SynthesisError> {
        let body = CreateJobBody {
            text: &request.text,
            voice: request.voice.as_deref(),
            model_id: request.model_id.as_deref(),
            prefer_phonemes: request.prefer_phonemes,
            reading_profile: request.reading_profile.as_deref(),
        };
        let response = self
            .client
            .post(self.endpoint("/v1/tts/jobs")?)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        let created: CreateJobResponse = response.json().await?;
        debug!(job = %created.job_id, chars = request.text.len(), "Job created");
        Ok(JobId(created.job_id))
    }

    async fn job_status(&self, job: &JobId) -> Result<RawJobStatus, SynthesisError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/v1/tts/jobs/{}", job))?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SynthesisError::NotFound(job.clone()));
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        let wire: JobStatusResponse = response.json().await?;

        let mut segments = Vec::with_capacity(wire.segments.len());
        for s in wire.segments {
            let url = match s.audio_url {
                Some(u) => resolve_url(&self.base_url, &u)?.to_string(),
                None => String::new(),
            };
            segments.push(RawSegment {
                id: s.id,
                index: s.index,
                status: s.status,
                url,
                format: s.format,
            });
        }
        Ok(RawJobStatus {
            status: wire.status,
            segments,
            error: wire.error,
        })
    }

    async fn cancel_job(&self, job: &JobId, route: CancelRoute) -> Result<(), SynthesisError> {
        let request = match route {
            CancelRoute::PostCancel => self
                .client
                .post(self.endpoint(&format!("/v1/tts/jobs/{}/cancel", job))?),
            CancelRoute::Delete => self
                .client
                .delete(self.endpoint(&format!("/v1/tts/jobs/{}", job))?),
        };
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SynthesisError::NotFound(job.clone()));
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        Ok(())
    }

    async fn voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        let response = self.client.get(self.endpoint("/v1/tts/voices")?).send().await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        let wire: VoicesResponse = response.json().await?;
        Ok(wire.voices)
    }

    async fn health(&self) -> Result<HealthReport, SynthesisError> {
        let response = self.client.get(self.endpoint("/health")?).send().await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        Ok(response.json().await?)
    }
}
