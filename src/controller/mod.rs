//! Public façade of the narration engine.
//!
//! `Narrator` turns UI calls into reactor commands. Submission to the
//! synthesis backend happens here, outside the reactor, so a slow backend
//! never stalls audio scheduling.

pub mod status;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::cpal_output::CpalOutput;
use crate::audio::decode::AudioDecoder;
use crate::audio::output::AudioOutput;
use crate::config::NarratorConfig;
use crate::error::{NarratorError, Result};
use crate::kernel::event::{AudioNotice, Command, Event, SeekTarget, SessionId, StopReason};
use crate::kernel::progress::ProgressSnapshot;
use crate::kernel::reactor::{Reactor, ReactorConfig, ReactorOutputs};
use crate::kernel::scheduler::{MAX_SPEED, MIN_SPEED};
use crate::kernel::telemetry::metrics::TelemetrySnapshot;
use crate::services::cache::{AudioFetcher, CacheStats, HttpFetcher, SegmentCache};
use crate::services::synthesis::http::HttpBackend;
use crate::services::synthesis::{
    HealthReport, SynthesisBackend, SynthesisClient, SynthesisOptions, Voice,
};
use crate::text;
use status::NarrationStatus;

const EVENT_CAPACITY: usize = 256;

/// A public operation, as seen by post-hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Play,
    Resume,
    Pause,
    Stop,
    Cancel,
    SetSpeed(f32),
    SkipForward(usize),
    SkipBackward(usize),
    SkipToSegment(usize),
    SetVolume(f32),
}

/// Runs after every public operation, in registration order.
pub trait PostHook: Send + Sync {
    fn after(&self, operation: &Operation, status: &NarrationStatus);
}

/// Logs every operation at debug level.
pub struct TraceHook;

impl PostHook for TraceHook {
    fn after(&self, operation: &Operation, status: &NarrationStatus) {
        debug!(?operation, state = ?status.state, index = ?status.current_index, "Operation applied");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub session: Option<SessionId>,
    pub telemetry: Option<TelemetrySnapshot>,
    pub cache: CacheStats,
}

/// I/O collaborators of a narrator. Production wiring lives in
/// [`Narrator::connect`]; tests pass fakes.
pub struct Collaborators {
    pub backend: Arc<dyn SynthesisBackend>,
    pub fetcher: Arc<dyn AudioFetcher>,
    pub output: Box<dyn AudioOutput>,
    pub notices: mpsc::UnboundedReceiver<AudioNotice>,
}

pub struct Narrator {
    events: mpsc::Sender<Event>,
    client: SynthesisClient,
    options: SynthesisOptions,
    generation: AtomicU64,
    status: watch::Receiver<NarrationStatus>,
    progress: watch::Receiver<Option<ProgressSnapshot>>,
    hooks: Vec<Arc<dyn PostHook>>,
    reactor: JoinHandle<()>,
}

impl Narrator {
    /// HTTP backend, HTTP fetcher and the default audio device.
    pub fn connect(config: &NarratorConfig) -> Result<Self> {
        config.validate()?;
        let backend = HttpBackend::new(&config.backend_url, config.request_timeout())?;
        let fetcher = HttpFetcher::new(config.request_timeout())?;
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let output = CpalOutput::open(config.output_sample_rate, notice_tx)?;
        Self::spawn(
            config,
            Collaborators {
                backend: Arc::new(backend),
                fetcher: Arc::new(fetcher),
                output: Box::new(output),
                notices,
            },
        )
    }

    /// Start the reactor on the current tokio runtime.
    pub fn spawn(config: &NarratorConfig, parts: Collaborators) -> Result<Self> {
        config.validate()?;
        let client = SynthesisClient::new(parts.backend, config.engine);
        let decoder = AudioDecoder::new(parts.output.sample_rate().or(config.output_sample_rate));
        let cache = SegmentCache::new(parts.fetcher, decoder);

        let reactor_config = ReactorConfig::from_config(config);
        let initial = NarrationStatus::idle(
            config.default_speed.clamp(MIN_SPEED, MAX_SPEED),
            config.default_volume.clamp(0.0, 1.0),
        );
        let (status_tx, status) = watch::channel(initial);
        let (progress_tx, progress) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let reactor = Reactor::new(
            events_rx,
            events_tx.clone(),
            parts.notices,
            parts.output,
            cache,
            client.clone(),
            reactor_config,
            ReactorOutputs {
                status: status_tx,
                progress: progress_tx,
            },
        );
        let reactor = tokio::spawn(reactor.run());
        info!(engine = %config.engine, backend = %config.backend_url, "Narrator ready");

        Ok(Self {
            events: events_tx,
            client,
            options: SynthesisOptions::from_config(config),
            generation: AtomicU64::new(0),
            status,
            progress,
            hooks: vec![Arc::new(TraceHook)],
            reactor,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Narrate `raw` chapter text.
    ///
    /// Resumes instead when paused on the same text. Otherwise the current
    /// session is torn down, the text is submitted, and a new session starts
    /// once submission succeeds, unless another play or stop came first.
    pub async fn play(&self, raw: &str) -> Result<NarrationStatus> {
        let prepared = text::preprocess(raw);
        if prepared.is_empty() {
            return Err(NarratorError::EmptyText);
        }
        let fingerprint = text::fingerprint(&prepared);
        let current = self.status();
        if current.is_paused() && current.fingerprint == Some(fingerprint) {
            return self.resume().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.request(Command::Stop {
            reason: StopReason::Superseded,
            generation,
        })
        .await?;

        let jobs = match self.client.submit(&prepared, &self.options).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Submission failed");
                if self.generation.load(Ordering::SeqCst) == generation {
                    let _ = self
                        .request(Command::Notice(format!("Synthesis request failed: {}", e)))
                        .await;
                }
                return Err(e.into());
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            info!(generation, "Play superseded during submission");
            self.client.cancel_all(&jobs).await;
            let status = self.status();
            self.run_hooks(&Operation::Play, &status);
            return Ok(status);
        }

        let status = self
            .request(Command::Begin {
                session: Uuid::new_v4(),
                generation,
                jobs,
                fingerprint,
                paragraphs: text::paragraphs(&prepared).len(),
            })
            .await?;
        self.run_hooks(&Operation::Play, &status);
        Ok(status)
    }

    pub async fn resume(&self) -> Result<NarrationStatus> {
        self.operate(Operation::Resume, Command::Resume).await
    }

    pub async fn pause(&self) -> Result<NarrationStatus> {
        self.operate(Operation::Pause, Command::Pause).await
    }

    /// Stop and discard the session. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<NarrationStatus> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.operate(
            Operation::Stop,
            Command::Stop {
                reason: StopReason::Stopped,
                generation,
            },
        )
        .await
    }

    /// Like stop, reported as a cancellation.
    pub async fn cancel(&self) -> Result<NarrationStatus> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.operate(
            Operation::Cancel,
            Command::Stop {
                reason: StopReason::Cancelled,
                generation,
            },
        )
        .await
    }

    /// Clamped to 0.5..=3.0.
    pub async fn set_speed(&self, speed: f32) -> Result<NarrationStatus> {
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        self.operate(Operation::SetSpeed(speed), Command::SetSpeed(speed)).await
    }

    pub async fn skip_forward(&self, segments: usize) -> Result<NarrationStatus> {
        self.operate(
            Operation::SkipForward(segments),
            Command::Seek(SeekTarget::Forward(segments)),
        )
        .await
    }

    pub async fn skip_backward(&self, segments: usize) -> Result<NarrationStatus> {
        self.operate(
            Operation::SkipBackward(segments),
            Command::Seek(SeekTarget::Backward(segments)),
        )
        .await
    }

    pub async fn skip_to_segment(&self, index: usize) -> Result<NarrationStatus> {
        self.operate(
            Operation::SkipToSegment(index),
            Command::Seek(SeekTarget::Segment(index)),
        )
        .await
    }

    /// Clamped to 0..=1.
    pub async fn set_volume(&self, volume: f32) -> Result<NarrationStatus> {
        let volume = volume.clamp(0.0, 1.0);
        self.operate(Operation::SetVolume(volume), Command::SetVolume(volume)).await
    }

    pub fn status(&self) -> NarrationStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NarrationStatus> {
        self.status.clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.progress.clone()
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Diagnostics(tx))
            .await
            .map_err(|_| NarratorError::EngineClosed)?;
        rx.await.map_err(|_| NarratorError::EngineClosed)
    }

    pub async fn voices(&self) -> Result<Vec<Voice>> {
        Ok(self.client.list_voices().await?)
    }

    pub async fn backend_health(&self) -> Result<HealthReport> {
        Ok(self.client.health().await?)
    }

    /// Tear everything down and wait for the reactor to exit.
    pub async fn shutdown(self) {
        let _ = self.events.send(Event::command(Command::Shutdown)).await;
        let _ = self.reactor.await;
    }

    async fn operate(&self, operation: Operation, command: Command) -> Result<NarrationStatus> {
        let status = self.request(command).await?;
        self.run_hooks(&operation, &status);
        Ok(status)
    }

    async fn request(&self, command: Command) -> Result<NarrationStatus> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(Event::Command {
                command,
                ack: Some(ack),
            })
            .await
            .map_err(|_| NarratorError::EngineClosed)?;
        done.await.map_err(|_| NarratorError::EngineClosed)
    }

    fn run_hooks(&self, operation: &Operation, status: &NarrationStatus) {
        for hook in &self.hooks {
            hook.after(operation, status);
        }
    }
}
