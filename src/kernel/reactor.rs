use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audio::segment::SegmentDescriptor;
use super::event::{AudioNotice, Command, Event, HandleId, SessionId, StopReason};
use super::playback::PlaybackState;
use super::progress::{ProgressSnapshot, ProgressTracker};
use super::scheduler::{Scheduler, SchedulerConfig, SideEffect, MAX_SPEED, MIN_SPEED};
use super::session::PlaybackSession;
use super::telemetry::metrics::TelemetrySnapshot;
use super::time::Timing;
use crate::audio::output::AudioOutput;
use crate::config::NarratorConfig;
use crate::controller::status::{NarrationStatus, SessionOutcome};
use crate::controller::Diagnostics;
use crate::services::cache::SegmentCache;
use crate::services::synthesis::poller::{run_poll_loop, PollSettings};
use crate::services::synthesis::{JobSet, JobState, SynthesisClient};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReactorConfig {
    pub scheduler: SchedulerConfig,
    pub poll: PollSettings,
    pub progress_interval: Duration,
    pub default_speed: f32,
    pub default_volume: f32,
    pub auto_advance: bool,
}

impl ReactorConfig {
    pub fn from_config(config: &NarratorConfig) -> Self {
        Self {
            scheduler: SchedulerConfig {
                timing: Timing::from_millis(config.settle_delay_ms, config.safety_margin_ms),
                preload_ahead: config.preload_ahead,
                max_audio_failures: config.max_audio_failures,
            },
            poll: PollSettings::from_config(config),
            progress_interval: config.progress_interval(),
            default_speed: config.default_speed,
            default_volume: config.default_volume,
            auto_advance: config.auto_advance,
        }
    }
}

/// Everything that belongs to the one live session.
struct ActiveSession {
    session: PlaybackSession,
    jobs: JobSet,
    token: CancellationToken,
    fingerprint: u64,
    tracker: ProgressTracker,
    synthesis_error: Option<String>,
}

/// Channels the reactor publishes on.
pub struct ReactorOutputs {
    pub status: watch::Sender<NarrationStatus>,
    pub progress: watch::Sender<Option<ProgressSnapshot>>,
}

/// Single owner of session state, the audio output and the cache handle.
///
/// Each event is handled in one synchronous step: the kernel decides, then
/// the returned side effects are executed before the next event is read.
pub struct Reactor {
    events: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    notices: mpsc::UnboundedReceiver<AudioNotice>,
    output: Box<dyn AudioOutput>,
    cache: SegmentCache,
    client: SynthesisClient,
    scheduler: Scheduler,
    config: ReactorConfig,
    active: Option<ActiveSession>,
    generation: u64,
    speed: f32,
    volume: f32,
    outcome: Option<SessionOutcome>,
    message: Option<String>,
    last_telemetry: Option<TelemetrySnapshot>,
    publish: ReactorOutputs,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: mpsc::Receiver<Event>,
        events_tx: mpsc::Sender<Event>,
        notices: mpsc::UnboundedReceiver<AudioNotice>,
        mut output: Box<dyn AudioOutput>,
        cache: SegmentCache,
        client: SynthesisClient,
        config: ReactorConfig,
        publish: ReactorOutputs,
    ) -> Self {
        let speed = config.default_speed.clamp(MIN_SPEED, MAX_SPEED);
        let volume = config.default_volume.clamp(0.0, 1.0);
        output.set_volume(volume);
        Self {
            events,
            events_tx,
            notices,
            output,
            cache,
            client,
            scheduler: Scheduler::new(config.scheduler),
            config,
            active: None,
            generation: 0,
            speed,
            volume,
            outcome: None,
            message: None,
            last_telemetry: None,
            publish,
        }
    }

    /// Async driver loop. Returns after `Shutdown`.
    pub async fn run(mut self) {
        info!("Narration reactor started");
        let mut cadence = interval(self.config.progress_interval);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if !self.step(event) {
                        break;
                    }
                }
                Some(notice) = self.notices.recv() => {
                    self.step(Event::Audio(notice));
                }
                _ = cadence.tick() => self.publish_progress(),
            }
        }

        self.teardown(SessionOutcome::Stopped);
        self.publish_status();
        info!("Narration reactor stopped");
    }

    /// Handle one event to completion. Returns false on shutdown.
    pub fn step(&mut self, event: Event) -> bool {
        let now = self.output.now();
        let mut effects = Vec::new();
        let mut running = true;

        match event {
            Event::Command { command, ack } => {
                running = self.apply_command(command, now, &mut effects);
                self.run_effects(effects);
                let status = self.publish_status();
                if let Some(ack) = ack {
                    let _ = ack.send(status);
                }
                return running;
            }

            Event::SynthesisReport {
                session,
                segments,
                jobs,
                overall,
                error,
            } => {
                let mut stragglers = None;
                if let Some(active) = live(&mut self.active, session) {
                    active.jobs.apply_states(&jobs);
                    if matches!(overall, JobState::Error | JobState::Canceled) {
                        warn!(%session, ?overall, ?error, "Synthesis ended early");
                        let reason = error.unwrap_or_else(|| format!("synthesis {:?}", overall));
                        self.message = Some(reason.clone());
                        active.synthesis_error.get_or_insert(reason);
                        // Nobody polls the other jobs any more.
                        stragglers = Some(active.jobs.withdraw_running());
                    } else if self.message.is_some() {
                        // Backend answered again.
                        self.message = None;
                    }
                    effects = self.scheduler.ingest(
                        &mut active.session,
                        segments,
                        overall.is_terminal(),
                        now,
                        &self.cache,
                    );
                }
                if let Some(jobs) = stragglers {
                    self.spawn_cancel(jobs);
                }
            }

            Event::SynthesisUnreachable {
                session,
                consecutive_failures,
            } => {
                if live(&mut self.active, session).is_some() {
                    self.message = Some(format!(
                        "Synthesis backend unreachable ({} failed polls), retrying",
                        consecutive_failures
                    ));
                }
            }

            Event::SegmentResolved {
                session,
                index,
                outcome,
            } => {
                if let Some(active) = live(&mut self.active, session) {
                    if let Err(e) = &outcome {
                        warn!(index, error = %e, "Segment could not be resolved");
                    }
                    effects =
                        self.scheduler
                            .on_resolved(&mut active.session, index, outcome.is_ok(), now, &self.cache);
                }
            }

            Event::Audio(notice) => {
                effects = self.on_notice(notice, now);
            }

            Event::Diagnostics(reply) => {
                self.reply_diagnostics(reply);
            }
        }

        self.run_effects(effects);
        self.publish_status();
        running
    }

    fn apply_command(&mut self, command: Command, now: f64, effects: &mut Vec<SideEffect>) -> bool {
        match command {
            Command::Begin {
                session,
                generation,
                jobs,
                fingerprint,
                paragraphs,
            } => {
                if generation < self.generation {
                    info!(%session, generation, current = self.generation, "Discarding superseded play");
                    self.spawn_cancel(jobs);
                    return true;
                }
                self.generation = generation;
                self.teardown(SessionOutcome::Superseded);
                self.begin(session, jobs, fingerprint, paragraphs, now, effects);
            }
            Command::Pause => {
                if let Some(active) = self.active.as_mut() {
                    effects.extend(self.scheduler.pause(&mut active.session, now));
                }
            }
            Command::Resume => {
                if let Some(active) = self.active.as_mut() {
                    effects.extend(self.scheduler.resume(&mut active.session, now, &self.cache));
                }
            }
            Command::Stop { reason, generation } => {
                self.generation = self.generation.max(generation);
                let outcome = match reason {
                    StopReason::Stopped => SessionOutcome::Stopped,
                    StopReason::Cancelled => SessionOutcome::Cancelled,
                    StopReason::Superseded => SessionOutcome::Superseded,
                };
                self.teardown(outcome);
            }
            Command::SetSpeed(speed) => {
                self.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
                if let Some(active) = self.active.as_mut() {
                    effects.extend(self.scheduler.set_speed(&mut active.session, self.speed, now, &self.cache));
                }
            }
            Command::SetVolume(volume) => {
                self.volume = volume.clamp(0.0, 1.0);
                self.output.set_volume(self.volume);
            }
            Command::Seek(target) => {
                if let Some(active) = self.active.as_mut() {
                    effects.extend(self.scheduler.seek(&mut active.session, target, now, &self.cache));
                }
            }
            Command::Notice(message) => {
                self.message = Some(message);
            }
            Command::Shutdown => {
                self.teardown(SessionOutcome::Stopped);
                return false;
            }
        }
        true
    }

    fn begin(
        &mut self,
        id: SessionId,
        jobs: JobSet,
        fingerprint: u64,
        paragraphs: usize,
        now: f64,
        effects: &mut Vec<SideEffect>,
    ) {
        let token = CancellationToken::new();
        tokio::spawn(run_poll_loop(
            self.client.clone(),
            jobs.clone(),
            id,
            self.events_tx.clone(),
            token.clone(),
            self.config.poll,
        ));

        let mut active = ActiveSession {
            session: PlaybackSession::new(id, self.speed),
            jobs,
            token,
            fingerprint,
            tracker: ProgressTracker::new(paragraphs),
            synthesis_error: None,
        };
        effects.extend(self.scheduler.start(&mut active.session, now, &self.cache));
        info!(session = %id, jobs = active.jobs.len(), paragraphs, "Narration started");
        self.active = Some(active);
        self.outcome = None;
        self.message = None;
    }

    fn on_notice(&mut self, notice: AudioNotice, now: f64) -> Vec<SideEffect> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        match notice {
            AudioNotice::Ended(handle) => {
                self.scheduler
                    .on_handle_ended(&mut active.session, handle, now, &self.cache)
            }
            AudioNotice::Failed { handle, message } => {
                warn!(?handle, %message, "Audio handle failed");
                self.scheduler
                    .on_audio_failure(&mut active.session, handle, now, &self.cache)
            }
            AudioNotice::DeviceError(message) => {
                warn!(%message, "Audio device error");
                // Every scheduled handle is lost with the stream.
                let mut handles: Vec<(f64, HandleId)> = active
                    .session
                    .scheduled()
                    .map(|h| (h.start_at, h.handle))
                    .collect();
                handles.sort_by(|a, b| a.0.total_cmp(&b.0));
                let mut effects = Vec::new();
                for (_, handle) in handles {
                    if active.session.state() == PlaybackState::Idle {
                        break;
                    }
                    effects.extend(
                        self.scheduler
                            .on_audio_failure(&mut active.session, handle, now, &self.cache),
                    );
                }
                effects
            }
        }
    }

    /// Execute effects in order. Starting audio can fail synchronously,
    /// which feeds new effects back into the queue.
    fn run_effects(&mut self, effects: Vec<SideEffect>) {
        let mut queue: VecDeque<SideEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                SideEffect::StartAudio {
                    handle,
                    index,
                    segment,
                    start_at,
                    rate,
                } => {
                    debug!(?handle, index, start_at, rate, "Start audio");
                    if let Err(e) = self.output.start(handle, segment, start_at, rate) {
                        warn!(?handle, index, error = %e, "Audio output refused segment");
                        let now = self.output.now();
                        if let Some(active) = self.active.as_mut() {
                            queue.extend(
                                self.scheduler
                                    .on_audio_failure(&mut active.session, handle, now, &self.cache),
                            );
                        }
                    }
                }
                SideEffect::StopAudio(handle) => self.output.stop(handle),
                SideEffect::SetRate { handle, rate } => self.output.set_rate(handle, rate),
                SideEffect::Resolve(descriptor) => self.spawn_resolve(descriptor),
                SideEffect::Preload(batch) => {
                    let ahead = batch.len();
                    self.cache.preload(&batch, ahead);
                }
                SideEffect::Finished => {
                    let outcome = match self.active.as_ref().and_then(|a| a.synthesis_error.clone()) {
                        Some(reason) => SessionOutcome::SynthesisFailed(reason),
                        None => SessionOutcome::Finished {
                            advance: self.config.auto_advance,
                        },
                    };
                    self.teardown(outcome);
                }
                SideEffect::Terminated { reason } => {
                    warn!(%reason, "Narration terminated");
                    self.teardown(SessionOutcome::AudioError(reason));
                }
            }
        }
    }

    fn spawn_resolve(&self, descriptor: SegmentDescriptor) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let session = active.session.id;
        let token = active.token.clone();
        let cache = self.cache.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => return,
                result = cache.resolve(&descriptor) => result.map(|_| ()).map_err(|e| e.to_string()),
            };
            let _ = events
                .send(Event::SegmentResolved {
                    session,
                    index: descriptor.index,
                    outcome,
                })
                .await;
        });
    }

    fn spawn_cancel(&self, jobs: JobSet) {
        if jobs.is_empty() {
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move { client.cancel_all(&jobs).await });
    }

    /// Stop audio, cancel unfinished backend jobs, retire the token, evict
    /// the cache.
    /// All in this one step; a no-op without a session.
    fn teardown(&mut self, outcome: SessionOutcome) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        for effect in self.scheduler.stop(&mut active.session) {
            if let SideEffect::StopAudio(handle) = effect {
                self.output.stop(handle);
            }
        }
        self.spawn_cancel(active.jobs.running());
        active.token.cancel();
        self.cache.evict_all();
        self.last_telemetry = Some(active.session.telemetry.snapshot());
        self.publish.progress.send_replace(None);
        info!(session = %active.session.id, ?outcome, "Session ended");
        self.outcome = Some(outcome);
    }

    fn publish_status(&self) -> NarrationStatus {
        let mut status = NarrationStatus::idle(self.speed, self.volume);
        if let Some(active) = self.active.as_ref() {
            let session = &active.session;
            let now = self.output.now();
            status.state = session.state();
            status.session = Some(session.id);
            status.fingerprint = Some(active.fingerprint);
            status.current_index = session.audible(now).map(|h| h.index).or(session.current_index());
            status.total_segments = session.total_known();
            status.synthesis_complete = session.synthesis_complete();
        }
        status.outcome = self.outcome.clone();
        status.message = self.message.clone();
        self.publish.status.send_replace(status.clone());
        status
    }

    fn publish_progress(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if let Some(snapshot) = active.tracker.sample(&active.session, self.output.now()) {
            self.publish.progress.send_replace(Some(snapshot));
        }
    }

    fn reply_diagnostics(&self, reply: oneshot::Sender<Diagnostics>) {
        let diagnostics = Diagnostics {
            session: self.active.as_ref().map(|a| a.session.id),
            telemetry: self
                .active
                .as_ref()
                .map(|a| a.session.telemetry.snapshot())
                .or_else(|| self.last_telemetry.clone()),
            cache: self.cache.stats(),
        };
        let _ = reply.send(diagnostics);
    }
}

/// The live session, if `session` still names it.
fn live(active: &mut Option<ActiveSession>, session: SessionId) -> Option<&mut ActiveSession> {
    match active.as_mut() {
        Some(a) if a.session.id == session => Some(a),
        _ => {
            debug!(%session, "Dropping event for stale session");
            None
        }
    }
}
