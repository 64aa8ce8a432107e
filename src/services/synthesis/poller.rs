use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{JobSet, SynthesisClient};
use crate::config::NarratorConfig;
use crate::kernel::event::{Event, SessionId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub notice_after: u32,
}

impl PollSettings {
    pub fn from_config(config: &NarratorConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_backoff: config.max_poll_backoff(),
            notice_after: config.poll_failure_notice_after.max(1),
        }
    }

    /// Exponential backoff after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
        self.interval.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Poll one session's jobs until synthesis is terminal or the token fires.
///
/// Reports go to the reactor tagged with `session`; the reactor drops them
/// if the session has been replaced in the meantime.
pub async fn run_poll_loop(
    client: SynthesisClient,
    mut jobs: JobSet,
    session: SessionId,
    events: mpsc::Sender<Event>,
    token: CancellationToken,
    settings: PollSettings,
) {
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(settings.delay_after(failures)) => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = client.poll_combined(&mut jobs) => result,
        };

        match result {
            Ok(status) => {
                failures = 0;
                let terminal = status.overall.is_terminal();
                let report = Event::SynthesisReport {
                    session,
                    segments: status.segments,
                    jobs: status.jobs,
                    overall: status.overall,
                    error: status.error,
                };
                if events.send(report).await.is_err() || terminal {
                    break;
                }
            }
            Err(e) => {
                if token.is_cancelled() {
                    break;
                }
                failures = failures.saturating_add(1);
                warn!(%session, failures, error = %e, "Poll failed, retrying");
                if failures >= settings.notice_after {
                    let notice = Event::SynthesisUnreachable {
                        session,
                        consecutive_failures: failures,
                    };
                    if events.send(notice).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(%session, "Poll loop exited");
}
