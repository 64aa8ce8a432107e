use serde::{Deserialize, Serialize};

/// Lifecycle of a narration session as seen by the UI.
///
/// `Seeking` is not a state here: it is a transient flag on the session that
/// only exists for the duration of one synchronous seek step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    /// No session, nothing scheduled.
    #[default]
    Idle,
    /// Session active; segments are scheduled as they become ready.
    Playing,
    /// Session retained, all audio stopped, pending queue intact.
    Paused,
}

/// Requests that move a session between states. Requests, not forces:
/// the graph decides whether they apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackRequest {
    Start,
    Pause,
    Resume,
    Stop,
    Finish,
    AudioFault,
}

pub struct PlaybackGraph;

impl PlaybackGraph {
    /// Pure function: (current, request) -> next state.
    /// Returns None when the request does not apply in the current state.
    pub fn transition(current: PlaybackState, request: PlaybackRequest) -> Option<PlaybackState> {
        use PlaybackRequest::*;
        use PlaybackState::*;

        match (current, request) {
            // A new play() always lands in Playing; the old session is torn down first.
            (_, Start) => Some(Playing),

            (Playing, Pause) => Some(Paused),
            (Paused, Resume) => Some(Playing),

            // Finishing naturally only happens while audio runs.
            (Playing, Finish) => Some(Idle),
            (Playing, AudioFault) | (Paused, AudioFault) => Some(Idle),

            // Stop is idempotent: Idle stays Idle without complaint.
            (_, Stop) => Some(Idle),

            _ => None,
        }
    }
}
