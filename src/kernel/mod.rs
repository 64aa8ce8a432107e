//! Pure playback kernel plus the reactor that drives it.
//!
//! Everything except `reactor` is synchronous and free of I/O: operations
//! take the session and the audio clock reading and return side effects.

pub mod audio;
pub mod event;
pub mod playback;
pub mod progress;
pub mod reactor;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod time;
