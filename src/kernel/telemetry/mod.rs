//! Scheduler diagnostics.
//!
//! # INVARIANT
//! Telemetry is a write-only side channel of the scheduler. Nothing in the
//! kernel or the reactor reads it back to make a decision; it exists for the
//! UI, for logs and for tests.

pub mod event;
pub mod metrics;
pub mod recorder;
