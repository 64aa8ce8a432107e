use thiserror::Error;

use crate::audio::decode::DecodeError;
use crate::audio::output::AudioError;
use crate::config::ConfigError;
use crate::services::cache::CacheError;
use crate::services::synthesis::SynthesisError;

/// Crate-level error. Only submission failures and terminal audio failures
/// ever reach the caller of the controller; everything else degrades inside
/// the reactor.
#[derive(Error, Debug)]
pub enum NarratorError {
    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Segment cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Audio output error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Nothing to narrate: text is empty after preprocessing")]
    EmptyText,

    #[error("Narration engine is shut down")]
    EngineClosed,
}

pub type Result<T> = std::result::Result<T, NarratorError>;
