//! Chapter text cleanup before synthesis.

pub mod preprocess;

pub use preprocess::{fingerprint, paragraphs, preprocess};
