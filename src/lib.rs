pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod kernel;
pub mod outputs;
pub mod services;
pub mod text;

pub use config::NarratorConfig;
pub use controller::Narrator;
pub use error::{NarratorError, Result};
pub use kernel::reactor::Reactor;
