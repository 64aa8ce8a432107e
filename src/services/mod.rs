pub mod cache;
pub mod synthesis;
