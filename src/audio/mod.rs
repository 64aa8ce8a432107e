pub mod cpal_output;
pub mod decode;
pub mod mixer;
pub mod output;
