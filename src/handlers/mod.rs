pub mod config;
pub mod transcribe;

pub use self::config::{get_config, update_config};
pub use self::transcribe::transcribe;
