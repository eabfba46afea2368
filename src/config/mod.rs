//! Command line arguments and persisted output settings

mod args;
mod settings;

pub use args::{Args, Command};
pub use settings::{ConfigError, OutputSettings, SETTINGS_FILE_NAME};
