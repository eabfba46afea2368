//! sdiout - SDI playout engine
//!
//! Paces rendered video frames and streamed audio to a broadcast output card,
//! driven entirely by the card's completion and audio callbacks.

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod output;
pub mod sync;
pub mod video;

pub use error::{Result, SdiError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
