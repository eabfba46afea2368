//! Unified error types for sdiout

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for sdiout operations
#[derive(Error, Debug)]
pub enum SdiError {
    /// No output device could be opened
    #[error("No output device available: {0}")]
    NoDevice(String),

    /// A driver call returned failure
    #[error("Device call '{call}' failed: {message}")]
    Device {
        call: &'static str,
        message: String,
    },

    /// No display mode matches the requested resolution and refresh rate
    #[error("Failed to find a display mode for {resolution} @ {refresh_rate}")]
    DisplayModeNotFound {
        resolution: String,
        refresh_rate: String,
    },

    /// Start requested before a display mode was resolved
    #[error("No display mode configured")]
    NoDisplayMode,

    /// Unknown pixel format name
    #[error("Invalid pixel format: {0}")]
    InvalidPixelFormat(String),

    /// Video frame allocation failed
    #[error("Failed to create video frame: {0}")]
    FrameCreation(String),

    /// Output already started
    #[error("Output already running")]
    AlreadyRunning,

    /// Output was stopped from another thread before start finished
    #[error("Output stopped while starting")]
    StartInterrupted,

    /// Interleaved stereo buffer with a dangling sample
    #[error("Audio buffer of {0} samples is not a whole number of stereo frames")]
    PartialSampleFrame(usize),

    /// Destination buffer cannot hold the converted pixels
    #[error("Buffer too small - needed {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Settings file error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for sdiout operations
pub type Result<T> = std::result::Result<T, SdiError>;

impl SdiError {
    /// Create a device error for a named driver call
    pub fn device(call: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            call,
            message: message.into(),
        }
    }

    /// Check if this error is a configuration error (reported without any state change)
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SdiError::DisplayModeNotFound { .. }
                | SdiError::NoDisplayMode
                | SdiError::InvalidPixelFormat(_)
                | SdiError::InvalidConfig(_)
                | SdiError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SdiError::DisplayModeNotFound {
            resolution: "1920 x 1080".into(),
            refresh_rate: "61.0".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to find a display mode for 1920 x 1080 @ 61.0"
        );

        let err = SdiError::device("ScheduleVideoFrame", "rejected");
        assert_eq!(
            err.to_string(),
            "Device call 'ScheduleVideoFrame' failed: rejected"
        );
    }

    #[test]
    fn test_configuration_classification() {
        assert!(SdiError::NoDisplayMode.is_configuration_error());
        assert!(SdiError::InvalidPixelFormat("8 bit YUV".into()).is_configuration_error());
        assert!(!SdiError::device("EnableVideoOutput", "busy").is_configuration_error());
        assert!(!SdiError::AlreadyRunning.is_configuration_error());
    }
}
