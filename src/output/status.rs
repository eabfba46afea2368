//! Output state, status snapshots and notifications

use crate::video::PixelFormat;
use std::fmt;
use std::time::Instant;

/// Output state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Not started since initialization
    Idle,
    /// Outputs enabled and blank frames queued, playback not yet started
    Prerolled,
    /// Playback running, one frame scheduled per completion callback
    Running,
    /// Stopped explicitly or by a device failure; can be started again
    Stopped,
}

impl OutputState {
    /// Whether a start request is accepted in this state
    pub fn can_start(&self) -> bool {
        matches!(self, OutputState::Idle | OutputState::Stopped)
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputState::Idle => "idle",
            OutputState::Prerolled => "prerolled",
            OutputState::Running => "running",
            OutputState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of the scheduler for status displays
#[derive(Debug, Clone)]
pub struct OutputStatus {
    pub state: OutputState,
    /// Last status message
    pub message: String,
    /// Whether `message` reports a failure
    pub is_error: bool,
    /// Driver name of the configured mode
    pub mode_name: Option<String>,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Whole frames per second, rounded up
    pub fps: u32,
    /// Frames scheduled since the last start, preroll included
    pub frame_count: i64,
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.state)?;
        if let Some(mode) = &self.mode_name {
            write!(
                f,
                "{} {}x{} {}fps {} ",
                mode, self.width, self.height, self.fps, self.pixel_format
            )?;
        }
        if self.is_error {
            write!(f, "error: ")?;
        }
        f.write_str(&self.message)
    }
}

/// Notifications from the scheduler to the renderer and UI
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Status message changed
    Status { message: String, is_error: bool },
    /// The previously scheduled frame was displayed
    FrameDisplayed { at: Instant },
    /// The renderer should start producing the next frame at this size
    FrameRequested { width: u32, height: u32 },
    /// First frame after a start has been scheduled
    Started { width: u32, height: u32 },
    /// Output stopped
    Stopped,
}
