//! Output card driver interface, display modes and frames

mod filter;
mod frame;
mod modes;
mod simulated;

pub use filter::InterlaceFilter;
pub use frame::{DeviceFrame, FrameFlags};
pub use modes::{format_refresh_rate, DisplayMode, DisplayModeCatalog, NO_SUCH_RESOLUTION};
pub use simulated::{DeviceCall, SimulatedDevice};

use crate::audio::AudioFormat;
use crate::error::Result;
use crate::video::PixelFormat;
use std::sync::Weak;

/// Driver-native display mode identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeId(pub u32);

/// A display mode as reported by the driver, before filtering
#[derive(Debug, Clone)]
pub struct NativeMode {
    pub id: ModeId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Duration of one frame in `frame_timescale` units
    pub frame_duration: i64,
    /// Time units per second
    pub frame_timescale: i64,
}

/// How a scheduled frame left the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Completed,
    DisplayedLate,
    Dropped,
    Flushed,
}

/// Entry points the driver thread calls into
pub trait OutputCallbacks: Send + Sync {
    /// A scheduled frame has been displayed and is handed back for reuse
    fn frame_completed(&self, frame: DeviceFrame, result: CompletionResult);

    /// The device's audio buffer wants topping up
    fn render_audio_samples(&self, preroll: bool);
}

/// Driver interface of a single output card
///
/// Every call may fail; failures are reported as [`crate::SdiError::Device`].
/// Callbacks are delivered on a driver-owned thread.
pub trait OutputDevice: Send + Sync {
    /// Device model name
    fn name(&self) -> String;

    fn display_modes(&self) -> Result<Vec<NativeMode>>;

    /// Register the scheduler as the target of driver callbacks
    fn set_callbacks(&self, callbacks: Weak<dyn OutputCallbacks>) -> Result<()>;

    fn enable_video_output(&self, mode: ModeId) -> Result<()>;
    fn disable_video_output(&self) -> Result<()>;
    fn enable_audio_output(&self, format: &AudioFormat) -> Result<()>;
    fn disable_audio_output(&self) -> Result<()>;

    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        format: PixelFormat,
        flags: FrameFlags,
    ) -> Result<DeviceFrame>;

    /// Queue `frame` for display at `display_time / timescale` seconds
    ///
    /// Ownership passes to the driver until the frame comes back through
    /// [`OutputCallbacks::frame_completed`].
    fn schedule_video_frame(
        &self,
        frame: DeviceFrame,
        display_time: i64,
        duration: i64,
        timescale: i64,
    ) -> Result<()>;

    /// Queue interleaved samples at `stream_time` (in sample frames)
    fn schedule_audio_samples(
        &self,
        samples: &[i16],
        sample_frames: u32,
        stream_time: u64,
        sample_rate: u32,
    ) -> Result<()>;

    /// Sample frames queued on the card and not yet played
    fn buffered_audio_sample_frames(&self) -> Result<u32>;

    fn begin_audio_preroll(&self) -> Result<()>;
    fn start_scheduled_playback(&self, start_time: i64, timescale: i64, speed: f64) -> Result<()>;
    fn stop_scheduled_playback(&self) -> Result<()>;
}
