//! Video frames owned by the output card

use crate::video::PixelFormat;
use std::fmt;

/// Creation flags for device frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Rows are stored bottom-up (GL readback order)
    pub flip_vertical: bool,
}

impl FrameFlags {
    pub const DEFAULT: FrameFlags = FrameFlags {
        flip_vertical: false,
    };
    pub const FLIP_VERTICAL: FrameFlags = FrameFlags {
        flip_vertical: true,
    };
}

/// A frame buffer allocated by the driver
///
/// The release hook runs exactly once, when the frame is dropped, whichever
/// side (driver or scheduler) holds it at that point.
pub struct DeviceFrame {
    width: u32,
    height: u32,
    row_bytes: usize,
    format: PixelFormat,
    flags: FrameFlags,
    data: Vec<u8>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceFrame {
    /// Allocate a zeroed (black) frame
    pub fn new(
        width: u32,
        height: u32,
        row_bytes: usize,
        format: PixelFormat,
        flags: FrameFlags,
    ) -> Self {
        Self {
            width,
            height,
            row_bytes,
            format,
            flags,
            data: vec![0u8; row_bytes * height as usize],
            release: None,
        }
    }

    /// Attach a hook invoked when the frame is released
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for DeviceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_bytes", &self.row_bytes)
            .field("format", &self.format)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Drop for DeviceFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
