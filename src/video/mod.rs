//! Video frame types, pixel packing and the renderer handoff

mod convert;
mod handoff;

pub use convert::{expand_rgb10, partition, unpack_rgb10_word, PixelConverter, DEFAULT_WORKERS};
pub use handoff::FrameHandoff;

use crate::error::{Result, SdiError};
use std::fmt;
use std::str::FromStr;

/// Packed RGB wire formats accepted by the output card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 10-bit RGB, one big-endian 32-bit word per pixel
    Rgb10,
    /// 10-bit RGB, one little-endian 32-bit word per pixel
    Rgb10Le,
    /// 12-bit RGB, 8 pixels per 36 bytes, big-endian words
    Rgb12,
    /// 12-bit RGB, 8 pixels per 36 bytes, little-endian
    Rgb12Le,
}

impl PixelFormat {
    /// All supported formats, in menu order
    pub const ALL: [PixelFormat; 4] = [
        PixelFormat::Rgb10,
        PixelFormat::Rgb10Le,
        PixelFormat::Rgb12,
        PixelFormat::Rgb12Le,
    ];

    /// Human readable name, as used in settings files
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb10 => "10 bit RGB",
            PixelFormat::Rgb10Le => "10 bit RGB-LE",
            PixelFormat::Rgb12 => "12 bit RGB",
            PixelFormat::Rgb12Le => "12 bit RGB-LE",
        }
    }

    /// Bits per channel
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelFormat::Rgb10 | PixelFormat::Rgb10Le => 10,
            PixelFormat::Rgb12 | PixelFormat::Rgb12Le => 12,
        }
    }

    /// Bytes per row of a device frame
    pub fn row_bytes(&self, width: u32) -> usize {
        match self.bit_depth() {
            10 => width as usize * 4,
            _ => (width as usize).div_ceil(8) * 36,
        }
    }

    /// Bytes needed to hold `pixels` contiguous packed pixels
    pub fn packed_len(&self, pixels: usize) -> usize {
        match self.bit_depth() {
            10 => pixels * 4,
            _ => pixels.div_ceil(8) * 36,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = SdiError;

    fn from_str(s: &str) -> Result<Self> {
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.name() == s.trim())
            .ok_or_else(|| SdiError::InvalidPixelFormat(s.to_string()))
    }
}

/// Pixel storage of a rendered frame
#[derive(Debug, Clone)]
pub enum FramePixels {
    /// 16 bits per channel RGBA
    Rgba16(Vec<u16>),
    /// Already packed in the `Rgb10` wire layout
    Rgb10(Vec<u8>),
}

/// An image produced by the offscreen renderer
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    width: u32,
    height: u32,
    pixels: FramePixels,
}

impl RenderedFrame {
    /// Wrap an RGBA16 buffer (4 channels per pixel)
    pub fn rgba16(width: u32, height: u32, data: Vec<u16>) -> Result<Self> {
        let needed = width as usize * height as usize * 4;
        if data.len() < needed {
            return Err(SdiError::BufferTooSmall {
                needed: needed * 2,
                actual: data.len() * 2,
            });
        }
        Ok(Self {
            width,
            height,
            pixels: FramePixels::Rgba16(data),
        })
    }

    /// Wrap a buffer already packed as big-endian 10-bit RGB words
    pub fn rgb10(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let needed = PixelFormat::Rgb10.packed_len(width as usize * height as usize);
        if data.len() < needed {
            return Err(SdiError::BufferTooSmall {
                needed,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels: FramePixels::Rgb10(data),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn pixels(&self) -> &FramePixels {
        &self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_names() {
        for format in PixelFormat::ALL {
            assert_eq!(format.name().parse::<PixelFormat>().unwrap(), format);
        }
        assert!(matches!(
            "8 bit YUV".parse::<PixelFormat>(),
            Err(SdiError::InvalidPixelFormat(_))
        ));
    }

    #[test]
    fn test_row_bytes() {
        assert_eq!(PixelFormat::Rgb10.row_bytes(1920), 7680);
        assert_eq!(PixelFormat::Rgb10Le.row_bytes(3840), 15360);
        // 1920 * 4.5
        assert_eq!(PixelFormat::Rgb12.row_bytes(1920), 8640);
        assert_eq!(PixelFormat::Rgb12Le.row_bytes(1918), 8640);
    }

    #[test]
    fn test_rendered_frame_size_check() {
        assert!(RenderedFrame::rgba16(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            RenderedFrame::rgba16(2, 2, vec![0; 15]),
            Err(SdiError::BufferTooSmall { needed: 32, actual: 30 })
        ));
        let frame = RenderedFrame::rgb10(2, 1, vec![0; 8]).unwrap();
        assert!(matches!(frame.pixels(), FramePixels::Rgb10(data) if data.len() == 8));
        assert_eq!(frame.pixel_count(), 2);
    }
}
