//! Multi-threaded packing of RGBA16 pixels into the card's RGB wire formats
//!
//! Each conversion splits the pixel range into one partition per worker. Partition
//! boundaries are rounded down to an alignment so every worker starts on a whole
//! packing block; the last worker takes whatever remains. Workers share nothing
//! mutable and are all joined before a conversion returns.

use crate::error::{Result, SdiError};
use crate::video::PixelFormat;
use std::mem;
use std::ops::Range;
use std::thread;
use tracing::trace;

/// Default number of conversion workers
pub const DEFAULT_WORKERS: usize = 8;

/// Partition alignment for 10-bit formats, in pixels
const ALIGN_10BIT: usize = 4096;

/// Partition alignment for 12-bit formats, in pixels (multiple of the 8 pixel block)
const ALIGN_12BIT: usize = 4128;

/// Partition alignment for plain copies, in bytes
const ALIGN_COPY: usize = 4096;

/// Split `0..total` into at most `workers` ranges aligned to `align`
///
/// Empty ranges are dropped, so a small frame ends up in a single range.
pub fn partition(total: usize, workers: usize, align: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let step = ((total / workers) / align) * align;

    let mut ranges = Vec::with_capacity(workers);
    for i in 0..workers {
        let start = i * step;
        let end = if i + 1 == workers { total } else { start + step };
        if end > start {
            ranges.push(start..end);
        }
    }
    ranges
}

/// Pixel format converter with a fixed worker count
#[derive(Debug, Clone)]
pub struct PixelConverter {
    workers: usize,
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl PixelConverter {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Convert `pixels` RGBA16 pixels from `src` into `dst` using `format`
    pub fn convert_rgba16(
        &self,
        src: &[u16],
        dst: &mut [u8],
        pixels: usize,
        format: PixelFormat,
    ) -> Result<()> {
        if src.len() < pixels * 4 {
            return Err(SdiError::BufferTooSmall {
                needed: pixels * 8,
                actual: src.len() * 2,
            });
        }
        let needed = format.packed_len(pixels);
        if dst.len() < needed {
            return Err(SdiError::BufferTooSmall {
                needed,
                actual: dst.len(),
            });
        }

        let align = match format.bit_depth() {
            10 => ALIGN_10BIT,
            _ => ALIGN_12BIT,
        };
        let kernel: fn(&[u16], &mut [u8]) = match format {
            PixelFormat::Rgb10 => pack_rgb10_be,
            PixelFormat::Rgb10Le => pack_rgb10_le,
            PixelFormat::Rgb12 => pack_rgb12_be,
            PixelFormat::Rgb12Le => pack_rgb12_le,
        };

        let ranges = partition(pixels, self.workers, align);
        trace!(
            "Converting {} pixels to {} across {} partitions",
            pixels,
            format,
            ranges.len()
        );

        let mut jobs = Vec::with_capacity(ranges.len());
        let mut rest = &mut dst[..needed];
        let mut consumed = 0;
        for range in ranges {
            let end = if range.end == pixels {
                needed
            } else {
                format.packed_len(range.end)
            };
            let (chunk, tail) = mem::take(&mut rest).split_at_mut(end - consumed);
            rest = tail;
            consumed = end;
            jobs.push((&src[range.start * 4..range.end * 4], chunk));
        }

        run_jobs(jobs, kernel);
        Ok(())
    }

    /// Copy an already packed buffer into `dst` in parallel
    pub fn copy_packed(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        if dst.len() < src.len() {
            return Err(SdiError::BufferTooSmall {
                needed: src.len(),
                actual: dst.len(),
            });
        }

        let mut jobs = Vec::new();
        let mut rest = &mut dst[..src.len()];
        let mut consumed = 0;
        for range in partition(src.len(), self.workers, ALIGN_COPY) {
            let (chunk, tail) = mem::take(&mut rest).split_at_mut(range.end - consumed);
            rest = tail;
            consumed = range.end;
            jobs.push((&src[range], chunk));
        }

        run_jobs(jobs, |src: &[u8], dst: &mut [u8]| dst.copy_from_slice(src));
        Ok(())
    }
}

/// Run each job on its own scoped thread; a single job runs inline
fn run_jobs<S, F>(mut jobs: Vec<(&[S], &mut [u8])>, kernel: F)
where
    S: Sync,
    F: Fn(&[S], &mut [u8]) + Copy + Send,
{
    if jobs.len() == 1 {
        if let Some((src, dst)) = jobs.pop() {
            kernel(src, dst);
        }
        return;
    }

    thread::scope(|scope| {
        for (src, dst) in jobs {
            scope.spawn(move || kernel(src, dst));
        }
    });
}

#[inline]
fn rgb10_word(px: &[u16]) -> u32 {
    let red = (px[0] >> 6) as u32;
    let green = (px[1] >> 6) as u32;
    let blue = (px[2] >> 6) as u32;
    blue | (green << 10) | (red << 20)
}

fn pack_rgb10_be(src: &[u16], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        out.copy_from_slice(&rgb10_word(px).to_be_bytes());
    }
}

fn pack_rgb10_le(src: &[u16], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        out.copy_from_slice(&rgb10_word(px).to_le_bytes());
    }
}

/// Pack 4 pixels (12 channel values) into 18 bytes, low bits first
fn pack_rgb12_block(block: &[u16], out: &mut [u8; 18]) {
    let mut values = [0u16; 12];
    for (i, px) in block.chunks_exact(4).enumerate() {
        values[i * 3] = px[0] >> 4;
        values[i * 3 + 1] = px[1] >> 4;
        values[i * 3 + 2] = px[2] >> 4;
    }

    for (quad, bytes) in values.chunks_exact(4).zip(out.chunks_exact_mut(6)) {
        let (q, r, s, t) = (quad[0], quad[1], quad[2], quad[3]);
        let w0 = q | ((r & 0x0f) << 12);
        let w1 = (r >> 4) | ((s & 0xff) << 8);
        let w2 = (s >> 8) | (t << 4);
        bytes[0..2].copy_from_slice(&w0.to_le_bytes());
        bytes[2..4].copy_from_slice(&w1.to_le_bytes());
        bytes[4..6].copy_from_slice(&w2.to_le_bytes());
    }
}

fn pack_rgb12_le(src: &[u16], dst: &mut [u8]) {
    let mut packed = [0u8; 18];
    for (block, out) in src.chunks(16).zip(dst.chunks_mut(18)) {
        pack_rgb12_block(block, &mut packed);
        let n = out.len();
        out.copy_from_slice(&packed[..n]);
    }
}

fn pack_rgb12_be(src: &[u16], dst: &mut [u8]) {
    let mut packed = [0u8; 36];
    let mut half = [0u8; 18];
    for (block, out) in src.chunks(32).zip(dst.chunks_mut(36)) {
        packed.fill(0);
        for (quarter, bytes) in block.chunks(16).zip(packed.chunks_exact_mut(18)) {
            pack_rgb12_block(quarter, &mut half);
            bytes.copy_from_slice(&half);
        }
        for word in packed.chunks_exact_mut(4) {
            word.reverse();
        }
        let n = out.len();
        out.copy_from_slice(&packed[..n]);
    }
}

/// Split a big-endian 10-bit RGB word into `[red, green, blue]`
pub fn unpack_rgb10_word(bytes: [u8; 4]) -> [u16; 3] {
    let word = u32::from_be_bytes(bytes);
    [
        ((word >> 20) & 0x3ff) as u16,
        ((word >> 10) & 0x3ff) as u16,
        (word & 0x3ff) as u16,
    ]
}

/// Expand packed big-endian 10-bit RGB into RGBA16 with opaque alpha
pub fn expand_rgb10(src: &[u8], dst: &mut [u16]) {
    for (word, px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let [r, g, b] = unpack_rgb10_word([word[0], word[1], word[2], word[3]]);
        px[0] = r << 6;
        px[1] = g << 6;
        px[2] = b << 6;
        px[3] = u16::MAX;
    }
}
