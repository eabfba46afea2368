//! Audio flow control between the audio producer and the output card

mod flow;
mod output;

pub use flow::{AudioFlowController, DrainOutcome, DEFAULT_WATER_LEVEL, SILENCE_SAMPLE_FRAMES};
pub use output::SdiAudioOutput;

/// Audio format information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// The card's fixed output format: 48kHz, 16 bit, stereo
    pub const DEVICE: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channels: 2,
        bits_per_sample: 16,
    };

    /// Calculate sample frames for given milliseconds (may be negative)
    pub fn ms_to_frames(&self, ms: i64) -> i64 {
        ms * self.sample_rate as i64 / 1000
    }

    /// Calculate microseconds of playback for given sample frames
    pub fn frames_to_micros(&self, frames: i64) -> i64 {
        frames * 1_000_000 / self.sample_rate as i64
    }

    /// Calculate number of interleaved samples for given sample frames
    pub fn frames_to_samples(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }

    /// Calculate number of sample frames for given interleaved samples
    pub fn samples_to_frames(&self, samples: usize) -> usize {
        samples / self.channels as usize
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}
