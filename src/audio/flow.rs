//! Watermark-driven audio flow between a producer thread and the card
//!
//! The producer appends interleaved stereo samples with [`AudioFlowController::submit`]
//! and then blocks. Each time the card's audio callback fires, the controller
//! asks the card how much audio it still holds; at or below the water level it
//! wakes the producer and hands everything queued so far to the card as one
//! batch. Audio production is therefore paced by the card's clock, not a timer.

use crate::audio::AudioFormat;
use crate::device::OutputDevice;
use crate::error::{Result, SdiError};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default water level in sample frames
pub const DEFAULT_WATER_LEVEL: u32 = 4096;

/// Sample frames of silence scheduled when the producer has nothing queued
pub const SILENCE_SAMPLE_FRAMES: u32 = 512;

/// What a drain opportunity did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Card still above the water level, or flow inactive
    Skipped,
    /// Queued producer audio was scheduled
    Submitted { sample_frames: u32 },
    /// Queue was empty, silence was scheduled instead
    Silence { sample_frames: u32 },
}

/// Audio flow controller
pub struct AudioFlowController {
    device: Arc<dyn OutputDevice>,
    format: AudioFormat,
    /// Interleaved samples waiting for the next drain
    queue: Mutex<Vec<i16>>,
    /// Serializes query+submit against the driver; holds the running stream time
    device_lock: Mutex<u64>,
    water_level: AtomicU32,
    sync_delay_ms: AtomicI64,
    active: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl AudioFlowController {
    pub fn new(device: Arc<dyn OutputDevice>, format: AudioFormat) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            device,
            format,
            queue: Mutex::new(Vec::new()),
            device_lock: Mutex::new(0),
            water_level: AtomicU32::new(DEFAULT_WATER_LEVEL),
            sync_delay_ms: AtomicI64::new(0),
            active: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn set_water_level(&self, sample_frames: u32) {
        debug!("Audio water level set to {} sample frames", sample_frames);
        self.water_level.store(sample_frames, Ordering::Relaxed);
    }

    pub fn water_level(&self) -> u32 {
        self.water_level.load(Ordering::Relaxed)
    }

    /// Audio delay relative to video, in milliseconds (may be negative)
    pub fn set_sync_delay_ms(&self, delay_ms: i64) {
        debug!("Audio sync delay set to {} ms", delay_ms);
        self.sync_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn sync_delay_ms(&self) -> i64 {
        self.sync_delay_ms.load(Ordering::Relaxed)
    }

    /// Begin accepting audio with an empty queue and stream time zero
    pub fn start(&self) {
        self.queue.lock().clear();
        *self.device_lock.lock() = 0;
        while self.wake_rx.try_recv().is_ok() {}
        self.active.store(true, Ordering::SeqCst);
        debug!("Audio flow started");
    }

    /// Stop accepting audio and release a blocked producer
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        let dropped = self.queue.lock().len();
        if dropped > 0 {
            debug!("Audio flow stopped with {} queued samples", dropped);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Queue interleaved stereo samples and wait until the card wants more
    ///
    /// Returns `Ok(true)` when woken by a drain and output is still active,
    /// `Ok(false)` when output is stopped (the samples are discarded if it
    /// already was).
    pub fn submit(&self, samples: &[i16]) -> Result<bool> {
        let channels = self.format.channels as usize;
        if samples.len() % channels != 0 {
            return Err(SdiError::PartialSampleFrame(samples.len()));
        }
        if !self.is_active() {
            trace!("Discarding {} samples, audio flow inactive", samples.len());
            return Ok(false);
        }

        self.queue.lock().extend_from_slice(samples);

        if self.wake_rx.recv().is_err() {
            // sender lives in self, so this cannot disconnect
            return Ok(false);
        }
        Ok(self.is_active())
    }

    /// Sample frames waiting in the queue
    pub fn queued_sample_frames(&self) -> usize {
        self.format.samples_to_frames(self.queue.lock().len())
    }

    /// Card-buffered sample frames less the sync delay
    pub fn num_samples_in_buffer(&self) -> Result<i64> {
        let buffered = {
            let _guard = self.device_lock.lock();
            self.device.buffered_audio_sample_frames()?
        };
        Ok(buffered as i64 - self.format.ms_to_frames(self.sync_delay_ms()))
    }

    /// Playback latency of the audio buffered on the card
    pub fn latency_microseconds(&self) -> Result<i64> {
        Ok(self.format.frames_to_micros(self.num_samples_in_buffer()?))
    }

    /// Top up the card's audio buffer if it is at or below the water level
    ///
    /// Called from the card's audio callback.
    pub fn on_hardware_drain_opportunity(&self) -> Result<DrainOutcome> {
        if !self.is_active() {
            return Ok(DrainOutcome::Skipped);
        }

        let mut stream_time = self.device_lock.lock();
        let buffered = self.device.buffered_audio_sample_frames()?;
        if buffered > self.water_level() {
            return Ok(DrainOutcome::Skipped);
        }

        // full means the producer has a wake pending already
        let _ = self.wake_tx.try_send(());

        let batch = std::mem::take(&mut *self.queue.lock());
        let (samples, outcome) = if batch.is_empty() {
            let frames = SILENCE_SAMPLE_FRAMES;
            trace!("Audio queue empty at {} buffered, scheduling silence", buffered);
            (
                vec![0i16; self.format.frames_to_samples(frames as usize)],
                DrainOutcome::Silence {
                    sample_frames: frames,
                },
            )
        } else {
            let frames = self.format.samples_to_frames(batch.len()) as u32;
            (
                batch,
                DrainOutcome::Submitted {
                    sample_frames: frames,
                },
            )
        };

        let sample_frames = match outcome {
            DrainOutcome::Submitted { sample_frames } | DrainOutcome::Silence { sample_frames } => {
                sample_frames
            }
            DrainOutcome::Skipped => 0,
        };

        if let Err(e) = self.device.schedule_audio_samples(
            &samples,
            sample_frames,
            *stream_time,
            self.format.sample_rate,
        ) {
            warn!("Failed to schedule {} audio sample frames: {}", sample_frames, e);
            return Err(e);
        }
        *stream_time += sample_frames as u64;
        trace!(
            "Scheduled {} sample frames, stream time now {}",
            sample_frames,
            *stream_time
        );
        Ok(outcome)
    }
}
