//! Audio sink handed to the audio producer

use crate::audio::AudioFlowController;
use crate::error::Result;
use std::sync::Arc;

/// Sample frames the producer should deliver per call, at minimum
const DESIRED_SAMPLE_FRAMES: usize = 2048;

/// Audio output bound to one scheduler's flow controller
///
/// Built by [`crate::output::OutputScheduler::audio_output`] and moved to the
/// producer thread.
#[derive(Clone)]
pub struct SdiAudioOutput {
    flow: Arc<AudioFlowController>,
}

impl SdiAudioOutput {
    pub fn new(flow: Arc<AudioFlowController>) -> Self {
        Self { flow }
    }

    /// Preferred chunk size in sample frames
    pub fn desired_samples(&self) -> usize {
        DESIRED_SAMPLE_FRAMES
    }

    pub fn sample_rate(&self) -> u32 {
        self.flow.format().sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.flow.format().channels
    }

    /// Latency of audio already queued on the card, for position display
    pub fn latency_microseconds(&self) -> Result<i64> {
        self.flow.latency_microseconds()
    }

    /// Push interleaved stereo samples, blocking until the card wants more
    ///
    /// Returns false once output has stopped.
    pub fn push_samples(&self, samples: &[i16]) -> Result<bool> {
        self.flow.submit(samples)
    }

    pub fn is_active(&self) -> bool {
        self.flow.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::device::{OutputDevice, SimulatedDevice};

    #[test]
    fn test_output_reports_flow_state() {
        let device = SimulatedDevice::new();
        device.enable_audio_output(&AudioFormat::DEVICE).unwrap();
        device.set_buffered_audio(9600);
        let flow = Arc::new(AudioFlowController::new(
            Arc::new(device.clone()),
            AudioFormat::DEVICE,
        ));
        let output = SdiAudioOutput::new(flow.clone());

        assert_eq!(output.desired_samples(), 2048);
        assert_eq!(output.sample_rate(), 48_000);
        assert_eq!(output.channels(), 2);
        assert_eq!(output.latency_microseconds().unwrap(), 200_000);

        assert!(!output.is_active());
        assert!(!output.push_samples(&[0; 8]).unwrap());
        flow.start();
        assert!(output.is_active());
    }
}
