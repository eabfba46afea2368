//! Output scheduler - drives the card from its own completion callbacks
//!
//! Start enables the outputs, queues three blank frames and starts scheduled
//! playback. From then on every frame the card hands back is refilled with the
//! newest rendered image and queued one slot after the last, and every audio
//! callback gives the flow controller a chance to top up the card's buffer.
//! A driver failure while running always stops output.

use crate::audio::{AudioFlowController, AudioFormat, SdiAudioOutput};
use crate::config::OutputSettings;
use crate::device::{
    CompletionResult, DeviceFrame, DisplayMode, DisplayModeCatalog, FrameFlags, OutputCallbacks,
    OutputDevice,
};
use crate::error::{Result, SdiError};
use crate::output::{OutputEvent, OutputState, OutputStatus};
use crate::video::{expand_rgb10, FrameHandoff, FramePixels, PixelConverter, PixelFormat, RenderedFrame};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Blank frames queued before playback starts
pub const PREROLL_FRAMES: i64 = 3;

/// Timing and format of the output, as configured and as running
#[derive(Debug, Clone)]
struct ActiveOutputConfig {
    pixel_format: PixelFormat,
    mode: Option<DisplayMode>,
    /// Frames scheduled since the last start, preroll included
    frame_count: i64,
    /// Set on start, cleared once the first live frame is scheduled
    awaiting_first_tick: bool,
}

struct SchedulerState {
    phase: OutputState,
    /// Bumped on every start and stop, so late driver results can tell
    /// whether the run they belong to is still current
    generation: u64,
    config: ActiveOutputConfig,
    converter: PixelConverter,
    /// RGBA16 staging for packed sources feeding a different device format
    intermediate: Vec<u16>,
    message: String,
    is_error: bool,
}

/// Output scheduler for a single card
pub struct OutputScheduler {
    device: Arc<dyn OutputDevice>,
    catalog: DisplayModeCatalog,
    handoff: Arc<FrameHandoff>,
    audio: Arc<AudioFlowController>,
    /// Audio callbacks are serviced only while set
    audio_live: AtomicBool,
    state: Mutex<SchedulerState>,
    events: Option<Sender<OutputEvent>>,
}

impl OutputScheduler {
    /// Enumerate the card's modes and register for its callbacks
    ///
    /// Any driver failure here leaves the card unusable and is returned.
    pub fn new(
        device: Arc<dyn OutputDevice>,
        events: Option<Sender<OutputEvent>>,
    ) -> Result<Arc<Self>> {
        let name = device.name();
        info!("Initializing output on {}", name);

        let catalog = DisplayModeCatalog::from_native(&device.display_modes()?);
        if catalog.is_empty() {
            return Err(SdiError::NoDevice(format!(
                "{} offers no progressive display modes",
                name
            )));
        }

        let audio = Arc::new(AudioFlowController::new(
            device.clone(),
            AudioFormat::DEVICE,
        ));

        let scheduler = Arc::new(Self {
            device,
            catalog,
            handoff: Arc::new(FrameHandoff::new()),
            audio,
            audio_live: AtomicBool::new(false),
            state: Mutex::new(SchedulerState {
                phase: OutputState::Idle,
                generation: 0,
                config: ActiveOutputConfig {
                    pixel_format: PixelFormat::Rgb10,
                    mode: None,
                    frame_count: 0,
                    awaiting_first_tick: false,
                },
                converter: PixelConverter::default(),
                intermediate: Vec::new(),
                message: String::new(),
                is_error: false,
            }),
            events,
        });

        let weak: Weak<Self> = Arc::downgrade(&scheduler);
        let callbacks: Weak<dyn OutputCallbacks> = weak;
        scheduler.device.set_callbacks(callbacks)?;

        Ok(scheduler)
    }

    pub fn catalog(&self) -> &DisplayModeCatalog {
        &self.catalog
    }

    /// Resolution keys offered by the card, sorted
    pub fn resolution_names(&self) -> Vec<String> {
        self.catalog.resolution_names()
    }

    pub fn refresh_rates_for(&self, resolution: &str) -> Vec<String> {
        self.catalog.refresh_rates_for(resolution)
    }

    /// Select the display mode and pixel format used by the next start
    ///
    /// An unknown mode is rejected without touching the output. If output is
    /// running it is restarted in the new mode.
    pub fn set_display_mode(
        &self,
        resolution: &str,
        refresh_rate: &str,
        pixel_format: PixelFormat,
    ) -> Result<()> {
        let mode = match self.catalog.resolve(resolution, refresh_rate) {
            Ok(mode) => mode.clone(),
            Err(e) => {
                warn!("{}", e);
                return Err(e);
            }
        };

        let was_active = matches!(
            self.state(),
            OutputState::Prerolled | OutputState::Running
        );
        if was_active {
            self.stop()?;
        }

        {
            let mut state = self.state.lock();
            info!("Display mode set to {} as {}", mode, pixel_format);
            state.config.mode = Some(mode);
            state.config.pixel_format = pixel_format;
        }

        if was_active {
            self.start()?;
        }
        Ok(())
    }

    /// Switch resolution, keeping the current refresh rate when offered
    ///
    /// Otherwise 24.0 Hz, then 60.0 Hz, then the first rate listed for the
    /// resolution is used. Returns the rate chosen.
    pub fn set_resolution(&self, resolution: &str) -> Result<String> {
        let (current, format) = {
            let state = self.state.lock();
            let current = state
                .config
                .mode
                .as_ref()
                .map(|m| m.refresh_rate.clone())
                .unwrap_or_default();
            (current, state.config.pixel_format)
        };

        let rate = self
            .catalog
            .preferred_refresh_rate(resolution, &current)
            .ok_or_else(|| SdiError::DisplayModeNotFound {
                resolution: resolution.to_string(),
                refresh_rate: current.clone(),
            })?;
        if rate != current {
            debug!("{} has no {} Hz mode, using {}", resolution, current, rate);
        }

        self.set_display_mode(resolution, &rate, format)?;
        Ok(rate)
    }

    pub fn display_mode(&self) -> Option<DisplayMode> {
        self.state.lock().config.mode.clone()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.state.lock().config.pixel_format
    }

    pub fn set_audio_water_level(&self, sample_frames: u32) {
        self.audio.set_water_level(sample_frames);
    }

    pub fn set_audio_sync_delay_ms(&self, delay_ms: i64) {
        self.audio.set_sync_delay_ms(delay_ms);
    }

    /// Number of threads used for pixel conversion
    pub fn set_converter_threads(&self, threads: usize) {
        self.state.lock().converter = PixelConverter::new(threads);
    }

    /// Apply a full settings record, starting output if it asks for it
    ///
    /// A refresh rate the resolution does not offer falls back to the
    /// preferred rate for that resolution. Configuration errors are reported
    /// through the status as well as returned.
    pub fn apply_settings(&self, settings: &OutputSettings) -> Result<()> {
        self.audio.set_water_level(settings.audio_water_level);
        self.audio.set_sync_delay_ms(settings.audio_sync_delay_ms);
        self.set_converter_threads(settings.converter_threads);

        let refresh_rate = match self
            .catalog
            .resolve(&settings.resolution, &settings.refresh_rate)
        {
            Ok(_) => settings.refresh_rate.clone(),
            Err(_) => match self
                .catalog
                .preferred_refresh_rate(&settings.resolution, &settings.refresh_rate)
            {
                Some(rate) => {
                    warn!(
                        "{} has no {} Hz mode, using {}",
                        settings.resolution, settings.refresh_rate, rate
                    );
                    rate
                }
                None => settings.refresh_rate.clone(),
            },
        };

        let configured = settings
            .pixel_format
            .parse::<PixelFormat>()
            .and_then(|format| self.set_display_mode(&settings.resolution, &refresh_rate, format));
        if let Err(e) = configured {
            let mut state = self.state.lock();
            self.set_status(&mut state, e.to_string(), true);
            return Err(e);
        }

        if settings.auto_start && self.state().can_start() {
            info!("Auto-starting output");
            self.start()?;
        }
        Ok(())
    }

    /// Enable the outputs, preroll and start playback
    ///
    /// The state lock is never held across a driver call. While the driver
    /// works the phase reads `Prerolled`, which keeps a second start out; a
    /// stop arriving meanwhile wins and this start returns
    /// [`SdiError::StartInterrupted`].
    pub fn start(&self) -> Result<()> {
        let (mode, format, generation) = {
            let mut state = self.state.lock();
            if !state.phase.can_start() {
                debug!("Start requested while {}", state.phase);
                return Err(SdiError::AlreadyRunning);
            }
            let mode = state.config.mode.clone().ok_or(SdiError::NoDisplayMode)?;
            state.phase = OutputState::Prerolled;
            state.generation += 1;
            state.config.frame_count = 0;
            state.config.awaiting_first_tick = false;
            self.set_status(
                &mut state,
                format!("Starting output in mode {}.", mode.name),
                false,
            );
            (mode, state.config.pixel_format, state.generation)
        };

        if let Err(e) = self.enable_outputs(&mode) {
            self.abort_start(generation, format!("Failed to enable output: {}", e));
            return Err(e);
        }

        if let Err(e) = self.preroll(&mode, format) {
            self.disable_outputs();
            self.abort_start(generation, format!("Preroll failed: {}", e));
            return Err(e);
        }
        debug!("Prerolled {} frames", PREROLL_FRAMES);

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                drop(state);
                self.undo_start();
                return Err(SdiError::StartInterrupted);
            }
            state.phase = OutputState::Running;
            state.config.frame_count = PREROLL_FRAMES;
            state.config.awaiting_first_tick = true;
        }

        self.audio.start();
        self.audio_live.store(true, Ordering::SeqCst);
        let started = self.device.begin_audio_preroll().and_then(|_| {
            self.device
                .start_scheduled_playback(0, mode.frame_timescale, 1.0)
        });
        if let Err(e) = started {
            self.audio_live.store(false, Ordering::SeqCst);
            self.audio.stop();
            self.disable_outputs();
            self.abort_start(generation, format!("Failed to start playback: {}", e));
            return Err(e);
        }

        // a stop that raced the playback start left the card playing
        if self.state.lock().generation != generation {
            self.undo_start();
            return Err(SdiError::StartInterrupted);
        }

        info!("Output started in {} as {}", mode, format);
        Ok(())
    }

    /// Stop output; a no-op unless prerolled or running
    pub fn stop(&self) -> Result<()> {
        if self.halt("Output paused.".to_string(), false, None) {
            info!("Output stopped");
        }
        Ok(())
    }

    /// Start when stopped, stop when running
    pub fn toggle(&self) -> Result<()> {
        if self.state().can_start() {
            self.start()
        } else {
            self.stop()
        }
    }

    pub fn state(&self) -> OutputState {
        self.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.state() == OutputState::Running
    }

    /// Frames scheduled since the last start, preroll included
    pub fn frame_count(&self) -> i64 {
        self.state.lock().config.frame_count
    }

    pub fn status(&self) -> OutputStatus {
        let state = self.state.lock();
        let mode = state.config.mode.as_ref();
        OutputStatus {
            state: state.phase,
            message: state.message.clone(),
            is_error: state.is_error,
            mode_name: mode.map(|m| m.name.clone()),
            pixel_format: state.config.pixel_format,
            width: mode.map_or(0, |m| m.width),
            height: mode.map_or(0, |m| m.height),
            fps: mode.map_or(0, DisplayMode::fps),
            frame_count: state.config.frame_count,
        }
    }

    /// Make `frame` the image shown from the next refresh on
    pub fn publish_frame(&self, frame: RenderedFrame) {
        self.handoff.publish(Arc::new(frame));
    }

    /// Audio sink for the producer thread
    pub fn audio_output(&self) -> SdiAudioOutput {
        SdiAudioOutput::new(self.audio.clone())
    }

    /// Handle a frame coming back from the card
    pub fn on_video_tick(&self, frame: DeviceFrame, result: CompletionResult) {
        let mut frame = frame;
        let (mode, display_time, first_tick, generation) = {
            let mut guard = self.state.lock();
            if guard.phase != OutputState::Running {
                trace!("Dropping returned frame, output {}", guard.phase);
                return;
            }
            if result != CompletionResult::Completed {
                debug!("Frame {} came back {:?}", guard.config.frame_count, result);
            }

            let state = &mut *guard;
            let Some(mode) = state.config.mode.clone() else {
                return;
            };

            self.emit(OutputEvent::FrameDisplayed { at: Instant::now() });
            self.emit(OutputEvent::FrameRequested {
                width: mode.width,
                height: mode.height,
            });

            if let Some(rendered) = self.handoff.take_latest() {
                match fill_frame(&state.converter, &mut state.intermediate, &rendered, &mut frame) {
                    Ok(true) => {}
                    Ok(false) => trace!(
                        "Rendered {}x{} does not fit {}x{}, holding frame",
                        rendered.width(),
                        rendered.height(),
                        frame.width(),
                        frame.height()
                    ),
                    Err(e) => warn!("Frame conversion failed, holding frame: {}", e),
                }
            }

            let display_time = state.config.frame_count * mode.frame_duration;
            state.config.frame_count += 1;
            let first_tick = std::mem::take(&mut state.config.awaiting_first_tick);
            (mode, display_time, first_tick, state.generation)
        };

        if let Err(e) = self.device.schedule_video_frame(
            frame,
            display_time,
            mode.frame_duration,
            mode.frame_timescale,
        ) {
            error!("Failed to schedule video frame at {}: {}", display_time, e);
            self.halt(
                "Failed to schedule video frame.".to_string(),
                true,
                Some(generation),
            );
            return;
        }

        if first_tick {
            self.emit(OutputEvent::Started {
                width: mode.width,
                height: mode.height,
            });
            let mut state = self.state.lock();
            if state.generation == generation {
                self.set_status(&mut state, format!("Running in mode {}.", mode.name), false);
            }
        }
    }

    /// Handle the card asking for audio
    pub fn on_audio_tick(&self, preroll: bool) {
        if !self.audio_live.load(Ordering::SeqCst) {
            return;
        }
        match self.audio.on_hardware_drain_opportunity() {
            Ok(outcome) => trace!("Audio tick (preroll: {}): {:?}", preroll, outcome),
            Err(e) => {
                error!("Audio output failed: {}", e);
                self.halt(format!("Audio output failed: {}", e), true, None);
            }
        }
    }

    fn enable_outputs(&self, mode: &DisplayMode) -> Result<()> {
        self.device.enable_video_output(mode.mode_id)?;
        if let Err(e) = self.device.enable_audio_output(&AudioFormat::DEVICE) {
            if let Err(e) = self.device.disable_video_output() {
                warn!("Failed to disable video output: {}", e);
            }
            return Err(e);
        }
        debug!("Outputs enabled, audio {}", AudioFormat::DEVICE);
        Ok(())
    }

    fn disable_outputs(&self) {
        if let Err(e) = self.device.disable_video_output() {
            warn!("Failed to disable video output: {}", e);
        }
        if let Err(e) = self.device.disable_audio_output() {
            warn!("Failed to disable audio output: {}", e);
        }
    }

    /// Queue the blank preroll frames at slots 0, 1, 2
    fn preroll(&self, mode: &DisplayMode, format: PixelFormat) -> Result<()> {
        let row_bytes = format.row_bytes(mode.width);
        for slot in 0..PREROLL_FRAMES {
            let frame = self
                .device
                .create_video_frame(
                    mode.width,
                    mode.height,
                    row_bytes,
                    format,
                    FrameFlags::FLIP_VERTICAL,
                )
                .map_err(|e| SdiError::FrameCreation(e.to_string()))?;
            self.device.schedule_video_frame(
                frame,
                slot * mode.frame_duration,
                mode.frame_duration,
                mode.frame_timescale,
            )?;
        }
        Ok(())
    }

    /// Return to `Idle` after a failed start, unless a stop got there first
    fn abort_start(&self, generation: u64, message: String) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.phase = OutputState::Idle;
            state.config.awaiting_first_tick = false;
            self.set_status(&mut state, message, true);
        }
    }

    /// Tear down whatever a start interrupted by a stop had set up
    fn undo_start(&self) {
        debug!("Start interrupted by stop, tearing down");
        self.audio_live.store(false, Ordering::SeqCst);
        self.audio.stop();
        if let Err(e) = self.device.stop_scheduled_playback() {
            warn!("Failed to stop playback: {}", e);
        }
        self.disable_outputs();
    }

    /// Enter `Stopped`: stop playback, disable outputs and wake the audio producer
    ///
    /// Only the phase change happens under the state lock, so a driver may
    /// deliver flushed frames from its own thread while stopping. With
    /// `expected` set, only that run of the output is stopped. Returns false
    /// when there was nothing to stop.
    fn halt(&self, message: String, is_error: bool, expected: Option<u64>) -> bool {
        let generation = {
            let mut state = self.state.lock();
            if !matches!(state.phase, OutputState::Prerolled | OutputState::Running) {
                debug!("Stop requested while {}", state.phase);
                return false;
            }
            if expected.is_some_and(|g| g != state.generation) {
                debug!("Stop for an earlier run ignored");
                return false;
            }
            state.phase = OutputState::Stopped;
            state.config.awaiting_first_tick = false;
            state.generation += 1;
            state.intermediate = Vec::new();
            state.generation
        };

        self.audio_live.store(false, Ordering::SeqCst);
        self.audio.stop();
        if let Err(e) = self.device.stop_scheduled_playback() {
            warn!("Failed to stop playback: {}", e);
        }
        self.disable_outputs();

        {
            let mut state = self.state.lock();
            if state.generation == generation {
                self.set_status(&mut state, message, is_error);
            }
        }
        self.emit(OutputEvent::Stopped);
        true
    }

    fn set_status(&self, state: &mut SchedulerState, message: String, is_error: bool) {
        if is_error {
            error!("{}", message);
        } else {
            info!("{}", message);
        }
        state.message = message.clone();
        state.is_error = is_error;
        self.emit(OutputEvent::Status { message, is_error });
    }

    fn emit(&self, event: OutputEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                trace!("Event channel full or closed, dropping event");
            }
        }
    }

    #[cfg(test)]
    fn intermediate_len(&self) -> usize {
        self.state.lock().intermediate.len()
    }
}

impl OutputCallbacks for OutputScheduler {
    fn frame_completed(&self, frame: DeviceFrame, result: CompletionResult) {
        self.on_video_tick(frame, result);
    }

    fn render_audio_samples(&self, preroll: bool) {
        self.on_audio_tick(preroll);
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Copy or convert `rendered` into `frame`
///
/// Returns false when the sizes differ, leaving `frame` untouched.
fn fill_frame(
    converter: &PixelConverter,
    intermediate: &mut Vec<u16>,
    rendered: &RenderedFrame,
    frame: &mut DeviceFrame,
) -> Result<bool> {
    if rendered.width() != frame.width() || rendered.height() != frame.height() {
        return Ok(false);
    }

    let pixels = rendered.pixel_count();
    let format = frame.pixel_format();
    match rendered.pixels() {
        FramePixels::Rgba16(src) => {
            converter.convert_rgba16(src, frame.bytes_mut(), pixels, format)?;
        }
        FramePixels::Rgb10(src) if format == PixelFormat::Rgb10 => {
            converter.copy_packed(&src[..format.packed_len(pixels)], frame.bytes_mut())?;
        }
        FramePixels::Rgb10(src) => {
            intermediate.resize(pixels * 4, 0);
            expand_rgb10(src, intermediate);
            converter.convert_rgba16(intermediate, frame.bytes_mut(), pixels, format)?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ModeId, NativeMode, SimulatedDevice};
    use crate::video::unpack_rgb10_word;
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    /// Card whose stop hands a flushed frame back on another thread and
    /// waits for the callback to return, as real drivers may
    struct FlushingDevice {
        inner: SimulatedDevice,
        callbacks: Mutex<Option<Weak<dyn OutputCallbacks>>>,
        stalled: AtomicBool,
    }

    impl FlushingDevice {
        fn new(inner: SimulatedDevice) -> Self {
            Self {
                inner,
                callbacks: Mutex::new(None),
                stalled: AtomicBool::new(false),
            }
        }
    }

    impl OutputDevice for FlushingDevice {
        fn name(&self) -> String {
            self.inner.name()
        }

        fn display_modes(&self) -> Result<Vec<NativeMode>> {
            self.inner.display_modes()
        }

        fn set_callbacks(&self, callbacks: Weak<dyn OutputCallbacks>) -> Result<()> {
            *self.callbacks.lock() = Some(callbacks.clone());
            self.inner.set_callbacks(callbacks)
        }

        fn enable_video_output(&self, mode: ModeId) -> Result<()> {
            self.inner.enable_video_output(mode)
        }

        fn disable_video_output(&self) -> Result<()> {
            self.inner.disable_video_output()
        }

        fn enable_audio_output(&self, format: &AudioFormat) -> Result<()> {
            self.inner.enable_audio_output(format)
        }

        fn disable_audio_output(&self) -> Result<()> {
            self.inner.disable_audio_output()
        }

        fn create_video_frame(
            &self,
            width: u32,
            height: u32,
            row_bytes: usize,
            format: PixelFormat,
            flags: FrameFlags,
        ) -> Result<DeviceFrame> {
            self.inner
                .create_video_frame(width, height, row_bytes, format, flags)
        }

        fn schedule_video_frame(
            &self,
            frame: DeviceFrame,
            display_time: i64,
            duration: i64,
            timescale: i64,
        ) -> Result<()> {
            self.inner
                .schedule_video_frame(frame, display_time, duration, timescale)
        }

        fn schedule_audio_samples(
            &self,
            samples: &[i16],
            sample_frames: u32,
            stream_time: u64,
            sample_rate: u32,
        ) -> Result<()> {
            self.inner
                .schedule_audio_samples(samples, sample_frames, stream_time, sample_rate)
        }

        fn buffered_audio_sample_frames(&self) -> Result<u32> {
            self.inner.buffered_audio_sample_frames()
        }

        fn begin_audio_preroll(&self) -> Result<()> {
            self.inner.begin_audio_preroll()
        }

        fn start_scheduled_playback(&self, start_time: i64, timescale: i64, speed: f64) -> Result<()> {
            self.inner
                .start_scheduled_playback(start_time, timescale, speed)
        }

        fn stop_scheduled_playback(&self) -> Result<()> {
            let frame = self.inner.create_video_frame(
                16,
                4,
                PixelFormat::Rgb10.row_bytes(16),
                PixelFormat::Rgb10,
                FrameFlags::DEFAULT,
            )?;
            let callbacks = self.callbacks.lock().clone();
            let (done_tx, done_rx) = bounded(1);
            thread::spawn(move || {
                if let Some(callbacks) = callbacks.and_then(|c| c.upgrade()) {
                    callbacks.frame_completed(frame, CompletionResult::Flushed);
                }
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(Duration::from_secs(2)).is_err() {
                self.stalled.store(true, Ordering::SeqCst);
            }
            self.inner.stop_scheduled_playback()
        }
    }

    fn small_device() -> SimulatedDevice {
        SimulatedDevice::with_modes(vec![
            NativeMode {
                id: ModeId(1),
                name: "16x4p60".into(),
                width: 16,
                height: 4,
                frame_duration: 1000,
                frame_timescale: 60000,
            },
            NativeMode {
                id: ModeId(2),
                name: "16x4p24".into(),
                width: 16,
                height: 4,
                frame_duration: 1000,
                frame_timescale: 24000,
            },
            NativeMode {
                id: ModeId(3),
                name: "8x2p50".into(),
                width: 8,
                height: 2,
                frame_duration: 1000,
                frame_timescale: 50000,
            },
        ])
    }

    fn small_scheduler(
        format: PixelFormat,
    ) -> (SimulatedDevice, Arc<OutputScheduler>, Receiver<OutputEvent>) {
        let device = small_device();
        let (tx, rx) = bounded(256);
        let scheduler = OutputScheduler::new(Arc::new(device.clone()), Some(tx)).unwrap();
        scheduler.set_display_mode("16 x 4", "60.0", format).unwrap();
        (device, scheduler, rx)
    }

    #[test]
    fn test_start_prerolls_and_runs() {
        let device = SimulatedDevice::new();
        let (tx, rx) = bounded(64);
        let scheduler = OutputScheduler::new(Arc::new(device.clone()), Some(tx)).unwrap();
        scheduler
            .set_display_mode("1920 x 1080", "60.0", PixelFormat::Rgb10)
            .unwrap();

        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), OutputState::Running);
        assert_eq!(scheduler.frame_count(), 3);
        assert_eq!(device.scheduled_display_times(), vec![0, 1000, 2000]);
        assert_eq!(device.live_frames(), 3);
        assert!(device.is_playing());
        assert_eq!(scheduler.status().message, "Starting output in mode 1080p60.");

        assert!(device.tick());
        assert_eq!(device.scheduled_display_times(), vec![1000, 2000, 3000]);
        assert_eq!(scheduler.frame_count(), 4);
        assert_eq!(device.live_frames(), 3);

        let status = scheduler.status();
        assert_eq!(status.message, "Running in mode 1080p60.");
        assert!(!status.is_error);
        assert_eq!(status.fps, 60);
        assert_eq!((status.width, status.height), (1920, 1080));

        let events: Vec<OutputEvent> = rx.try_iter().collect();
        assert!(matches!(events[0], OutputEvent::Status { .. }));
        assert!(matches!(events[1], OutputEvent::FrameDisplayed { .. }));
        assert!(matches!(
            events[2],
            OutputEvent::FrameRequested {
                width: 1920,
                height: 1080
            }
        ));
        assert!(matches!(
            events[3],
            OutputEvent::Started {
                width: 1920,
                height: 1080
            }
        ));

        // audio callback topped up the empty buffer with silence
        assert_eq!(device.audio_batches().len(), 1);
    }

    #[test]
    fn test_start_sequence_of_driver_calls() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb12);
        scheduler.start().unwrap();

        let names: Vec<&str> = device.calls().iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "EnableVideoOutput",
                "EnableAudioOutput",
                "CreateVideoFrame",
                "ScheduleVideoFrame",
                "CreateVideoFrame",
                "ScheduleVideoFrame",
                "CreateVideoFrame",
                "ScheduleVideoFrame",
                "BeginAudioPreroll",
                "StartScheduledPlayback",
            ]
        );
    }

    #[test]
    fn test_start_without_mode() {
        let device = small_device();
        let scheduler = OutputScheduler::new(Arc::new(device.clone()), None).unwrap();
        assert!(matches!(scheduler.start(), Err(SdiError::NoDisplayMode)));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_unknown_mode_leaves_state() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        device.clear_calls();

        let err = scheduler
            .set_display_mode("16 x 4", "59.94", PixelFormat::Rgb10)
            .unwrap_err();
        assert!(err.is_configuration_error());
        assert_eq!(scheduler.state(), OutputState::Running);
        assert_eq!(scheduler.display_mode().unwrap().refresh_rate, "60.0");
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.stop().unwrap();
        assert_eq!(scheduler.state(), OutputState::Idle);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_double_start_rejected() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        device.clear_calls();

        assert!(matches!(scheduler.start(), Err(SdiError::AlreadyRunning)));
        assert!(device.calls().is_empty());
        assert_eq!(scheduler.frame_count(), 3);
    }

    #[test]
    fn test_stop_and_restart() {
        let (device, scheduler, rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        device.tick();
        device.tick();
        assert_eq!(scheduler.frame_count(), 5);

        scheduler.stop().unwrap();
        assert_eq!(scheduler.state(), OutputState::Stopped);
        assert!(!device.is_playing());
        assert_eq!(device.video_mode(), None);
        assert!(!device.audio_enabled());
        assert_eq!(device.live_frames(), 0);
        let status = scheduler.status();
        assert_eq!(status.message, "Output paused.");
        assert!(!status.is_error);
        assert!(rx.try_iter().any(|e| matches!(e, OutputEvent::Stopped)));

        // frames returned after stop are released, not rescheduled
        assert!(!device.tick());

        scheduler.start().unwrap();
        assert_eq!(scheduler.frame_count(), 3);
        assert_eq!(device.scheduled_display_times(), vec![0, 1000, 2000]);
    }

    #[test]
    fn test_toggle() {
        let (_device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.toggle().unwrap();
        assert!(scheduler.is_running());
        scheduler.toggle().unwrap();
        assert_eq!(scheduler.state(), OutputState::Stopped);
        scheduler.toggle().unwrap();
        assert!(scheduler.is_running());
    }

    #[test]
    fn test_schedule_failure_stops_output() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        device.fail_on("ScheduleVideoFrame");

        device.tick();
        assert_eq!(scheduler.state(), OutputState::Stopped);
        let status = scheduler.status();
        assert!(status.is_error);
        assert_eq!(status.message, "Failed to schedule video frame.");
        assert!(!device.is_playing());
        assert_eq!(device.live_frames(), 0);
    }

    #[test]
    fn test_preroll_failure_releases_frames() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        device.fail_after("CreateVideoFrame", 2);

        let err = scheduler.start().unwrap_err();
        assert!(matches!(err, SdiError::FrameCreation(_)));
        assert_eq!(scheduler.state(), OutputState::Idle);
        assert_eq!(device.live_frames(), 0);
        assert_eq!(device.video_mode(), None);
        assert!(!device.audio_enabled());
        assert!(scheduler.status().is_error);
    }

    #[test]
    fn test_audio_enable_failure_disables_video() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        device.fail_on("EnableAudioOutput");

        assert!(scheduler.start().is_err());
        assert_eq!(scheduler.state(), OutputState::Idle);
        assert_eq!(device.video_mode(), None);
        assert_eq!(device.call_count("CreateVideoFrame"), 0);
    }

    #[test]
    fn test_playback_failure_returns_to_idle() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        device.fail_on("StartScheduledPlayback");

        assert!(scheduler.start().is_err());
        assert_eq!(scheduler.state(), OutputState::Idle);
        assert!(scheduler.status().is_error);
        assert_eq!(device.live_frames(), 0);
        assert!(!scheduler.audio_output().is_active());

        device.clear_failures();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
    }

    #[test]
    fn test_rendered_frame_converted() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();

        let white = RenderedFrame::rgba16(16, 4, vec![u16::MAX; 16 * 4 * 4]).unwrap();
        scheduler.publish_frame(white);
        device.tick();

        let bytes = device.scheduled_frame_bytes(3000).unwrap();
        assert_eq!(bytes.len(), 16 * 4 * 4);
        for word in bytes.chunks_exact(4) {
            assert_eq!(
                unpack_rgb10_word([word[0], word[1], word[2], word[3]]),
                [1023, 1023, 1023]
            );
        }
        // preroll frames stay black
        assert!(device.scheduled_frame_bytes(1000).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_latest_frame_repeated() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        scheduler.publish_frame(RenderedFrame::rgba16(16, 4, vec![u16::MAX; 256]).unwrap());

        device.tick();
        device.tick();
        let first = device.scheduled_frame_bytes(3000).unwrap();
        let second = device.scheduled_frame_bytes(4000).unwrap();
        assert_eq!(first, second);
        assert!(second.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_mismatched_frame_held() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        scheduler.publish_frame(RenderedFrame::rgba16(8, 4, vec![u16::MAX; 128]).unwrap());

        device.tick();
        assert!(scheduler.is_running());
        assert!(device.scheduled_frame_bytes(3000).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_packed_source_copied_for_rgb10() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        let packed: Vec<u8> = (0..256).map(|i| i as u8).collect();
        scheduler.publish_frame(RenderedFrame::rgb10(16, 4, packed.clone()).unwrap());

        device.tick();
        assert_eq!(device.scheduled_frame_bytes(3000).unwrap(), packed);
        assert_eq!(scheduler.intermediate_len(), 0);
    }

    #[test]
    fn test_packed_source_staged_for_rgb12() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb12Le);
        scheduler.start().unwrap();
        // 0x3ff in every channel
        let packed: Vec<u8> = [0x3f, 0xff, 0xff, 0xff].repeat(64);
        scheduler.publish_frame(RenderedFrame::rgb10(16, 4, packed).unwrap());

        device.tick();
        assert_eq!(scheduler.intermediate_len(), 16 * 4 * 4);
        let bytes = device.scheduled_frame_bytes(3000).unwrap();
        assert!(bytes[..PixelFormat::Rgb12Le.packed_len(64)].iter().any(|&b| b != 0));

        scheduler.stop().unwrap();
        assert_eq!(scheduler.intermediate_len(), 0);
    }

    #[test]
    fn test_audio_query_failure_stops_output() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        device.fail_on("GetBufferedAudioSampleFrameCount");

        device.tick();
        assert_eq!(scheduler.state(), OutputState::Stopped);
        assert!(scheduler.status().is_error);
    }

    #[test]
    fn test_audio_water_level_gates_top_up() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.set_audio_water_level(1000);
        scheduler.start().unwrap();

        device.set_buffered_audio(5000);
        device.tick();
        // 800 consumed by the tick, 4200 still above the water level
        assert!(device.audio_batches().is_empty());

        device.set_buffered_audio(1800);
        device.tick();
        assert_eq!(device.audio_batches().len(), 1);
    }

    #[test]
    fn test_stop_releases_audio_producer() {
        let (_device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        let output = scheduler.audio_output();
        let producer = thread::spawn(move || output.push_samples(&[0i16; 4096]).unwrap());

        thread::sleep(Duration::from_millis(50));
        scheduler.stop().unwrap();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn test_apply_settings_auto_start() {
        let (_device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        let settings = OutputSettings {
            resolution: "16 x 4".into(),
            refresh_rate: "24.0".into(),
            pixel_format: "12 bit RGB".into(),
            audio_water_level: 2048,
            audio_sync_delay_ms: 20,
            auto_start: true,
            converter_threads: 2,
            ..OutputSettings::default()
        };

        scheduler.apply_settings(&settings).unwrap();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.pixel_format(), PixelFormat::Rgb12);
        assert_eq!(scheduler.status().fps, 24);
    }

    #[test]
    fn test_apply_settings_rejects_bad_format() {
        let (_device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        let settings = OutputSettings {
            resolution: "16 x 4".into(),
            refresh_rate: "60.0".into(),
            pixel_format: "8 bit YUV".into(),
            auto_start: true,
            ..OutputSettings::default()
        };

        let err = scheduler.apply_settings(&settings).unwrap_err();
        assert!(matches!(err, SdiError::InvalidPixelFormat(_)));
        assert_eq!(scheduler.state(), OutputState::Idle);
        assert!(scheduler.status().is_error);
    }

    #[test]
    fn test_mode_change_restarts_output() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        device.tick();

        scheduler
            .set_display_mode("16 x 4", "24.0", PixelFormat::Rgb10Le)
            .unwrap();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.frame_count(), 3);
        assert_eq!(device.video_mode(), Some(ModeId(2)));
    }

    #[test]
    fn test_dropped_scheduler_detaches() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();
        drop(scheduler);
        assert!(!device.is_playing());
        assert!(!device.tick());
    }

    #[test]
    fn test_stop_lets_driver_flush_from_its_thread() {
        let device = Arc::new(FlushingDevice::new(small_device()));
        let scheduler = OutputScheduler::new(device.clone(), None).unwrap();
        scheduler
            .set_display_mode("16 x 4", "60.0", PixelFormat::Rgb10)
            .unwrap();
        scheduler.start().unwrap();
        device.inner.tick();

        let stopping = Instant::now();
        scheduler.stop().unwrap();
        assert!(!device.stalled.load(Ordering::SeqCst));
        assert!(stopping.elapsed() < Duration::from_secs(2));
        assert_eq!(scheduler.state(), OutputState::Stopped);
        assert_eq!(scheduler.status().message, "Output paused.");
        assert_eq!(device.inner.live_frames(), 0);
    }

    #[test]
    fn test_set_resolution_keeps_current_rate() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb12);
        scheduler
            .set_display_mode("16 x 4", "24.0", PixelFormat::Rgb12)
            .unwrap();

        assert_eq!(scheduler.set_resolution("16 x 4").unwrap(), "24.0");
        assert_eq!(scheduler.display_mode().unwrap().mode_id, ModeId(2));
        assert_eq!(scheduler.pixel_format(), PixelFormat::Rgb12);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_set_resolution_without_current_rate() {
        let (device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        scheduler.start().unwrap();

        assert_eq!(scheduler.set_resolution("8 x 2").unwrap(), "50.0");
        let mode = scheduler.display_mode().unwrap();
        assert_eq!((mode.width, mode.height), (8, 2));
        assert!(scheduler.is_running());
        assert_eq!(device.video_mode(), Some(ModeId(3)));
    }

    #[test]
    fn test_set_resolution_unknown() {
        let (_device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        let err = scheduler.set_resolution("640 x 480").unwrap_err();
        assert!(matches!(err, SdiError::DisplayModeNotFound { .. }));
        assert_eq!(scheduler.display_mode().unwrap().refresh_rate, "60.0");
    }

    #[test]
    fn test_apply_settings_falls_back_to_offered_rate() {
        let (_device, scheduler, _rx) = small_scheduler(PixelFormat::Rgb10);
        let settings = OutputSettings {
            resolution: "8 x 2".into(),
            refresh_rate: "60.0".into(),
            pixel_format: "10 bit RGB".into(),
            ..OutputSettings::default()
        };

        scheduler.apply_settings(&settings).unwrap();
        let mode = scheduler.display_mode().unwrap();
        assert_eq!(mode.refresh_rate, "50.0");
        assert_eq!(mode.mode_id, ModeId(3));
        assert!(!scheduler.status().is_error);
    }

    #[test]
    fn test_free_running_device() {
        let device = small_device().free_running();
        let scheduler = OutputScheduler::new(Arc::new(device.clone()), None).unwrap();
        scheduler
            .set_display_mode("16 x 4", "60.0", PixelFormat::Rgb10)
            .unwrap();
        scheduler.start().unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(device.frames_completed() > 0);
        assert!(scheduler.frame_count() > 3);

        scheduler.stop().unwrap();
        assert!(!device.is_playing());
    }
}
