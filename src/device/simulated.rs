//! Software output card
//!
//! Behaves like a single output card: it keeps scheduled frames in display
//! order, consumes buffered audio at the sample rate, and hands frames back
//! through the registered callbacks one refresh period at a time. Ticks are
//! either driven by hand through [`SimulatedDevice::tick`] or, for a
//! free-running device, by a driver thread started with scheduled playback.

use crate::audio::AudioFormat;
use crate::device::{
    CompletionResult, DeviceFrame, FrameFlags, ModeId, NativeMode, OutputCallbacks, OutputDevice,
};
use crate::error::{Result, SdiError};
use crate::sync::{SampleCadence, TickClock};
use crate::video::PixelFormat;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, trace, warn};

/// Entries kept in the call log
const CALL_LOG_CAPACITY: usize = 4096;

/// A driver call as recorded by the simulated card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    EnableVideo(ModeId),
    DisableVideo,
    EnableAudio,
    DisableAudio,
    CreateFrame,
    ScheduleVideo { display_time: i64 },
    ScheduleAudio { sample_frames: u32, stream_time: u64 },
    QueryBufferedAudio,
    BeginAudioPreroll,
    StartPlayback,
    StopPlayback,
}

impl DeviceCall {
    /// Driver call name, as used for failure injection and error messages
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCall::EnableVideo(_) => "EnableVideoOutput",
            DeviceCall::DisableVideo => "DisableVideoOutput",
            DeviceCall::EnableAudio => "EnableAudioOutput",
            DeviceCall::DisableAudio => "DisableAudioOutput",
            DeviceCall::CreateFrame => "CreateVideoFrame",
            DeviceCall::ScheduleVideo { .. } => "ScheduleVideoFrame",
            DeviceCall::ScheduleAudio { .. } => "ScheduleAudioSamples",
            DeviceCall::QueryBufferedAudio => "GetBufferedAudioSampleFrameCount",
            DeviceCall::BeginAudioPreroll => "BeginAudioPreroll",
            DeviceCall::StartPlayback => "StartScheduledPlayback",
            DeviceCall::StopPlayback => "StopScheduledPlayback",
        }
    }
}

#[derive(Default)]
struct SimState {
    callbacks: Option<Weak<dyn OutputCallbacks>>,
    video_mode: Option<ModeId>,
    audio_enabled: bool,
    audio_preroll: bool,
    playing: bool,
    generation: u64,
    scheduled: VecDeque<(i64, DeviceFrame)>,
    cadence: Option<SampleCadence>,
    buffered_audio: u32,
    audio_batches: Vec<(u64, u32)>,
    last_audio_batch: Vec<i16>,
    frames_completed: u64,
    calls: VecDeque<DeviceCall>,
    /// Remaining successful calls before a call name starts failing
    failures: HashMap<&'static str, usize>,
}

struct SimInner {
    modes: Vec<NativeMode>,
    free_running: AtomicBool,
    live_frames: Arc<AtomicUsize>,
    state: Mutex<SimState>,
}

/// Software output card for tests and dry runs
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<SimInner>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Card offering [`SimulatedDevice::standard_modes`], ticked by hand
    pub fn new() -> Self {
        Self::with_modes(Self::standard_modes())
    }

    pub fn with_modes(modes: Vec<NativeMode>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                modes,
                free_running: AtomicBool::new(false),
                live_frames: Arc::new(AtomicUsize::new(0)),
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    /// Run a driver thread at the display refresh rate while playback is on
    pub fn free_running(self) -> Self {
        self.inner.free_running.store(true, Ordering::SeqCst);
        self
    }

    /// A typical broadcast card's mode list, interlaced modes included
    pub fn standard_modes() -> Vec<NativeMode> {
        let table: &[(&str, u32, u32, i64, i64)] = &[
            ("NTSC", 720, 486, 1001, 30000),
            ("PAL", 720, 576, 1000, 25000),
            ("720p50", 1280, 720, 1000, 50000),
            ("720p59.94", 1280, 720, 1001, 60000),
            ("720p60", 1280, 720, 1000, 60000),
            ("1080p23.98", 1920, 1080, 1001, 24000),
            ("1080p24", 1920, 1080, 1000, 24000),
            ("1080p25", 1920, 1080, 1000, 25000),
            ("1080p29.97", 1920, 1080, 1001, 30000),
            ("1080p30", 1920, 1080, 1000, 30000),
            ("1080i50", 1920, 1080, 1000, 25000),
            ("1080i59.94", 1920, 1080, 1001, 30000),
            ("1080i60", 1920, 1080, 1000, 30000),
            ("1080p50", 1920, 1080, 1000, 50000),
            ("1080p59.94", 1920, 1080, 1001, 60000),
            ("1080p60", 1920, 1080, 1000, 60000),
            ("2K DCI 24p", 2048, 1080, 1000, 24000),
            ("2160p23.98", 3840, 2160, 1001, 24000),
            ("2160p24", 3840, 2160, 1000, 24000),
            ("2160p25", 3840, 2160, 1000, 25000),
            ("2160p30", 3840, 2160, 1000, 30000),
            ("2160p50", 3840, 2160, 1000, 50000),
            ("2160p59.94", 3840, 2160, 1001, 60000),
            ("2160p60", 3840, 2160, 1000, 60000),
        ];

        table
            .iter()
            .enumerate()
            .map(|(i, &(name, width, height, duration, timescale))| NativeMode {
                id: ModeId(i as u32 + 1),
                name: name.to_string(),
                width,
                height,
                frame_duration: duration,
                frame_timescale: timescale,
            })
            .collect()
    }

    /// Make `call` fail from now on
    pub fn fail_on(&self, call: &'static str) {
        self.fail_after(call, 0);
    }

    /// Let `call` succeed `successes` more times, then fail
    pub fn fail_after(&self, call: &'static str, successes: usize) {
        self.inner.state.lock().failures.insert(call, successes);
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.inner.state.lock().failures.clear();
    }

    /// Recorded driver calls, oldest first
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.inner.state.lock().calls.iter().cloned().collect()
    }

    /// How many recorded calls have the given name
    pub fn call_count(&self, call: &str) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| c.name() == call)
            .count()
    }

    pub fn clear_calls(&self) {
        self.inner.state.lock().calls.clear();
    }

    /// Display times of the frames waiting on the card
    pub fn scheduled_display_times(&self) -> Vec<i64> {
        self.inner
            .state
            .lock()
            .scheduled
            .iter()
            .map(|(time, _)| *time)
            .collect()
    }

    /// Contents of the frame waiting at `display_time`
    pub fn scheduled_frame_bytes(&self, display_time: i64) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .scheduled
            .iter()
            .find(|(time, _)| *time == display_time)
            .map(|(_, frame)| frame.bytes().to_vec())
    }

    /// Frames allocated and not yet released
    pub fn live_frames(&self) -> usize {
        self.inner.live_frames.load(Ordering::SeqCst)
    }

    pub fn frames_completed(&self) -> u64 {
        self.inner.state.lock().frames_completed
    }

    pub fn set_buffered_audio(&self, sample_frames: u32) {
        self.inner.state.lock().buffered_audio = sample_frames;
    }

    pub fn buffered_audio(&self) -> u32 {
        self.inner.state.lock().buffered_audio
    }

    /// `(stream_time, sample_frames)` of every audio batch scheduled
    pub fn audio_batches(&self) -> Vec<(u64, u32)> {
        self.inner.state.lock().audio_batches.clone()
    }

    pub fn last_audio_batch(&self) -> Vec<i16> {
        self.inner.state.lock().last_audio_batch.clone()
    }

    pub fn video_mode(&self) -> Option<ModeId> {
        self.inner.state.lock().video_mode
    }

    pub fn audio_enabled(&self) -> bool {
        self.inner.state.lock().audio_enabled
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().playing
    }

    /// Advance the card by one refresh period
    ///
    /// Hands the oldest scheduled frame back through the frame callback,
    /// consumes one period of buffered audio and fires the audio callback.
    /// Returns true if a frame completed.
    pub fn tick(&self) -> bool {
        self.inner.tick()
    }
}

impl SimInner {
    fn tick(&self) -> bool {
        let (callbacks, completed, audio_preroll, audio_live) = {
            let mut state = self.state.lock();
            let callbacks = state.callbacks.as_ref().and_then(Weak::upgrade);

            if state.playing {
                let consumed = state.cadence.as_mut().map_or(0, SampleCadence::next_frames);
                state.buffered_audio = state.buffered_audio.saturating_sub(consumed);
                let completed = state.scheduled.pop_front().map(|(_, frame)| frame);
                if completed.is_some() {
                    state.frames_completed += 1;
                }
                (callbacks, completed, false, state.audio_enabled)
            } else {
                (callbacks, None, state.audio_preroll, state.audio_preroll)
            }
        };

        let Some(callbacks) = callbacks else {
            trace!("Simulated card ticked without callbacks");
            return false;
        };

        let had_frame = completed.is_some();
        if let Some(frame) = completed {
            callbacks.frame_completed(frame, CompletionResult::Completed);
        }
        if audio_live {
            callbacks.render_audio_samples(audio_preroll);
        }
        had_frame
    }

    /// Record `call` and apply any injected failure
    fn record(&self, state: &mut SimState, call: DeviceCall) -> Result<()> {
        let name = call.name();
        if state.calls.len() == CALL_LOG_CAPACITY {
            state.calls.pop_front();
        }
        state.calls.push_back(call);

        if let Some(remaining) = state.failures.get_mut(name) {
            if *remaining == 0 {
                warn!("Simulated card failing {}", name);
                return Err(SdiError::device(name, "simulated failure"));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn still_playing(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.playing && state.generation == generation
    }
}

/// Driver thread for a free-running card
fn driver_thread(inner: Arc<SimInner>, generation: u64, duration: i64, timescale: i64) {
    debug!("Simulated driver thread {} started", generation);
    let mut clock = TickClock::for_frame_rate(duration, timescale);

    loop {
        clock.wait_next();
        if !inner.still_playing(generation) {
            break;
        }
        inner.tick();
    }

    debug!(
        "Simulated driver thread {} stopped after {} ticks",
        generation,
        clock.ticks()
    );
}

impl OutputDevice for SimulatedDevice {
    fn name(&self) -> String {
        "Simulated SDI output".to_string()
    }

    fn display_modes(&self) -> Result<Vec<NativeMode>> {
        Ok(self.inner.modes.clone())
    }

    fn set_callbacks(&self, callbacks: Weak<dyn OutputCallbacks>) -> Result<()> {
        self.inner.state.lock().callbacks = Some(callbacks);
        Ok(())
    }

    fn enable_video_output(&self, mode: ModeId) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::EnableVideo(mode))?;

        let native = self
            .inner
            .modes
            .iter()
            .find(|m| m.id == mode)
            .ok_or_else(|| SdiError::device("EnableVideoOutput", "unknown display mode"))?;
        state.cadence = Some(SampleCadence::new(
            AudioFormat::DEVICE.sample_rate,
            native.frame_duration,
            native.frame_timescale,
        ));
        state.video_mode = Some(mode);
        info!("Simulated card video enabled in mode {}", native.name);
        Ok(())
    }

    fn disable_video_output(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::DisableVideo)?;
        state.video_mode = None;
        state.scheduled.clear();
        Ok(())
    }

    fn enable_audio_output(&self, format: &AudioFormat) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::EnableAudio)?;
        if *format != AudioFormat::DEVICE {
            return Err(SdiError::device(
                "EnableAudioOutput",
                format!("unsupported audio format {}", format),
            ));
        }
        state.audio_enabled = true;
        state.buffered_audio = 0;
        Ok(())
    }

    fn disable_audio_output(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::DisableAudio)?;
        state.audio_enabled = false;
        state.audio_preroll = false;
        state.buffered_audio = 0;
        Ok(())
    }

    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        format: PixelFormat,
        flags: FrameFlags,
    ) -> Result<DeviceFrame> {
        {
            let mut state = self.inner.state.lock();
            self.inner.record(&mut state, DeviceCall::CreateFrame)?;
        }

        let live = self.inner.live_frames.clone();
        live.fetch_add(1, Ordering::SeqCst);
        Ok(
            DeviceFrame::new(width, height, row_bytes, format, flags).with_release_hook(move || {
                live.fetch_sub(1, Ordering::SeqCst);
            }),
        )
    }

    fn schedule_video_frame(
        &self,
        frame: DeviceFrame,
        display_time: i64,
        _duration: i64,
        _timescale: i64,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner
            .record(&mut state, DeviceCall::ScheduleVideo { display_time })?;
        if state.video_mode.is_none() {
            return Err(SdiError::device(
                "ScheduleVideoFrame",
                "video output not enabled",
            ));
        }
        state.scheduled.push_back((display_time, frame));
        Ok(())
    }

    fn schedule_audio_samples(
        &self,
        samples: &[i16],
        sample_frames: u32,
        stream_time: u64,
        _sample_rate: u32,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(
            &mut state,
            DeviceCall::ScheduleAudio {
                sample_frames,
                stream_time,
            },
        )?;
        if !state.audio_enabled {
            return Err(SdiError::device(
                "ScheduleAudioSamples",
                "audio output not enabled",
            ));
        }
        state.buffered_audio += sample_frames;
        state.audio_batches.push((stream_time, sample_frames));
        state.last_audio_batch = samples.to_vec();
        Ok(())
    }

    fn buffered_audio_sample_frames(&self) -> Result<u32> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::QueryBufferedAudio)?;
        Ok(state.buffered_audio)
    }

    fn begin_audio_preroll(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::BeginAudioPreroll)?;
        state.audio_preroll = state.audio_enabled;
        Ok(())
    }

    fn start_scheduled_playback(&self, _start_time: i64, _timescale: i64, _speed: f64) -> Result<()> {
        let timing = {
            let mut state = self.inner.state.lock();
            self.inner.record(&mut state, DeviceCall::StartPlayback)?;
            let mode = state
                .video_mode
                .ok_or_else(|| SdiError::device("StartScheduledPlayback", "video output not enabled"))?;
            state.playing = true;
            state.audio_preroll = false;
            state.generation += 1;

            self.inner
                .modes
                .iter()
                .find(|m| m.id == mode)
                .map(|m| (state.generation, m.frame_duration, m.frame_timescale))
        };

        if self.inner.free_running.load(Ordering::SeqCst) {
            if let Some((generation, duration, timescale)) = timing {
                let inner = self.inner.clone();
                // exits on its own once playback stops
                thread::spawn(move || driver_thread(inner, generation, duration, timescale));
            }
        }
        Ok(())
    }

    fn stop_scheduled_playback(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.record(&mut state, DeviceCall::StopPlayback)?;
        state.playing = false;
        state.scheduled.clear();
        Ok(())
    }
}
