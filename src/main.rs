//! sdiout - SDI playout CLI

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sdiout::audio::SdiAudioOutput;
use sdiout::config::{Args, Command, OutputSettings};
use sdiout::device::{OutputDevice, SimulatedDevice};
use sdiout::output::{OutputEvent, OutputScheduler};
use sdiout::video::RenderedFrame;

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = load_settings(&args)?;

    // Initialize logging
    init_logging(&args, &settings)?;

    // Execute command
    match args.command.unwrap_or_default() {
        Command::Modes => cmd_modes(),
        Command::Rates { resolution } => cmd_rates(&resolution),
        Command::Run {
            resolution,
            rate,
            format,
            seconds,
            tone,
        } => {
            let mut settings = settings;
            if let Some(resolution) = resolution {
                settings.resolution = resolution;
            }
            if let Some(rate) = rate {
                settings.refresh_rate = rate;
            }
            if let Some(format) = format {
                settings.pixel_format = format;
            }
            cmd_run(settings, seconds.map(Duration::from_secs), tone)
        }
        Command::Config { output } => cmd_config(output),
    }
}

fn load_settings(args: &Args) -> Result<OutputSettings> {
    let settings = match &args.config {
        Some(path) => OutputSettings::load(path)?,
        None => OutputSettings::load_default()?,
    };
    Ok(settings)
}

fn init_logging(args: &Args, settings: &OutputSettings) -> Result<()> {
    // flags win over the settings file
    let level = if args.verbose > 0 || args.quiet {
        args.log_level().to_string()
    } else {
        settings.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args.log.as_ref().map(PathBuf::from).or_else(|| settings.log_path());
    if let Some(log_file) = log_file {
        let file = std::fs::File::create(&log_file)
            .with_context(|| format!("Failed to create log file {:?}", log_file))?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// List the card's progressive display modes
fn cmd_modes() -> Result<()> {
    let device = SimulatedDevice::new();
    let name = device.name();
    let scheduler = OutputScheduler::new(Arc::new(device), None)?;

    println!("Display modes of {}:\n", name);
    for mode in scheduler.catalog().modes() {
        println!(
            "  {:<14} {:>12} @ {:<7} Hz",
            mode.name, mode.resolution, mode.refresh_rate
        );
    }

    println!("\nResolutions:");
    for resolution in scheduler.resolution_names() {
        println!(
            "  {:<12} {}",
            resolution,
            scheduler.refresh_rates_for(&resolution).join(", ")
        );
    }
    println!();
    Ok(())
}

/// List refresh rates offered at one resolution
fn cmd_rates(resolution: &str) -> Result<()> {
    let scheduler = OutputScheduler::new(Arc::new(SimulatedDevice::new()), None)?;
    for rate in scheduler.refresh_rates_for(resolution) {
        println!("{}", rate);
    }
    Ok(())
}

/// Print or write a sample settings file
fn cmd_config(output: Option<PathBuf>) -> Result<()> {
    let sample = OutputSettings::sample_config();
    match output {
        Some(path) => {
            std::fs::write(&path, sample)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote sample settings to {}", path.display());
        }
        None => print!("{}", sample),
    }
    Ok(())
}

/// Drive the software card with a test pattern and a tone
fn cmd_run(settings: OutputSettings, duration: Option<Duration>, tone_hz: f32) -> Result<()> {
    println!("sdiout {} - SDI playout\n", sdiout::VERSION);

    let device = SimulatedDevice::new().free_running();
    let (event_tx, event_rx) = bounded(256);
    let scheduler = OutputScheduler::new(Arc::new(device.clone()), Some(event_tx))?;

    if let Err(e) = scheduler.apply_settings(&settings) {
        error!("Failed to apply settings: {}", e);
        println!(
            "Use 'sdiout modes' to list resolutions and 'sdiout rates <resolution>' for refresh rates."
        );
        return Err(e.into());
    }

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let renderer = {
        let scheduler = scheduler.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("renderer".into())
            .spawn(move || render_thread(scheduler, event_rx, running))?
    };

    if !scheduler.is_running() {
        scheduler.start()?;
    }
    println!("{}", scheduler.status());

    let tone = {
        let output = scheduler.audio_output();
        let running = running.clone();
        thread::Builder::new()
            .name("tone".into())
            .spawn(move || tone_thread(output, tone_hz, running))?
    };

    println!("\nOutput running. Press Ctrl+C to stop.\n");
    let started = Instant::now();
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) && scheduler.is_running() {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let latency = scheduler
                .audio_output()
                .latency_microseconds()
                .unwrap_or_default();
            println!(
                "{} | frames {} | audio latency {:.1} ms",
                scheduler.status(),
                device.frames_completed(),
                latency as f64 / 1000.0
            );
        }
        thread::sleep(Duration::from_millis(50));
    }

    running.store(false, Ordering::SeqCst);
    scheduler.stop()?;

    if tone.join().is_err() {
        warn!("Tone thread panicked");
    }
    if renderer.join().is_err() {
        warn!("Renderer thread panicked");
    }

    let status = scheduler.status();
    println!("{}", status);
    if status.is_error {
        anyhow::bail!("{}", status.message);
    }
    println!("Stopped.");
    Ok(())
}

/// Render a frame each time the scheduler asks for one
fn render_thread(
    scheduler: Arc<OutputScheduler>,
    events: Receiver<OutputEvent>,
    running: Arc<AtomicBool>,
) {
    info!("Renderer thread started");
    let mut frame_number = 0u64;

    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(OutputEvent::FrameRequested { width, height }) => {
                match RenderedFrame::rgba16(width, height, color_bars(width, height, frame_number))
                {
                    Ok(frame) => scheduler.publish_frame(frame),
                    Err(e) => warn!("Failed to build test pattern: {}", e),
                }
                frame_number += 1;
            }
            Ok(OutputEvent::Started { width, height }) => {
                info!("Output started at {}x{}", width, height);
            }
            Ok(OutputEvent::Status { message, is_error }) => {
                if is_error {
                    println!("Error: {}", message);
                } else {
                    println!("{}", message);
                }
            }
            Ok(OutputEvent::Stopped) => {
                debug!("Renderer saw output stop");
            }
            Ok(OutputEvent::FrameDisplayed { .. }) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Renderer thread stopped after {} frames", frame_number);
}

/// 75% color bars with a white line sweeping down the picture
fn color_bars(width: u32, height: u32, frame_number: u64) -> Vec<u16> {
    const LEVEL: u16 = 0xbfff;
    const BARS: [[u16; 3]; 8] = [
        [LEVEL, LEVEL, LEVEL],
        [LEVEL, LEVEL, 0],
        [0, LEVEL, LEVEL],
        [0, LEVEL, 0],
        [LEVEL, 0, LEVEL],
        [LEVEL, 0, 0],
        [0, 0, LEVEL],
        [0, 0, 0],
    ];

    let (width, height) = (width as usize, height as usize);
    let sweep = (frame_number as usize * 4) % height.max(1);
    let mut data = vec![0u16; width * height * 4];

    for (y, row) in data.chunks_exact_mut(width * 4).enumerate() {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let [r, g, b] = if y == sweep {
                [u16::MAX; 3]
            } else {
                BARS[x * BARS.len() / width]
            };
            px.copy_from_slice(&[r, g, b, u16::MAX]);
        }
    }
    data
}

/// Feed a stereo sine tone until output stops
fn tone_thread(output: SdiAudioOutput, frequency: f32, running: Arc<AtomicBool>) {
    info!("Tone thread started at {} Hz", frequency);
    let step = TAU * frequency / output.sample_rate() as f32;
    let mut phase = 0.0f32;
    let mut chunk = vec![0i16; output.desired_samples() * output.channels() as usize];

    while running.load(Ordering::SeqCst) {
        for frame in chunk.chunks_exact_mut(output.channels() as usize) {
            let sample = (phase.sin() * 0.25 * i16::MAX as f32) as i16;
            frame.fill(sample);
            phase = (phase + step) % TAU;
        }

        match output.push_samples(&chunk) {
            Ok(true) => {}
            Ok(false) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                // output stopped underneath us
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                error!("Failed to push audio: {}", e);
                break;
            }
        }
    }

    info!("Tone thread stopped");
}
