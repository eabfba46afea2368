//! Frame-rate tick clock and audio cadence for a software driver thread

use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Ticks late by more than this many periods are skipped instead of replayed
const MAX_LATE_TICKS: u64 = 2;

/// Fixed-period tick clock
///
/// Deadlines are computed from the start instant (`start + n * period`), so
/// sleep overshoot does not accumulate into drift.
pub struct TickClock {
    start: Instant,
    period: Duration,
    ticks: u64,
}

impl TickClock {
    /// Clock ticking once per video frame of `frame_duration / frame_timescale` seconds
    pub fn for_frame_rate(frame_duration: i64, frame_timescale: i64) -> Self {
        let nanos = frame_duration.max(1) as u128 * 1_000_000_000 / frame_timescale.max(1) as u128;
        Self::new(Duration::from_nanos(nanos as u64))
    }

    pub fn new(period: Duration) -> Self {
        debug!("Tick clock period: {:?}", period);
        Self {
            start: Instant::now(),
            period,
            ticks: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks elapsed so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Deadline of the next tick
    pub fn next_deadline(&self) -> Instant {
        let nanos = self
            .period
            .as_nanos()
            .saturating_mul(self.ticks as u128 + 1);
        let offset = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        self.start.checked_add(offset).unwrap_or_else(Instant::now)
    }

    /// Sleep until the next tick is due
    pub fn wait_next(&mut self) {
        let now = Instant::now();
        let deadline = self.next_deadline();

        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            let late = now - deadline;
            let late_ticks = (late.as_nanos() / self.period.as_nanos().max(1)) as u64;
            if late_ticks > MAX_LATE_TICKS {
                debug!("Tick clock {} periods late, skipping ahead", late_ticks);
                self.ticks += late_ticks;
            } else {
                trace!("Tick clock late by {:?}", late);
            }
        }
        self.ticks += 1;
    }
}

/// Whole audio sample frames consumed per video frame
///
/// Carries the fractional remainder forward, so at 59.94 Hz the cadence
/// alternates 800/801 frames and sums exactly to the sample rate over time.
#[derive(Debug, Clone)]
pub struct SampleCadence {
    numerator: u64,
    denominator: u64,
    remainder: u64,
}

impl SampleCadence {
    pub fn new(sample_rate: u32, frame_duration: i64, frame_timescale: i64) -> Self {
        Self {
            numerator: sample_rate as u64 * frame_duration.max(1) as u64,
            denominator: frame_timescale.max(1) as u64,
            remainder: 0,
        }
    }

    /// Sample frames for the next video frame
    pub fn next_frames(&mut self) -> u32 {
        let total = self.numerator + self.remainder;
        self.remainder = total % self.denominator;
        (total / self.denominator) as u32
    }
}
