//! Timing helpers for driver threads

mod clock;

pub use clock::{SampleCadence, TickClock};
