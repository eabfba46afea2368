//! Output state machine driven by the card's callbacks

mod scheduler;
mod status;

pub use scheduler::{OutputScheduler, PREROLL_FRAMES};
pub use status::{OutputEvent, OutputState, OutputStatus};
