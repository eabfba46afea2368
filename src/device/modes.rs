//! Display mode catalog built from the driver's native mode list

use crate::device::filter::InterlaceFilter;
use crate::device::{ModeId, NativeMode};
use crate::error::{Result, SdiError};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Refresh-rate list returned for a resolution the device does not offer
pub const NO_SUCH_RESOLUTION: &str = "Bad Resolution";

/// Refresh rates tried, in order, when the current one is unavailable
const FALLBACK_REFRESH_RATES: &[&str] = &["24.0", "60.0"];

/// A progressive display mode the card supports
#[derive(Clone, PartialEq, Eq)]
pub struct DisplayMode {
    /// Resolution key, "{width} x {height}"
    pub resolution: String,
    /// Refresh rate label, e.g. "23.976" or "60.0"
    pub refresh_rate: String,
    /// Driver mode name, for display only
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_duration: i64,
    pub frame_timescale: i64,
    pub mode_id: ModeId,
}

impl DisplayMode {
    /// Whole frames per second, rounded up
    pub fn fps(&self) -> u32 {
        ((self.frame_timescale + self.frame_duration - 1) / self.frame_duration) as u32
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} Hz ({})",
            self.resolution, self.refresh_rate, self.name
        )
    }
}

impl fmt::Debug for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayMode")
            .field("name", &self.name)
            .field("resolution", &self.resolution)
            .field("refresh_rate", &self.refresh_rate)
            .field("frame_duration", &self.frame_duration)
            .field("frame_timescale", &self.frame_timescale)
            .field("mode_id", &self.mode_id)
            .finish()
    }
}

/// Format `timescale / duration` with 3 decimals, trimming trailing zeros
/// but keeping at least one digit after the point
pub fn format_refresh_rate(frame_timescale: i64, frame_duration: i64) -> String {
    let mut rate = format!("{:.3}", frame_timescale as f64 / frame_duration as f64);
    while rate.ends_with('0') && !rate.ends_with(".0") {
        rate.pop();
    }
    rate
}

/// Progressive display modes indexed by resolution and refresh rate
#[derive(Debug, Clone, Default)]
pub struct DisplayModeCatalog {
    modes: Vec<DisplayMode>,
    rates_by_resolution: HashMap<String, Vec<String>>,
    index: HashMap<(String, String), usize>,
}

impl DisplayModeCatalog {
    /// Build the catalog from the driver's mode list, in enumeration order
    ///
    /// When two modes share a (resolution, refresh rate) pair the first one
    /// enumerated is kept and the rate is listed once. Later duplicates are
    /// logged and ignored rather than replacing the earlier entry.
    pub fn from_native(native: &[NativeMode]) -> Self {
        let mut catalog = Self::default();

        for mode in native {
            if InterlaceFilter::is_interlaced(&mode.name) {
                debug!("Skipping interlaced mode {}", mode.name);
                continue;
            }
            if mode.frame_duration <= 0 || mode.frame_timescale <= 0 {
                warn!(
                    "Skipping mode {} with invalid timing {}/{}",
                    mode.name, mode.frame_timescale, mode.frame_duration
                );
                continue;
            }

            let resolution = format!("{} x {}", mode.width, mode.height);
            let refresh_rate = format_refresh_rate(mode.frame_timescale, mode.frame_duration);
            let key = (resolution.clone(), refresh_rate.clone());

            if catalog.index.contains_key(&key) {
                debug!(
                    "Mode {} duplicates {} @ {}, keeping the first",
                    mode.name, resolution, refresh_rate
                );
                continue;
            }

            catalog
                .rates_by_resolution
                .entry(resolution.clone())
                .or_default()
                .push(refresh_rate.clone());
            catalog.index.insert(key, catalog.modes.len());
            catalog.modes.push(DisplayMode {
                resolution,
                refresh_rate,
                name: mode.name.clone(),
                width: mode.width,
                height: mode.height,
                frame_duration: mode.frame_duration,
                frame_timescale: mode.frame_timescale,
                mode_id: mode.id,
            });
        }

        info!(
            "Display mode catalog: {} progressive modes across {} resolutions",
            catalog.modes.len(),
            catalog.rates_by_resolution.len()
        );
        catalog
    }

    /// All modes in device enumeration order
    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Resolution keys, sorted
    pub fn resolution_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rates_by_resolution.keys().cloned().collect();
        names.sort();
        names
    }

    /// Refresh rates offered at `resolution`, in enumeration order
    ///
    /// Returns `[NO_SUCH_RESOLUTION]` when the resolution is unknown.
    pub fn refresh_rates_for(&self, resolution: &str) -> Vec<String> {
        self.rates_by_resolution
            .get(resolution)
            .cloned()
            .unwrap_or_else(|| vec![NO_SUCH_RESOLUTION.to_string()])
    }

    /// Look up the mode for a (resolution, refresh rate) pair
    pub fn resolve(&self, resolution: &str, refresh_rate: &str) -> Result<&DisplayMode> {
        self.index
            .get(&(resolution.to_string(), refresh_rate.to_string()))
            .map(|&i| &self.modes[i])
            .ok_or_else(|| SdiError::DisplayModeNotFound {
                resolution: resolution.to_string(),
                refresh_rate: refresh_rate.to_string(),
            })
    }

    /// Pick a refresh rate for `resolution`: keep `current` if offered,
    /// otherwise "24.0", then "60.0", then the first available
    pub fn preferred_refresh_rate(&self, resolution: &str, current: &str) -> Option<String> {
        let rates = self.rates_by_resolution.get(resolution)?;
        std::iter::once(current)
            .chain(FALLBACK_REFRESH_RATES.iter().copied())
            .find(|wanted| rates.iter().any(|r| r == wanted))
            .map(str::to_string)
            .or_else(|| rates.first().cloned())
    }
}
