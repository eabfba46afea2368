//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// sdiout - SDI playout to a broadcast output card
///
/// Paces rendered video and streamed audio against the card's own clock
#[derive(Parser, Debug)]
#[command(name = "sdiout")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Settings file (default: sdiout.toml next to the executable, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the progressive display modes of the output card
    Modes,

    /// List the refresh rates offered at a resolution
    Rates {
        /// Resolution key, e.g. "1920 x 1080"
        resolution: String,
    },

    /// Drive the software card with a test pattern and a tone
    Run {
        /// Override the resolution from the settings file
        #[arg(short, long)]
        resolution: Option<String>,

        /// Override the refresh rate from the settings file
        #[arg(long)]
        rate: Option<String>,

        /// Override the pixel format from the settings file
        #[arg(short, long)]
        format: Option<String>,

        /// Stop after this many seconds (default: run until Ctrl+C)
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Tone frequency in Hz
        #[arg(long, default_value = "1000")]
        tone: f32,
    },

    /// Print a sample settings file, or write it to a path
    Config {
        /// Write the sample to this path instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Run {
            resolution: None,
            rate: None,
            format: None,
            seconds: None,
            tone: 1000.0,
        }
    }
}
