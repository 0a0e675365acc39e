//! Command-line interface for Tapedeck
//!
//! Handles argument parsing and logging configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

/// Tapedeck - desktop audio capture and playback utility
#[derive(Parser, Debug)]
#[command(name = "tapedeck")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List playback sinks, their monitor sources and microphones
    Devices {
        /// Print the raw device lists as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recordable application streams
    Streams {
        /// Print the stream snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a clip and save it as a WAV file
    Record {
        /// Capture from a source (mic or monitor) by name
        #[arg(long, conflicts_with = "stream")]
        device: Option<String>,

        /// Capture one application's stream by its server index
        #[arg(long)]
        stream: Option<u32>,

        /// Recording length in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,

        /// Output file; defaults to a timestamped name in the recordings
        /// directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replay the clip through the default sink before saving
        #[arg(long)]
        playback: bool,
    },
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set tapedeck modules to requested verbosity level
    builder.filter_module("tapedeck", args.log_level());

    builder.format_timestamp_millis().init();
}
