//! WAV file sink built on hound.
//!
//! The engine records raw 16-bit stereo little-endian PCM at 44.1 kHz; this
//! module owns the on-disk representation, including the WAV header, the
//! default recordings directory and unique filename generation.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};

use crate::error::Result;

/// Sample rate of every recorded clip.
pub const SAMPLE_RATE: u32 = 44_100;
/// Channel count of every recorded clip.
pub const CHANNELS: u16 = 2;
/// Bytes per interleaved stereo frame.
pub const FRAME_BYTES: usize = 4;

/// Streaming writer for one clip's PCM bytes.
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
}

impl WavSink {
    /// Creates the destination file and writes the WAV header for the
    /// engine's fixed sample format.
    pub fn create(path: &Path) -> Result<Self> {
        let spec = WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Ok(Self {
            writer: WavWriter::create(path, spec)?,
        })
    }

    /// Appends one block of raw little-endian 16-bit PCM bytes.
    ///
    /// Blocks are sample aligned except possibly the final partial one; a
    /// trailing odd byte cannot form a sample and is dropped.
    pub fn write_block(&mut self, bytes: &[u8]) -> Result<()> {
        for pair in bytes.chunks_exact(2) {
            self.writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }

    /// Flushes and finalizes the header. Reports failure rather than
    /// leaving a silently truncated length field.
    pub fn finish(self) -> Result<()> {
        self.writer.finalize()?;
        Ok(())
    }
}

/// Default directory recordings are saved into.
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tapedeck")
        .join("recordings")
}

/// Generates a unique timestamped filename inside `dir`.
pub fn generate_filename(dir: &Path) -> PathBuf {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let unique = uuid::Uuid::new_v4().to_string()[..8].to_string();
    dir.join(format!("clip_{}_{}.wav", timestamp, unique))
}

/// Creates the recordings directory if needed and returns the final output
/// path, generating a filename when the caller gave none.
pub fn resolve_output(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p),
        None => {
            let dir = default_recordings_dir();
            std::fs::create_dir_all(&dir)?;
            Ok(generate_filename(&dir))
        }
    }
}

/// Duration in seconds of a raw PCM byte count in the engine's format.
pub fn duration_seconds(nbytes: usize) -> f64 {
    nbytes as f64 / (SAMPLE_RATE as f64 * FRAME_BYTES as f64)
}
