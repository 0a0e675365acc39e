//! Error types shared across the crate.

use crate::streams::UpdateKind;

/// Result alias carrying the crate-wide [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the session engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was invoked in a state that does not allow it. This is
    /// a caller bug, not an environmental failure.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    /// Clip lookup miss.
    #[error("no clip with id {0}")]
    ClipNotFound(u64),

    /// Device or stream lookup miss.
    #[error("no such device or stream: {0}")]
    DeviceNotFound(String),

    /// A sink did not resolve to exactly one monitor source, so the device
    /// listing from the server cannot be trusted.
    #[error("sink {sink:?} resolved to {count} monitor sources")]
    MonitorPairing { sink: String, count: usize },

    /// Enumeration reported a stream whose frozen classification from the
    /// previous update cycle says it cannot exist in that shape.
    #[error("stream {index} enumerated while classified {kind:?} by the previous cycle")]
    StreamDesync { index: u32, kind: UpdateKind },

    /// The block cursor was advanced past the last allocated block.
    #[error("block cursor advanced past the last block")]
    OutOfRange,

    /// Connection or stream failure reported by the audio server.
    #[error("audio server: {0}")]
    Server(String),

    /// Wrapper around standard IO errors from the file sink.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// WAV encoding or write failure from the file sink.
    #[error(transparent)]
    Wav(#[from] hound::Error),
}
