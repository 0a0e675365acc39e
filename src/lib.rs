//! Tapedeck - a Linux desktop audio capture and playback engine
//!
//! The engine records PCM audio from microphones, sink monitors or single
//! application streams into growable chunked clips, plays clips back, and
//! saves them as WAV files. It tracks the live set of recordable
//! application streams through a debounced diff protocol and pairs every
//! playback sink with its monitor source.
//!
//! All engine state is single-threaded and driven from one PipeWire main
//! loop; see [`server`] for the glue and [`session`] for the state machine
//! at the center.

pub mod clip;
pub mod device;
pub mod error;
pub mod server;
pub mod session;
pub mod streams;
pub mod wav;

pub use error::{Error, Result};
