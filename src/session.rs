//! Record/playback session state machine.
//!
//! The controller owns the clip registry and drives exactly one clip at a
//! time from the server's stream callbacks. All transfer work happens in
//! [`on_capture_data`](SessionController::on_capture_data) and
//! [`on_playback_ready`](SessionController::on_playback_ready); the
//! PipeWire glue only moves bytes between those handlers and the stream
//! buffers.

use std::path::Path;

use log::{debug, info, warn};

use crate::clip::{ClipRegistry, Fill};
use crate::device::{Device, DeviceCatalog};
use crate::error::{Error, Result};
use crate::streams::StreamEntry;
use crate::wav::WavSink;

/// What a recording session captures from.
#[derive(Debug, Clone)]
pub enum Recordable {
    /// A sink monitor or microphone, captured directly.
    Device(Device),
    /// Another application's playback stream, captured through the monitor
    /// of the sink it plays into.
    Stream(StreamEntry),
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Recording,
    PlayingBack,
}

/// Everything the stream glue needs to open a capture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    /// Id of the freshly created clip.
    pub clip: u64,
    /// Generation tag the stream callbacks must present.
    pub generation: u64,
    /// Name of the source node to capture from.
    pub device: String,
    /// Set when capturing a single application stream rather than a whole
    /// device.
    pub stream: Option<u32>,
}

/// Everything the stream glue needs to open a playback stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSpec {
    pub clip: u64,
    pub generation: u64,
}

/// Callback fired with the byte count of each recorded fragment.
pub type PcmProgressCallback = Box<dyn FnMut(usize)>;

struct ActiveSession {
    clip: u64,
    generation: u64,
}

/// State machine exposing start/stop recording and playback.
pub struct SessionController {
    clips: ClipRegistry,
    state: SessionState,
    active: Option<ActiveSession>,
    generation: u64,
    pcm_cb: Option<PcmProgressCallback>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            clips: ClipRegistry::new(),
            state: SessionState::Idle,
            active: None,
            generation: 0,
            pcm_cb: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id of the clip attached to the active session, if any.
    pub fn active_clip(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.clip)
    }

    /// Registers the callback fired per recorded fragment.
    pub fn set_pcm_progress_callback(&mut self, cb: impl FnMut(usize) + 'static) {
        self.pcm_cb = Some(Box::new(cb));
    }

    /// Starts recording from the given target.
    ///
    /// Allocates a fresh clip, resolves the capture device (a stream target
    /// resolves to the monitor of its owning sink) and enters `Recording`.
    /// The returned spec carries everything the glue needs to open the
    /// server-side stream.
    pub fn start_recording(
        &mut self,
        target: &Recordable,
        catalog: &DeviceCatalog,
    ) -> Result<CaptureSpec> {
        if self.state != SessionState::Idle {
            return Err(Error::Precondition("start_recording while not idle"));
        }

        let (device, stream) = match target {
            Recordable::Device(dev) => (dev.name.clone(), None),
            Recordable::Stream(entry) => {
                let monitor = catalog.monitor_for(entry.sink).ok_or(Error::MonitorPairing {
                    sink: format!("sink index {}", entry.sink),
                    count: 0,
                })?;
                (monitor.name.clone(), Some(entry.index))
            }
        };

        let clip = self.clips.create();
        self.generation += 1;
        self.active = Some(ActiveSession {
            clip,
            generation: self.generation,
        });
        self.state = SessionState::Recording;
        info!("recording clip {clip} from {device}");

        Ok(CaptureSpec {
            clip,
            generation: self.generation,
            device,
            stream,
        })
    }

    /// Appends one captured fragment to the active clip.
    ///
    /// Fragments tagged with a stale generation belong to a stream that was
    /// already stopped and are dropped without effect.
    pub fn on_capture_data(&mut self, generation: u64, chunk: &[u8]) -> Result<()> {
        if self.state != SessionState::Recording {
            return Ok(());
        }
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        if active.generation != generation {
            debug!("dropping capture fragment from stale generation {generation}");
            return Ok(());
        }
        let clip = self.clips.get_mut(active.clip)?;
        clip.append(chunk)?;
        if let Some(cb) = self.pcm_cb.as_mut() {
            cb(chunk.len());
        }
        Ok(())
    }

    /// Stops the active recording session.
    pub fn stop_recording(&mut self) -> Result<u64> {
        if self.state != SessionState::Recording {
            return Err(Error::Precondition("stop_recording while not recording"));
        }
        let active = self.active.take().expect("recording session without clip");
        self.state = SessionState::Idle;
        self.generation += 1;
        let bytes = self.clips.get(active.clip)?.rec_size();
        info!("recorded clip {}: {bytes} bytes", active.clip);
        Ok(active.clip)
    }

    /// Starts playing back a recorded clip from its beginning.
    pub fn start_playback(&mut self, id: u64) -> Result<PlaybackSpec> {
        if self.state != SessionState::Idle {
            return Err(Error::Precondition("start_playback while not idle"));
        }
        let clip = self.clips.get_mut(id)?;
        clip.rewind();
        self.generation += 1;
        self.active = Some(ActiveSession {
            clip: id,
            generation: self.generation,
        });
        self.state = SessionState::PlayingBack;
        info!("playing back clip {id}");
        Ok(PlaybackSpec {
            clip: id,
            generation: self.generation,
        })
    }

    /// Fills a playback buffer from the active clip.
    ///
    /// Once the last recorded byte has been handed out the session returns
    /// to `Idle` before this call returns; the glue sees `finished` and
    /// tears the stream down. Stale-generation callbacks get an empty,
    /// finished fill.
    pub fn on_playback_ready(&mut self, generation: u64, out: &mut [u8]) -> Result<Fill> {
        let stale = Fill {
            written: 0,
            finished: true,
        };
        if self.state != SessionState::PlayingBack {
            return Ok(stale);
        }
        let Some(active) = self.active.as_ref() else {
            return Ok(stale);
        };
        if active.generation != generation {
            debug!("dropping playback request from stale generation {generation}");
            return Ok(stale);
        }
        let clip = self.clips.get_mut(active.clip)?;
        let fill = clip.pull(out)?;
        if fill.finished {
            self.stop_playback()?;
        }
        Ok(fill)
    }

    /// Stops the active playback session.
    pub fn stop_playback(&mut self) -> Result<()> {
        if self.state != SessionState::PlayingBack {
            return Err(Error::Precondition("stop_playback while not playing"));
        }
        self.active = None;
        self.state = SessionState::Idle;
        self.generation += 1;
        Ok(())
    }

    /// Playback progress as a fraction of the recorded length. `None`
    /// outside a playback session.
    pub fn progress(&self) -> Option<f64> {
        if self.state != SessionState::PlayingBack {
            return None;
        }
        let clip = self.clips.get(self.active.as_ref()?.clip).ok()?;
        if clip.rec_size() == 0 {
            return Some(0.0);
        }
        Some(clip.played_size() as f64 / clip.rec_size() as f64)
    }

    /// The audio server dropped the connection or the stream failed.
    /// Terminal for the active session; the engine reverts to idle and the
    /// failure is reported to the caller for user notification.
    pub fn on_server_failure(&mut self, reason: &str) -> Error {
        warn!("audio server failure: {reason}");
        self.active = None;
        self.state = SessionState::Idle;
        self.generation += 1;
        Error::Server(reason.to_string())
    }

    /// Deletes a recorded clip and releases its blocks.
    ///
    /// Refused while the clip is attached to an active session; nothing is
    /// freed in that case.
    pub fn delete_clip(&mut self, id: u64) -> Result<()> {
        if self.active_clip() == Some(id) {
            return Err(Error::Precondition("delete_clip on the active clip"));
        }
        self.clips.remove(id)?;
        info!("deleted clip {id}");
        Ok(())
    }

    /// Streams a clip's blocks, in order and up to the recorded length,
    /// into a WAV file at `path`. Failures from the file sink are reported
    /// to the caller, not retried; a partial file may remain.
    pub fn save_clip(&self, id: u64, path: &Path) -> Result<()> {
        let clip = self.clips.get(id)?;
        let mut sink = WavSink::create(path)?;
        for fragment in clip.fragments(0, clip.rec_size()) {
            sink.write_block(fragment)?;
        }
        sink.finish()?;
        info!(
            "saved clip {id} ({} bytes) to {}",
            clip.rec_size(),
            path.display()
        );
        Ok(())
    }

    /// Random-access fragment read over a clip's byte range, used for
    /// waveform rendering.
    pub fn clip_fragments(&self, id: u64, start: usize, nbytes: usize) -> Result<Vec<&[u8]>> {
        Ok(self.clips.get(id)?.fragments(start, nbytes))
    }

    /// Recorded length of a clip in bytes.
    pub fn clip_size(&self, id: u64) -> Result<usize> {
        Ok(self.clips.get(id)?.rec_size())
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::StreamEntry;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn paired_catalog() -> DeviceCatalog {
        let mut cat = DeviceCatalog::new();
        cat.begin_refresh();
        cat.add_sink(Device::new("speakers", 0));
        cat.add_source(Device::new("speakers.monitor", 10));
        cat.add_source(Device::new("builtin-mic", 11));
        cat.finish_sinks().unwrap();
        cat.finish_sources().unwrap();
        cat
    }

    fn mic_target(cat: &DeviceCatalog) -> Recordable {
        Recordable::Device(cat.mics()[0].clone())
    }

    /// Records the given chunks through the capture handler.
    fn record(ctrl: &mut SessionController, cat: &DeviceCatalog, chunks: &[&[u8]]) -> u64 {
        let spec = ctrl.start_recording(&mic_target(cat), cat).unwrap();
        for chunk in chunks {
            ctrl.on_capture_data(spec.generation, chunk).unwrap();
        }
        ctrl.stop_recording().unwrap()
    }

    #[test]
    fn recording_lifecycle() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        assert_eq!(ctrl.state(), SessionState::Idle);

        let spec = ctrl.start_recording(&mic_target(&cat), &cat).unwrap();
        assert_eq!(ctrl.state(), SessionState::Recording);
        assert_eq!(spec.device, "builtin-mic");
        assert_eq!(spec.stream, None);
        assert_eq!(ctrl.active_clip(), Some(spec.clip));

        ctrl.on_capture_data(spec.generation, &[1, 2, 3, 4]).unwrap();
        let id = ctrl.stop_recording().unwrap();
        assert_eq!(id, spec.clip);
        assert_eq!(ctrl.state(), SessionState::Idle);
        assert_eq!(ctrl.clip_size(id).unwrap(), 4);
    }

    #[test]
    fn stream_target_resolves_owning_sinks_monitor() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let entry = StreamEntry::new(42, 0).with_prop("application.name", "player");
        let spec = ctrl
            .start_recording(&Recordable::Stream(entry), &cat)
            .unwrap();
        assert_eq!(spec.device, "speakers.monitor");
        assert_eq!(spec.stream, Some(42));
    }

    #[test]
    fn stream_target_with_unknown_sink_fails() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let entry = StreamEntry::new(42, 99);
        assert!(matches!(
            ctrl.start_recording(&Recordable::Stream(entry), &cat),
            Err(Error::MonitorPairing { count: 0, .. })
        ));
        // A failed resolution must not leave the controller recording.
        assert_eq!(ctrl.state(), SessionState::Idle);
    }

    #[test]
    fn double_start_is_a_precondition_violation() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        ctrl.start_recording(&mic_target(&cat), &cat).unwrap();
        assert!(matches!(
            ctrl.start_recording(&mic_target(&cat), &cat),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            ctrl.start_playback(0),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            ctrl.stop_playback(),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn stop_without_session_is_a_precondition_violation() {
        let mut ctrl = SessionController::new();
        assert!(matches!(
            ctrl.stop_recording(),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(ctrl.stop_playback(), Err(Error::Precondition(_))));
    }

    #[test]
    fn stale_generation_capture_data_is_dropped() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let first = ctrl.start_recording(&mic_target(&cat), &cat).unwrap();
        ctrl.stop_recording().unwrap();

        let second = ctrl.start_recording(&mic_target(&cat), &cat).unwrap();
        // A fragment from the torn-down first stream arrives late.
        ctrl.on_capture_data(first.generation, &[9; 16]).unwrap();
        assert_eq!(ctrl.clip_size(second.clip).unwrap(), 0);

        ctrl.on_capture_data(second.generation, &[1; 16]).unwrap();
        assert_eq!(ctrl.clip_size(second.clip).unwrap(), 16);
    }

    #[test]
    fn pcm_progress_callback_sees_each_fragment() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let total = Rc::new(RefCell::new(0usize));
        let sink = total.clone();
        ctrl.set_pcm_progress_callback(move |n| *sink.borrow_mut() += n);

        record(&mut ctrl, &cat, &[&[0; 100], &[0; 50]]);
        assert_eq!(*total.borrow(), 150);
    }

    #[test]
    fn playback_delivers_exactly_the_recorded_bytes() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let id = record(&mut ctrl, &cat, &data.chunks(7777).collect::<Vec<_>>());

        let spec = ctrl.start_playback(id).unwrap();
        assert_eq!(ctrl.state(), SessionState::PlayingBack);

        let mut played = Vec::new();
        let mut last_progress = 0.0;
        let mut buf = [0u8; 4096];
        loop {
            let fill = ctrl.on_playback_ready(spec.generation, &mut buf).unwrap();
            played.extend_from_slice(&buf[..fill.written]);
            if fill.finished {
                break;
            }
            let progress = ctrl.progress().unwrap();
            assert!(progress >= last_progress);
            last_progress = progress;
        }

        assert_eq!(played, data);
        // Termination happened inside the handler, before it returned.
        assert_eq!(ctrl.state(), SessionState::Idle);
        assert_eq!(ctrl.progress(), None);
    }

    #[test]
    fn playback_of_unknown_clip_fails() {
        let mut ctrl = SessionController::new();
        assert!(matches!(
            ctrl.start_playback(123),
            Err(Error::ClipNotFound(123))
        ));
    }

    #[test]
    fn stale_generation_playback_request_is_finished_and_empty() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let id = record(&mut ctrl, &cat, &[&[1; 64]]);

        let first = ctrl.start_playback(id).unwrap();
        ctrl.stop_playback().unwrap();
        let second = ctrl.start_playback(id).unwrap();

        let mut buf = [0u8; 32];
        let fill = ctrl.on_playback_ready(first.generation, &mut buf).unwrap();
        assert_eq!(fill.written, 0);
        assert!(fill.finished);
        // The live session is untouched.
        assert_eq!(ctrl.state(), SessionState::PlayingBack);

        let fill = ctrl.on_playback_ready(second.generation, &mut buf).unwrap();
        assert_eq!(fill.written, 32);
    }

    #[test]
    fn deleting_the_active_clip_is_refused() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let spec = ctrl.start_recording(&mic_target(&cat), &cat).unwrap();
        ctrl.on_capture_data(spec.generation, &[1; 8]).unwrap();

        assert!(matches!(
            ctrl.delete_clip(spec.clip),
            Err(Error::Precondition(_))
        ));
        // Refusal must not free anything.
        assert_eq!(ctrl.clip_size(spec.clip).unwrap(), 8);

        ctrl.stop_recording().unwrap();
        ctrl.delete_clip(spec.clip).unwrap();
        assert!(matches!(
            ctrl.clip_size(spec.clip),
            Err(Error::ClipNotFound(_))
        ));
    }

    #[test]
    fn server_failure_reverts_to_idle() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let spec = ctrl.start_recording(&mic_target(&cat), &cat).unwrap();

        let err = ctrl.on_server_failure("connection terminated");
        assert!(matches!(err, Error::Server(_)));
        assert_eq!(ctrl.state(), SessionState::Idle);

        // Whatever the dead stream still delivers is ignored.
        ctrl.on_capture_data(spec.generation, &[1; 8]).unwrap();
        assert_eq!(ctrl.clip_size(spec.clip).unwrap(), 0);
    }

    #[test]
    fn fragments_are_readable_while_idle_and_while_recording() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        let spec = ctrl.start_recording(&mic_target(&cat), &cat).unwrap();
        ctrl.on_capture_data(spec.generation, &[7; 1000]).unwrap();

        let frags = ctrl.clip_fragments(spec.clip, 0, 1000).unwrap();
        assert_eq!(frags.iter().map(|f| f.len()).sum::<usize>(), 1000);

        ctrl.stop_recording().unwrap();
        let frags = ctrl.clip_fragments(spec.clip, 500, 10_000).unwrap();
        assert_eq!(frags.iter().map(|f| f.len()).sum::<usize>(), 500);
    }

    #[test]
    fn save_clip_round_trips_through_the_wav_sink() {
        let cat = paired_catalog();
        let mut ctrl = SessionController::new();
        // Interleaved 16-bit stereo samples, little endian.
        let samples: Vec<i16> = (0..2000).map(|i| (i * 13 % 1000) as i16 - 500).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let id = record(&mut ctrl, &cat, &bytes.chunks(999).collect::<Vec<_>>());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        ctrl.save_clip(id, &path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.bits_per_sample, 16);
        let read: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn save_unknown_clip_fails() {
        let ctrl = SessionController::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ctrl.save_clip(5, &dir.path().join("x.wav")),
            Err(Error::ClipNotFound(5))
        ));
    }
}
