//! Debounced tracking of recordable application streams.
//!
//! Stream lifecycle notifications and the response to an enumeration
//! request are not ordered relative to each other, so the engine runs a
//! two-phase protocol: notifications accumulate in a pending map behind a
//! 100 ms debounce, and when a cycle starts the pending map is frozen for
//! the duration of the enumeration pass. The frozen classification is what
//! lets the engine tell a genuinely new stream apart from one whose
//! creation notice is still in flight.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::time::Duration;

use log::{debug, trace};
use serde::Serialize;

use crate::error::{Error, Result};

/// Delay between the first queued notification and the update cycle it
/// triggers.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Classification of a stream within one update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateKind {
    NoChange,
    New,
    Changed,
    Removed,
}

/// One application's playback stream, capturable independently of the sink
/// it plays into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEntry {
    /// Server-assigned stream index.
    pub index: u32,
    /// Index of the sink the stream plays into.
    pub sink: u32,
    /// Free-form properties published with the stream (application name,
    /// media title and the like).
    pub props: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn new(index: u32, sink: u32) -> Self {
        Self {
            index,
            sink,
            props: BTreeMap::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: &str) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }

    /// Human-facing label, preferring the application name property.
    pub fn label(&self) -> &str {
        self.props
            .get("application.name")
            .or_else(|| self.props.get("media.name"))
            .map(String::as_str)
            .unwrap_or("unknown stream")
    }
}

/// Callback fired at the end of each enumeration pass with the live list
/// and the cycle's frozen classification map.
pub type StreamsCallback = Box<dyn FnMut(&[StreamEntry], &HashMap<u32, UpdateKind>)>;

/// Maintains the authoritative set of recordable streams.
pub struct StreamDiffEngine {
    streams: Vec<StreamEntry>,
    pending: HashMap<u32, UpdateKind>,
    frozen: HashMap<u32, UpdateKind>,
    cycle_pending: bool,
    update_cb: Option<StreamsCallback>,
}

impl Default for StreamDiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDiffEngine {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            pending: HashMap::new(),
            frozen: HashMap::new(),
            cycle_pending: false,
            update_cb: None,
        }
    }

    /// Registers the callback invoked after every enumeration pass.
    pub fn set_update_callback(
        &mut self,
        cb: impl FnMut(&[StreamEntry], &HashMap<u32, UpdateKind>) + 'static,
    ) {
        self.update_cb = Some(Box::new(cb));
    }

    /// Merges an asynchronous lifecycle notification into the pending map.
    ///
    /// Later notifications for the same index overwrite earlier ones within
    /// a cycle. Returns true when the caller must arm the debounce timer;
    /// while a cycle is already pending the event just accumulates.
    pub fn queue_update(&mut self, index: u32, kind: UpdateKind) -> bool {
        trace!("stream {index}: queued {kind:?}");
        self.pending.insert(index, kind);
        if self.cycle_pending {
            false
        } else {
            self.cycle_pending = true;
            true
        }
    }

    /// Marks a cycle as pending without any queued notification. Used for
    /// the initial enumeration at connection time.
    pub fn begin_enumeration(&mut self) {
        self.cycle_pending = true;
    }

    /// Starts an update cycle on debounce expiry.
    ///
    /// Streams marked `Removed` or `Changed` are evicted from the live
    /// list; a changed stream is dropped so the enumeration pass re-adds it
    /// with fresh properties instead of patching it in place. The pending
    /// map becomes this cycle's frozen snapshot.
    pub fn begin_cycle(&mut self) {
        let pending = &self.pending;
        self.streams.retain(|s| {
            !matches!(
                pending.get(&s.index),
                Some(UpdateKind::Removed | UpdateKind::Changed)
            )
        });
        self.frozen = mem::take(&mut self.pending);
        self.cycle_pending = true;
        debug!(
            "update cycle: {} live streams, {} frozen updates",
            self.streams.len(),
            self.frozen.len()
        );
    }

    /// Feeds one enumerated stream into the current cycle.
    ///
    /// Insertion is gated by the frozen classification so that late
    /// notifications for already-added or already-dropped streams are told
    /// apart from genuine mid-enumeration changes. A contradiction between
    /// the enumeration and the frozen map is a server fault and fails
    /// loudly.
    pub fn offer(&mut self, entry: StreamEntry) -> Result<()> {
        let index = entry.index;
        let live = self.streams.iter().position(|s| s.index == index);
        let frozen = self.frozen.get(&index).copied();

        match (live, frozen) {
            // Genuinely new mid-enumeration; its creation notice has not
            // been debounced yet.
            (None, None) => {
                self.frozen.insert(index, UpdateKind::New);
                self.streams.push(entry);
            }
            // Debounced creation confirmed by the enumeration.
            (None, Some(UpdateKind::New)) => {
                self.streams.push(entry);
            }
            // Evicted at cycle start for refresh; re-add with the fresh
            // properties and keep the Changed classification.
            (None, Some(UpdateKind::Changed)) => {
                self.streams.push(entry);
            }
            (None, Some(kind @ (UpdateKind::Removed | UpdateKind::NoChange))) => {
                return Err(Error::StreamDesync { index, kind });
            }
            // Known stream with no pending notice.
            (Some(_), None) => {
                self.frozen.insert(index, UpdateKind::NoChange);
            }
            // Late creation notice for a stream already picked up, or a
            // duplicate entry within this pass.
            (Some(_), Some(UpdateKind::New | UpdateKind::NoChange)) => {}
            (Some(_), Some(kind @ (UpdateKind::Changed | UpdateKind::Removed))) => {
                return Err(Error::StreamDesync { index, kind });
            }
        }
        Ok(())
    }

    /// Ends the enumeration pass: fires the snapshot callback, clears the
    /// cycle-pending flag, and reports whether notifications arrived while
    /// the cycle ran (the caller should then schedule another debounce so
    /// they are not lost).
    pub fn finish_enumeration(&mut self) -> bool {
        if let Some(cb) = self.update_cb.as_mut() {
            cb(&self.streams, &self.frozen);
        }
        self.cycle_pending = false;
        !self.pending.is_empty()
    }

    /// True while a debounce or enumeration cycle is in flight.
    pub fn cycle_pending(&self) -> bool {
        self.cycle_pending
    }

    pub fn streams(&self) -> &[StreamEntry] {
        &self.streams
    }

    pub fn find(&self, index: u32) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| s.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Runs one full cycle: debounce, replay the given server state, finish.
    fn run_cycle(engine: &mut StreamDiffEngine, server: &[StreamEntry]) -> bool {
        engine.begin_cycle();
        for entry in server {
            engine.offer(entry.clone()).unwrap();
        }
        engine.finish_enumeration()
    }

    #[test]
    fn initial_enumeration_classifies_everything_new() {
        let mut engine = StreamDiffEngine::new();
        let snapshots = Rc::new(RefCell::new(Vec::new()));
        let sink = snapshots.clone();
        engine.set_update_callback(move |streams, updates| {
            sink.borrow_mut().push((streams.to_vec(), updates.clone()));
        });

        engine.begin_enumeration();
        engine.offer(StreamEntry::new(3, 0)).unwrap();
        engine.offer(StreamEntry::new(7, 0)).unwrap();
        engine.finish_enumeration();

        let snaps = snapshots.borrow();
        assert_eq!(snaps.len(), 1);
        let (streams, updates) = &snaps[0];
        assert_eq!(streams.len(), 2);
        assert_eq!(updates[&3], UpdateKind::New);
        assert_eq!(updates[&7], UpdateKind::New);
        assert!(!engine.cycle_pending());
    }

    #[test]
    fn first_event_arms_the_timer_and_later_ones_coalesce() {
        let mut engine = StreamDiffEngine::new();
        assert!(engine.queue_update(7, UpdateKind::New));
        assert!(!engine.queue_update(7, UpdateKind::Changed));
        assert!(!engine.queue_update(9, UpdateKind::New));
        assert!(engine.cycle_pending());
    }

    #[test]
    fn new_then_changed_same_cycle_yields_one_changed_entry() {
        let mut engine = StreamDiffEngine::new();
        let snapshots = Rc::new(RefCell::new(Vec::new()));
        let sink = snapshots.clone();
        engine.set_update_callback(move |streams, updates| {
            sink.borrow_mut().push((streams.to_vec(), updates.clone()));
        });

        engine.queue_update(7, UpdateKind::New);
        engine.queue_update(7, UpdateKind::Changed);
        let fresh = StreamEntry::new(7, 2).with_prop("application.name", "player");
        run_cycle(&mut engine, &[fresh.clone()]);

        let snaps = snapshots.borrow();
        let (streams, updates) = &snaps[0];
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0], fresh);
        assert_eq!(updates[&7], UpdateKind::Changed);
    }

    #[test]
    fn changed_stream_is_reinserted_with_fresh_properties() {
        let mut engine = StreamDiffEngine::new();
        let stale = StreamEntry::new(7, 2).with_prop("media.name", "track one");
        engine.queue_update(7, UpdateKind::New);
        run_cycle(&mut engine, &[stale]);

        engine.queue_update(7, UpdateKind::Changed);
        let fresh = StreamEntry::new(7, 2).with_prop("media.name", "track two");
        run_cycle(&mut engine, &[fresh.clone()]);

        assert_eq!(engine.streams(), &[fresh]);
    }

    #[test]
    fn removed_stream_disappears_from_the_live_list() {
        let mut engine = StreamDiffEngine::new();
        engine.queue_update(7, UpdateKind::New);
        engine.queue_update(9, UpdateKind::New);
        run_cycle(
            &mut engine,
            &[StreamEntry::new(7, 0), StreamEntry::new(9, 0)],
        );
        assert_eq!(engine.streams().len(), 2);

        engine.queue_update(7, UpdateKind::Removed);
        run_cycle(&mut engine, &[StreamEntry::new(9, 0)]);
        assert_eq!(engine.streams().len(), 1);
        assert!(engine.find(7).is_none());
        assert!(engine.find(9).is_some());
    }

    #[test]
    fn removed_stream_still_enumerated_fails_loudly() {
        let mut engine = StreamDiffEngine::new();
        engine.queue_update(7, UpdateKind::New);
        run_cycle(&mut engine, &[StreamEntry::new(7, 0)]);

        engine.queue_update(7, UpdateKind::Removed);
        engine.begin_cycle();
        let err = engine.offer(StreamEntry::new(7, 0)).unwrap_err();
        assert!(matches!(
            err,
            Error::StreamDesync {
                index: 7,
                kind: UpdateKind::Removed
            }
        ));
    }

    #[test]
    fn unannounced_stream_discovered_mid_enumeration_is_new() {
        let mut engine = StreamDiffEngine::new();
        engine.queue_update(3, UpdateKind::New);
        engine.begin_cycle();
        // Index 5 shows up in the enumeration before its creation notice
        // has been debounced.
        engine.offer(StreamEntry::new(3, 0)).unwrap();
        engine.offer(StreamEntry::new(5, 0)).unwrap();
        engine.finish_enumeration();
        assert_eq!(engine.streams().len(), 2);

        // The late notice for 5 arrives afterwards and must not disturb the
        // already-live entry.
        engine.queue_update(5, UpdateKind::New);
        run_cycle(
            &mut engine,
            &[StreamEntry::new(3, 0), StreamEntry::new(5, 0)],
        );
        assert_eq!(engine.streams().len(), 2);
    }

    #[test]
    fn steady_state_reports_no_change() {
        let mut engine = StreamDiffEngine::new();
        let snapshots = Rc::new(RefCell::new(Vec::new()));
        let sink = snapshots.clone();
        engine.set_update_callback(move |_, updates| {
            sink.borrow_mut().push(updates.clone());
        });

        engine.queue_update(7, UpdateKind::New);
        run_cycle(&mut engine, &[StreamEntry::new(7, 0)]);

        engine.queue_update(9, UpdateKind::New);
        run_cycle(
            &mut engine,
            &[StreamEntry::new(7, 0), StreamEntry::new(9, 0)],
        );

        let snaps = snapshots.borrow();
        assert_eq!(snaps[1][&7], UpdateKind::NoChange);
        assert_eq!(snaps[1][&9], UpdateKind::New);
    }

    #[test]
    fn mid_cycle_events_defer_and_request_another_round() {
        let mut engine = StreamDiffEngine::new();
        engine.queue_update(7, UpdateKind::New);
        engine.begin_cycle();
        // Arrives while the enumeration is in flight; must not arm a timer
        // of its own, and must survive into the next cycle.
        assert!(!engine.queue_update(9, UpdateKind::New));
        engine.offer(StreamEntry::new(7, 0)).unwrap();
        let more = engine.finish_enumeration();
        assert!(more);

        engine.begin_cycle();
        engine.offer(StreamEntry::new(7, 0)).unwrap();
        engine.offer(StreamEntry::new(9, 0)).unwrap();
        assert!(!engine.finish_enumeration());
        assert_eq!(engine.streams().len(), 2);
    }
}
