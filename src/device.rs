//! Sink/source discovery and monitor pairing.
//!
//! The server publishes playback sinks and capture sources as flat lists.
//! Each sink has a monitor source mirroring its output (the "what you hear"
//! capture path); everything else is a microphone or another plain capture
//! device. The catalog collects both enumerations, which complete in either
//! order, and derives the sink-to-monitor mapping once both are in.

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use serde::Serialize;

use crate::error::{Error, Result};

/// Name suffix the server gives a sink's monitor source.
const MONITOR_SUFFIX: &str = ".monitor";

/// A playback or capture endpoint published by the audio server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub index: u32,
}

impl Device {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// Callback fired with the derived monitor and microphone lists.
pub type PairingCallback = Box<dyn FnMut(&[Device], &[Device])>;

/// Collects sink and source enumerations and derives monitor pairing.
#[derive(Default)]
pub struct DeviceCatalog {
    sinks: Vec<Device>,
    sources: Vec<Device>,
    monitors: Vec<Device>,
    mics: Vec<Device>,
    monitor_map: HashMap<u32, Device>,
    got_sinks: bool,
    got_sources: bool,
    pairing_cb: Option<PairingCallback>,
}

/// Name the server publishes for a sink's monitor source.
pub fn monitor_source_name(sink: &str) -> String {
    format!("{sink}{MONITOR_SUFFIX}")
}

/// The sink name a monitor source's name was derived from, if it is one.
pub fn sink_of_monitor(source: &str) -> Option<&str> {
    source.strip_suffix(MONITOR_SUFFIX)
}

/// True when `source` is the monitor of `sink`.
///
/// The server derives monitor names by appending a fixed suffix to the sink
/// name, so the match requires the full suffix rather than a bare name
/// prefix. A sink named "usb" must not claim a source named "usb2".
fn is_monitor_of(source: &str, sink: &str) -> bool {
    source
        .strip_prefix(sink)
        .is_some_and(|rest| rest == MONITOR_SUFFIX)
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the callback invoked after each successful pairing pass.
    pub fn set_pairing_callback(&mut self, cb: impl FnMut(&[Device], &[Device]) + 'static) {
        self.pairing_cb = Some(Box::new(cb));
    }

    /// Drops all prior device state ahead of a fresh enumeration round.
    pub fn begin_refresh(&mut self) {
        self.sinks.clear();
        self.sources.clear();
        self.monitors.clear();
        self.mics.clear();
        self.monitor_map.clear();
        self.got_sinks = false;
        self.got_sources = false;
    }

    pub fn add_sink(&mut self, dev: Device) {
        debug!("sink {}: {}", dev.index, dev.name);
        self.sinks.push(dev);
    }

    pub fn add_source(&mut self, dev: Device) {
        debug!("source {}: {}", dev.index, dev.name);
        self.sources.push(dev);
    }

    /// End-of-list marker for the sink enumeration. Pairing runs once the
    /// source enumeration has also finished.
    pub fn finish_sinks(&mut self) -> Result<()> {
        self.got_sinks = true;
        if self.got_sources {
            self.pair()?;
        }
        Ok(())
    }

    /// End-of-list marker for the source enumeration.
    pub fn finish_sources(&mut self) -> Result<()> {
        self.got_sources = true;
        if self.got_sinks {
            self.pair()?;
        }
        Ok(())
    }

    fn pair(&mut self) -> Result<()> {
        self.monitors.clear();
        self.mics.clear();
        self.monitor_map.clear();

        let mut monitor_indexes = HashSet::new();
        for sink in &self.sinks {
            let mut matches = 0;
            for source in &self.sources {
                if is_monitor_of(&source.name, &sink.name) {
                    matches += 1;
                    self.monitor_map.insert(sink.index, source.clone());
                    self.monitors.push(source.clone());
                    monitor_indexes.insert(source.index);
                }
            }
            if matches != 1 {
                return Err(Error::MonitorPairing {
                    sink: sink.name.clone(),
                    count: matches,
                });
            }
        }

        // Every source that is nobody's monitor captures from the outside
        // world and is offered as a microphone.
        for source in &self.sources {
            if !monitor_indexes.contains(&source.index) {
                self.mics.push(source.clone());
            }
        }

        info!(
            "paired {} sinks, {} monitors, {} mics",
            self.sinks.len(),
            self.monitors.len(),
            self.mics.len()
        );

        if let Some(cb) = self.pairing_cb.as_mut() {
            cb(&self.monitors, &self.mics);
        }
        Ok(())
    }

    /// The monitor source mirroring the sink with the given index.
    pub fn monitor_for(&self, sink: u32) -> Option<&Device> {
        self.monitor_map.get(&sink)
    }

    /// Looks up any source (monitor or mic) by its published name.
    pub fn source_by_name(&self, name: &str) -> Option<&Device> {
        self.sources.iter().find(|d| d.name == name)
    }

    pub fn sinks(&self) -> &[Device] {
        &self.sinks
    }

    pub fn sources(&self) -> &[Device] {
        &self.sources
    }

    pub fn monitors(&self) -> &[Device] {
        &self.monitors
    }

    pub fn mics(&self) -> &[Device] {
        &self.mics
    }

    /// True once both enumerations have completed and pairing succeeded.
    pub fn ready(&self) -> bool {
        self.got_sinks && self.got_sources && !self.monitor_map.is_empty()
    }
}
