//! PipeWire reactor glue.
//!
//! Everything here runs on a single PipeWire main loop. The registry feeds
//! the device catalog and the stream diff engine, timers drive the debounce
//! protocol, and the capture/playback stream process callbacks move bytes
//! between the server and the session controller. The core components never
//! see PipeWire types.

use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::device::{monitor_source_name, sink_of_monitor, Device, DeviceCatalog};
use crate::error::{Error, Result};
use crate::session::{CaptureSpec, PlaybackSpec, Recordable, SessionController, SessionState};
use crate::streams::{StreamDiffEngine, StreamEntry, UpdateKind, DEBOUNCE_DELAY};
use crate::wav::{CHANNELS, FRAME_BYTES, SAMPLE_RATE};

static PIPEWIRE_INIT: Once = Once::new();

/// Application name advertised to the server.
const APP_NAME: &str = "Tapedeck";

/// Time allowed for the initial registry burst to settle before pairing
/// runs and a session may start.
const READY_SETTLE: Duration = Duration::from_millis(200);

/// The engine state shared between reactor callbacks.
///
/// Held behind `Rc<RefCell<...>>`; all access happens from main-loop
/// callbacks on one thread, so borrows never overlap as long as the
/// user-registered callbacks do not re-enter the engine.
pub struct Engine {
    pub catalog: DeviceCatalog,
    pub streams: StreamDiffEngine,
    pub session: SessionController,
}

pub type SharedEngine = Rc<RefCell<Engine>>;

impl Engine {
    pub fn new_shared() -> SharedEngine {
        Rc::new(RefCell::new(Self {
            catalog: DeviceCatalog::new(),
            streams: StreamDiffEngine::new(),
            session: SessionController::new(),
        }))
    }
}

/// How a record run picks its capture target.
#[derive(Debug, Clone)]
pub enum TargetSelector {
    /// First microphone from the paired catalog.
    DefaultMic,
    /// A source (mic or monitor) by its published name.
    DeviceName(String),
    /// One application's stream by server index.
    StreamIndex(u32),
}

fn ensure_init() {
    PIPEWIRE_INIT.call_once(|| {
        pw::init();
    });
}

fn server_err(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Server(format!("{what}: {e}"))
}

/// Serialized format pod for the engine's fixed sample format.
fn audio_format_values() -> Result<Vec<u8>> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::S16LE);
    audio_info.set_rate(SAMPLE_RATE);
    audio_info.set_channels(CHANNELS as u32);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| Error::Server(format!("failed to serialize audio format: {e:?}")))?
    .0
    .into_inner();
    Ok(values)
}

/// One main-loop context: connection, registry mirroring, debounce tick.
///
/// Lives for the duration of a single [`run`](Reactor::run); the engine
/// state it feeds outlives it.
struct Reactor {
    mainloop: pw::main_loop::MainLoopRc,
    // Kept alive for the duration of the run; the core borrows from it.
    _context: pw::context::ContextRc,
    core: pw::core::CoreRc,
    engine: SharedEngine,
    /// Server-side view of the live application streams, keyed by node id.
    /// Replayed through the diff engine on every update cycle.
    mirror: Rc<RefCell<BTreeMap<u32, StreamEntry>>>,
    /// Set when the diff engine asks for a debounce timer; consumed by the
    /// periodic tick.
    debounce_due: Rc<Cell<bool>>,
    /// First hard failure seen by any callback; ends the run.
    failure: Rc<RefCell<Option<Error>>>,
}

impl Reactor {
    fn connect(engine: SharedEngine) -> Result<Self> {
        ensure_init();
        let mainloop = pw::main_loop::MainLoopRc::new(None)
            .map_err(|e| server_err("failed to create main loop", e))?;
        let context = pw::context::ContextRc::new(&mainloop, None)
            .map_err(|e| server_err("failed to create context", e))?;
        let core = context
            .connect_rc(None)
            .map_err(|e| server_err("failed to connect to PipeWire", e))?;
        Ok(Self {
            mainloop,
            _context: context,
            core,
            engine,
            mirror: Rc::new(RefCell::new(BTreeMap::new())),
            debounce_due: Rc::new(Cell::new(false)),
            failure: Rc::new(RefCell::new(None)),
        })
    }

    /// Records a failure and stops the loop at the next opportunity.
    fn fail(failure: &Rc<RefCell<Option<Error>>>, mainloop: &pw::main_loop::MainLoopWeak, err: Error) {
        error!("{err}");
        failure.borrow_mut().get_or_insert(err);
        if let Some(mainloop) = mainloop.upgrade() {
            mainloop.quit();
        }
    }

    /// Replays the mirrored server state through one diff cycle.
    fn run_update_cycle(engine: &SharedEngine, mirror: &Rc<RefCell<BTreeMap<u32, StreamEntry>>>) -> Result<bool> {
        let mut eng = engine.borrow_mut();
        eng.streams.begin_cycle();
        for entry in mirror.borrow().values() {
            eng.streams.offer(entry.clone())?;
        }
        Ok(eng.streams.finish_enumeration())
    }
}

/// Builds a stream node entry from registry properties.
///
/// Streams that do not declare a target sink are assumed to follow the
/// default sink; the catalog substitutes the first enumerated one when the
/// session resolves the stream's monitor.
fn stream_entry_from_props(
    id: u32,
    props: &spa::utils::dict::DictRef,
) -> StreamEntry {
    let sink = props
        .get(*pw::keys::TARGET_OBJECT)
        .or_else(|| props.get(*pw::keys::NODE_TARGET))
        .and_then(|s| s.parse().ok())
        .unwrap_or(u32::MAX);
    let mut entry = StreamEntry::new(id, sink);
    for (key, value) in props.iter() {
        entry.props.insert(key.to_string(), value.to_string());
    }
    entry
}

/// Feeds one registry global into the catalog and the stream mirror.
fn process_global<P: AsRef<spa::utils::dict::DictRef>>(
    engine: &SharedEngine,
    mirror: &Rc<RefCell<BTreeMap<u32, StreamEntry>>>,
    debounce_due: &Rc<Cell<bool>>,
    global: &pw::registry::GlobalObject<P>,
) {
    if global.type_ != pw::types::ObjectType::Node {
        return;
    }
    let props = match &global.props {
        Some(p) => p.as_ref(),
        None => return,
    };
    let name = props
        .get(*pw::keys::NODE_NAME)
        .map(String::from)
        .unwrap_or_else(|| format!("node-{}", global.id));

    match props.get(*pw::keys::MEDIA_CLASS) {
        Some("Audio/Sink") => {
            let mut eng = engine.borrow_mut();
            eng.catalog.add_sink(Device::new(name.clone(), global.id));
            // The monitor capture path of a sink is addressed by the
            // sink's name plus the monitor suffix, mirroring how the
            // compatibility layer publishes it as a source.
            eng.catalog
                .add_source(Device::new(monitor_source_name(&name), global.id));
        }
        Some("Audio/Source") => {
            engine
                .borrow_mut()
                .catalog
                .add_source(Device::new(name, global.id));
        }
        Some("Stream/Output/Audio") => {
            let entry = stream_entry_from_props(global.id, props);
            debug!("stream {}: {}", global.id, entry.label());
            mirror.borrow_mut().insert(global.id, entry);
            if engine
                .borrow_mut()
                .streams
                .queue_update(global.id, UpdateKind::New)
            {
                debounce_due.set(true);
            }
        }
        _ => {}
    }
}

/// Opens a capture stream and wires its process callback to the session.
fn connect_capture_stream(
    core: &pw::core::CoreRc,
    engine: SharedEngine,
    spec: &CaptureSpec,
) -> Result<(pw::stream::StreamBox, pw::stream::StreamListener<CaptureData>)> {
    // An application stream is targeted by its node id; a monitor source is
    // addressed through its sink with the capture-sink flag; a plain source
    // is targeted by name.
    let (target, capture_sink) = match spec.stream {
        Some(index) => (index.to_string(), false),
        None => match sink_of_monitor(&spec.device) {
            Some(sink) => (sink.to_string(), true),
            None => (spec.device.clone(), false),
        },
    };
    let props = if capture_sink {
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Production",
            *pw::keys::APP_NAME => APP_NAME,
            *pw::keys::TARGET_OBJECT => target.as_str(),
            "stream.capture.sink" => "true",
        }
    } else {
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Production",
            *pw::keys::APP_NAME => APP_NAME,
            *pw::keys::TARGET_OBJECT => target.as_str(),
        }
    };

    let stream = pw::stream::StreamBox::new(core, "tapedeck-capture", props)
        .map_err(|e| server_err("failed to create capture stream", e))?;

    let user_data = CaptureData {
        format: Default::default(),
        engine,
        generation: spec.generation,
    };

    let listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            on_format_changed(&mut user_data.format, id, param);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }
            let data = &mut datas[0];
            let size = data.chunk().size() as usize;
            if let Some(raw) = data.data() {
                let chunk = &raw[..size.min(raw.len())];
                let result = user_data
                    .engine
                    .borrow_mut()
                    .session
                    .on_capture_data(user_data.generation, chunk);
                if let Err(e) = result {
                    error!("capture transfer failed: {e}");
                }
            }
        })
        .register()
        .map_err(|e| server_err("failed to register capture listener", e))?;

    let values = audio_format_values()?;
    let mut params = [Pod::from_bytes(&values).expect("format pod is well formed")];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| server_err("failed to connect capture stream", e))?;

    Ok((stream, listener))
}

struct CaptureData {
    format: spa::param::audio::AudioInfoRaw,
    engine: SharedEngine,
    generation: u64,
}

struct PlaybackData {
    format: spa::param::audio::AudioInfoRaw,
    engine: SharedEngine,
    generation: u64,
    mainloop_weak: pw::main_loop::MainLoopWeak,
}

/// Shared param_changed handler: parse and remember the negotiated format.
fn on_format_changed(
    format: &mut spa::param::audio::AudioInfoRaw,
    id: u32,
    param: Option<&Pod>,
) {
    let Some(param) = param else { return };
    if id != spa::param::ParamType::Format.as_raw() {
        return;
    }
    let (media_type, media_subtype) = match format_utils::parse_format(param) {
        Ok(v) => v,
        Err(_) => return,
    };
    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return;
    }
    if format.parse(param).is_ok() {
        info!(
            "negotiated format: {} ch at {} Hz",
            format.channels(),
            format.rate()
        );
    }
}

/// Resolves the user's target selection against the paired catalog.
fn resolve_target(eng: &Engine, selector: &TargetSelector) -> Result<Recordable> {
    match selector {
        TargetSelector::DefaultMic => eng
            .catalog
            .mics()
            .first()
            .cloned()
            .map(Recordable::Device)
            .ok_or_else(|| Error::DeviceNotFound("no microphone available".into())),
        TargetSelector::DeviceName(name) => eng
            .catalog
            .source_by_name(name)
            .cloned()
            .map(Recordable::Device)
            .ok_or_else(|| Error::DeviceNotFound(name.clone())),
        TargetSelector::StreamIndex(index) => {
            let mut entry = eng
                .streams
                .find(*index)
                .cloned()
                .ok_or_else(|| Error::DeviceNotFound(format!("stream index {index}")))?;
            if eng.catalog.monitor_for(entry.sink).is_none() {
                if let Some(first) = eng.catalog.sinks().first() {
                    debug!(
                        "stream {index} has no declared sink, assuming sink {}",
                        first.index
                    );
                    entry.sink = first.index;
                }
            }
            Ok(Recordable::Stream(entry))
        }
    }
}

/// Connects, enumerates devices, and returns once pairing has completed.
///
/// The catalog's pairing callback fires from inside the loop; callers read
/// the lists off the engine afterwards.
pub fn enumerate_devices(engine: &SharedEngine) -> Result<()> {
    let reactor = Reactor::connect(engine.clone())?;
    engine.borrow_mut().catalog.begin_refresh();

    let registry = reactor
        .core
        .get_registry_rc()
        .map_err(|e| server_err("failed to get registry", e))?;

    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let due_cl = reactor.debounce_due.clone();
    let _registry_listener = registry
        .add_listener_local()
        .global(move |global| {
            process_global(&engine_cl, &mirror_cl, &due_cl, global);
        })
        .register();

    let engine_cl = reactor.engine.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let settle = reactor.mainloop.loop_().add_timer(move |_| {
        let result = {
            let mut eng = engine_cl.borrow_mut();
            eng.catalog.finish_sinks().and_then(|_| eng.catalog.finish_sources())
        };
        if let Err(e) = result {
            Reactor::fail(&failure_cl, &mainloop_weak, e);
        } else if let Some(mainloop) = mainloop_weak.upgrade() {
            mainloop.quit();
        }
    });
    settle
        .update_timer(Some(READY_SETTLE), None)
        .into_result()
        .map_err(|e| server_err("failed to arm settle timer", e))?;

    reactor.mainloop.run();

    match reactor.failure.borrow_mut().take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Connects, watches stream lifecycle events through one debounce round,
/// and returns with the diff engine holding the live snapshot.
pub fn enumerate_streams(engine: &SharedEngine) -> Result<()> {
    let reactor = Reactor::connect(engine.clone())?;
    engine.borrow_mut().catalog.begin_refresh();

    let registry = reactor
        .core
        .get_registry_rc()
        .map_err(|e| server_err("failed to get registry", e))?;

    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let due_cl = reactor.debounce_due.clone();
    let _registry_listener = registry
        .add_listener_local()
        .global(move |global| {
            process_global(&engine_cl, &mirror_cl, &due_cl, global);
        })
        .register();

    // The registry burst queues New events; the tick turns them into
    // debounced update cycles exactly as it does during a long session.
    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let due_cl = reactor.debounce_due.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let tick = reactor.mainloop.loop_().add_timer(move |_| {
        if !due_cl.replace(false) {
            return;
        }
        match Reactor::run_update_cycle(&engine_cl, &mirror_cl) {
            Ok(more) => due_cl.set(more),
            Err(e) => Reactor::fail(&failure_cl, &mainloop_weak, e),
        }
    });
    tick.update_timer(Some(DEBOUNCE_DELAY), Some(DEBOUNCE_DELAY))
        .into_result()
        .map_err(|e| server_err("failed to arm debounce tick", e))?;

    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let settle = reactor.mainloop.loop_().add_timer(move |_| {
        // Final cycle so even an empty or already-settled server state
        // produces one authoritative snapshot.
        if let Err(e) = Reactor::run_update_cycle(&engine_cl, &mirror_cl) {
            Reactor::fail(&failure_cl, &mainloop_weak, e);
        } else if let Some(mainloop) = mainloop_weak.upgrade() {
            mainloop.quit();
        }
    });
    settle
        .update_timer(Some(READY_SETTLE + DEBOUNCE_DELAY), None)
        .into_result()
        .map_err(|e| server_err("failed to arm settle timer", e))?;

    reactor.mainloop.run();

    match reactor.failure.borrow_mut().take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Connects, records from the selected target for `duration`, and returns
/// the id of the recorded clip.
///
/// Stream lifecycle events keep flowing through the diff engine while the
/// session runs, so the registered snapshot callback stays live.
pub fn record(
    engine: &SharedEngine,
    selector: &TargetSelector,
    duration: Duration,
) -> Result<u64> {
    let reactor = Reactor::connect(engine.clone())?;
    {
        let mut eng = engine.borrow_mut();
        eng.catalog.begin_refresh();
        eng.streams.begin_enumeration();
    }

    let registry = reactor
        .core
        .get_registry_rc()
        .map_err(|e| server_err("failed to get registry", e))?;

    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let due_cl = reactor.debounce_due.clone();
    let _registry_listener = registry
        .add_listener_local()
        .global(move |global| {
            process_global(&engine_cl, &mirror_cl, &due_cl, global);
        })
        .register();

    // A core-level error means the connection itself is gone; that is
    // terminal for the session.
    let engine_cl = reactor.engine.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let _core_listener = reactor
        .core
        .add_listener_local()
        .error(move |id, _seq, res, message| {
            debug!("core error on id {id} (res {res}): {message}");
            if id == 0 {
                let err = engine_cl.borrow_mut().session.on_server_failure(message);
                Reactor::fail(&failure_cl, &mainloop_weak, err);
            }
        })
        .register();

    // Keeps the capture stream and its listener alive for the run.
    type CaptureSlot = Rc<RefCell<Option<(pw::stream::StreamBox, pw::stream::StreamListener<CaptureData>)>>>;
    let capture: CaptureSlot = Rc::new(RefCell::new(None));
    let clip_slot: Rc<Cell<Option<u64>>> = Rc::new(Cell::new(None));

    // Ready: the registry burst has settled. Pair devices, run the first
    // stream cycle, resolve the target and open the capture stream.
    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let due_cl = reactor.debounce_due.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let core_cl = reactor.core.clone();
    let capture_cl = capture.clone();
    let clip_cl = clip_slot.clone();
    let selector_cl = selector.clone();
    let ready = reactor.mainloop.loop_().add_timer(move |_| {
        due_cl.set(false);
        let started = (|| -> Result<CaptureSpec> {
            {
                let mut eng = engine_cl.borrow_mut();
                eng.catalog.finish_sinks()?;
                eng.catalog.finish_sources()?;
            }
            Reactor::run_update_cycle(&engine_cl, &mirror_cl)?;
            let eng = &mut *engine_cl.borrow_mut();
            let target = resolve_target(eng, &selector_cl)?;
            eng.session.start_recording(&target, &eng.catalog)
        })();
        match started {
            Ok(spec) => match connect_capture_stream(&core_cl, engine_cl.clone(), &spec) {
                Ok(stream) => {
                    clip_cl.set(Some(spec.clip));
                    *capture_cl.borrow_mut() = Some(stream);
                }
                Err(e) => {
                    let err = engine_cl.borrow_mut().session.on_server_failure(&e.to_string());
                    Reactor::fail(&failure_cl, &mainloop_weak, err);
                }
            },
            Err(e) => Reactor::fail(&failure_cl, &mainloop_weak, e),
        }
    });
    ready
        .update_timer(Some(READY_SETTLE), None)
        .into_result()
        .map_err(|e| server_err("failed to arm ready timer", e))?;

    // Debounce tick: lifecycle events arriving during the session.
    let engine_cl = reactor.engine.clone();
    let mirror_cl = reactor.mirror.clone();
    let due_cl = reactor.debounce_due.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let tick = reactor.mainloop.loop_().add_timer(move |_| {
        if !due_cl.replace(false) {
            return;
        }
        match Reactor::run_update_cycle(&engine_cl, &mirror_cl) {
            Ok(more) => due_cl.set(more),
            Err(e) => Reactor::fail(&failure_cl, &mainloop_weak, e),
        }
    });
    tick.update_timer(Some(DEBOUNCE_DELAY), Some(DEBOUNCE_DELAY))
        .into_result()
        .map_err(|e| server_err("failed to arm debounce tick", e))?;

    // Stop: duration elapsed. Tear the stream down, then leave the loop.
    let engine_cl = reactor.engine.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let capture_cl = capture.clone();
    let stop = reactor.mainloop.loop_().add_timer(move |_| {
        // Dropping the stream disconnects it; the generation guard ignores
        // anything the server still delivers.
        capture_cl.borrow_mut().take();
        let mut eng = engine_cl.borrow_mut();
        if eng.session.state() == SessionState::Recording {
            if let Err(e) = eng.session.stop_recording() {
                warn!("stop after capture teardown: {e}");
            }
        }
        if let Some(mainloop) = mainloop_weak.upgrade() {
            mainloop.quit();
        }
    });
    stop.update_timer(Some(READY_SETTLE + duration), None)
        .into_result()
        .map_err(|e| server_err("failed to arm stop timer", e))?;

    reactor.mainloop.run();

    // A failure can end the loop mid-session; make sure the stream is gone
    // and the state machine is back to idle before reporting.
    capture.borrow_mut().take();
    {
        let mut eng = engine.borrow_mut();
        if eng.session.state() == SessionState::Recording {
            if let Err(e) = eng.session.stop_recording() {
                warn!("stop after loop exit: {e}");
            }
        }
    }

    if let Some(err) = reactor.failure.borrow_mut().take() {
        return Err(err);
    }
    clip_slot
        .get()
        .ok_or_else(|| Error::Server("recording never started".into()))
}

/// Connects and plays a recorded clip to the default sink, returning once
/// the last byte has been delivered.
pub fn play_clip(engine: &SharedEngine, id: u64) -> Result<()> {
    let reactor = Reactor::connect(engine.clone())?;
    let spec: PlaybackSpec = engine.borrow_mut().session.start_playback(id)?;

    let engine_cl = reactor.engine.clone();
    let failure_cl = reactor.failure.clone();
    let mainloop_weak = reactor.mainloop.downgrade();
    let _core_listener = reactor
        .core
        .add_listener_local()
        .error(move |id, _seq, res, message| {
            debug!("core error on id {id} (res {res}): {message}");
            if id == 0 {
                let err = engine_cl.borrow_mut().session.on_server_failure(message);
                Reactor::fail(&failure_cl, &mainloop_weak, err);
            }
        })
        .register();

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Production",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&reactor.core, "tapedeck-playback", props)
        .map_err(|e| server_err("failed to create playback stream", e))?;

    let user_data = PlaybackData {
        format: Default::default(),
        engine: reactor.engine.clone(),
        generation: spec.generation,
        mainloop_weak: reactor.mainloop.downgrade(),
    };

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            on_format_changed(&mut user_data.format, id, param);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }
            let data = &mut datas[0];
            let Some(slice) = data.data() else {
                return;
            };
            let fill = match user_data
                .engine
                .borrow_mut()
                .session
                .on_playback_ready(user_data.generation, slice)
            {
                Ok(fill) => fill,
                Err(e) => {
                    error!("playback transfer failed: {e}");
                    if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                        mainloop.quit();
                    }
                    return;
                }
            };

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = FRAME_BYTES as i32;
            *chunk.size_mut() = fill.written as u32;

            if fill.finished {
                // The session already returned to idle inside the handler.
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
        })
        .register()
        .map_err(|e| server_err("failed to register playback listener", e))?;

    let values = audio_format_values()?;
    let mut params = [Pod::from_bytes(&values).expect("format pod is well formed")];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| server_err("failed to connect playback stream", e))?;

    reactor.mainloop.run();

    // If the loop ended for any reason other than exhaustion, wind the
    // session back down so the engine is reusable.
    {
        let mut eng = engine.borrow_mut();
        if eng.session.state() == SessionState::PlayingBack {
            eng.session.stop_playback()?;
        }
    }
    match reactor.failure.borrow_mut().take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
