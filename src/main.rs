//! Tapedeck - a desktop audio capture and playback utility for Linux
//!
//! This is the command-line entry point. All engine work happens in the
//! tapedeck library; this file wires its callbacks to the terminal and
//! dispatches the subcommands.

mod cli;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use tapedeck::device::Device;
use tapedeck::server::{self, Engine, TargetSelector};
use tapedeck::streams::{StreamEntry, UpdateKind};
use tapedeck::wav;

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    cli::init_logging(&args);

    match args.command {
        cli::Command::Devices { json } => list_devices(json),
        cli::Command::Streams { json } => list_streams(json),
        cli::Command::Record {
            device,
            stream,
            duration,
            output,
            playback,
        } => record(device, stream, duration, output, playback),
    }
}

fn list_devices(json: bool) -> anyhow::Result<()> {
    let engine = Engine::new_shared();

    // The pairing callback fires inside the main loop; stash the lists and
    // print after the loop has finished.
    let pairing: Rc<RefCell<Option<(Vec<Device>, Vec<Device>)>>> = Rc::new(RefCell::new(None));
    let sink = pairing.clone();
    engine
        .borrow_mut()
        .catalog
        .set_pairing_callback(move |monitors, mics| {
            *sink.borrow_mut() = Some((monitors.to_vec(), mics.to_vec()));
        });

    server::enumerate_devices(&engine).context("device enumeration failed")?;

    let (monitors, mics) = pairing
        .borrow_mut()
        .take()
        .context("pairing never completed")?;

    if json {
        let doc = serde_json::json!({ "monitors": monitors, "mics": mics });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("Monitors:");
        for dev in &monitors {
            println!("  [{}] {}", dev.index, dev.name);
        }
        println!("Microphones:");
        for dev in &mics {
            println!("  [{}] {}", dev.index, dev.name);
        }
    }
    Ok(())
}

fn list_streams(json: bool) -> anyhow::Result<()> {
    let engine = Engine::new_shared();

    type Snapshot = (Vec<StreamEntry>, HashMap<u32, UpdateKind>);
    let snapshot: Rc<RefCell<Option<Snapshot>>> = Rc::new(RefCell::new(None));
    let sink = snapshot.clone();
    engine
        .borrow_mut()
        .streams
        .set_update_callback(move |streams, updates| {
            *sink.borrow_mut() = Some((streams.to_vec(), updates.clone()));
        });

    server::enumerate_streams(&engine).context("stream enumeration failed")?;

    let (streams, _updates) = snapshot
        .borrow_mut()
        .take()
        .context("no stream snapshot produced")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&streams)?);
    } else if streams.is_empty() {
        println!("No recordable streams.");
    } else {
        for entry in &streams {
            println!("  [{}] {} (sink {})", entry.index, entry.label(), entry.sink);
        }
    }
    Ok(())
}

fn record(
    device: Option<String>,
    stream: Option<u32>,
    duration: u64,
    output: Option<std::path::PathBuf>,
    playback: bool,
) -> anyhow::Result<()> {
    let engine = Engine::new_shared();

    let recorded = Rc::new(RefCell::new(0usize));
    let sink = recorded.clone();
    engine
        .borrow_mut()
        .session
        .set_pcm_progress_callback(move |n| *sink.borrow_mut() += n);

    let selector = match (device, stream) {
        (Some(name), _) => TargetSelector::DeviceName(name),
        (None, Some(index)) => TargetSelector::StreamIndex(index),
        (None, None) => TargetSelector::DefaultMic,
    };

    let clip = server::record(&engine, &selector, Duration::from_secs(duration))
        .context("recording failed")?;
    info!(
        "captured {} bytes ({:.1}s)",
        *recorded.borrow(),
        wav::duration_seconds(*recorded.borrow())
    );

    if playback {
        server::play_clip(&engine, clip).context("playback failed")?;
    }

    let path = wav::resolve_output(output)?;
    engine
        .borrow()
        .session
        .save_clip(clip, &path)
        .with_context(|| format!("saving to {}", path.display()))?;
    println!("Saved {}", path.display());
    Ok(())
}
