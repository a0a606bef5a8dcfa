//! ILDA-WAV Player
//!
//! Discovers an Ether Dream DAC on the LAN and streams an 8-channel
//! ILDA-WAV file to it while playing the embedded stereo audio.

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use etherdream_player::{
    audio::CpalSink,
    discovery::{DacDiscovery, DacMap},
    playback::PlaybackEngine,
    protocol::DacSupervisor,
    wav::IldaWavReader,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let wav_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("Usage: player <show.wav> [dac-id]");
            std::process::exit(2);
        }
    };
    let wanted_dac = std::env::args().nth(2);

    // Open and validate the show file before touching the network
    let reader = IldaWavReader::open(&wav_path)
        .with_context(|| format!("Failed to open {}", wav_path))?;
    let seconds = reader.len_frames() as f64 / reader.sample_rate() as f64;
    tracing::info!(
        "Opened {}: {} Hz, {}-bit, {:.1}s",
        wav_path,
        reader.sample_rate(),
        reader.bits_per_sample(),
        seconds
    );

    // Wait for a DAC broadcast
    tracing::info!("Waiting for DAC broadcasts on UDP 7654...");
    let discovery = DacDiscovery::new();
    let (snapshot_tx, snapshot_rx) = bounded::<DacMap>(16);
    discovery.subscribe(Box::new(move |snapshot| {
        let _ = snapshot_tx.try_send(snapshot.clone());
    }))?;

    let dac = loop {
        let snapshot = snapshot_rx
            .recv_timeout(Duration::from_secs(30))
            .context("No DAC appeared within 30 seconds")?;
        let found = match &wanted_dac {
            Some(id) => snapshot.get(id).cloned(),
            None => snapshot.values().next().cloned(),
        };
        if let Some(dac) = found {
            break dac;
        }
    };
    tracing::info!(
        "Using DAC {} at {} (hw rev {}, sw rev {}, buffer {})",
        dac.id,
        dac.ip_addr,
        dac.hardware_rev,
        dac.software_rev,
        dac.buffer_capacity
    );

    // Wire the pipeline: WAV -> engine -> (audio sink, DAC supervisor)
    let sink = CpalSink::open(reader.sample_rate(), reader.bytes_per_sample())?;
    let supervisor = Arc::new(DacSupervisor::connect(&dac)?);

    let dac_frames = Arc::clone(&supervisor);
    let mut frames_shown = 0u64;
    let mut engine = PlaybackEngine::start(
        reader,
        Box::new(sink),
        Box::new(move |position, _frame, is_seek| {
            frames_shown += 1;
            if is_seek {
                tracing::info!("Seeked to {:.1}%", position * 100.0);
            } else if frames_shown % 300 == 0 {
                tracing::info!("Position: {:.1}%", position * 100.0);
            }
        }),
        Box::new(move |block| {
            let _ = dac_frames.add_frame(block);
        }),
    )?;

    engine.request_playback(true);
    tracing::info!("Playing - Ctrl+C to stop");

    // the engine clears its play request at end of stream
    while engine.is_playback_requested() {
        std::thread::sleep(Duration::from_millis(200));
    }
    tracing::info!("End of show");

    engine.shutdown();
    supervisor.shutdown();
    Ok(())
}
