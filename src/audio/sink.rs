//! Blocking PCM output
//!
//! The playback engine is paced by its audio sink: `write` returns once the
//! sink has absorbed the data, so a full sink makes the decode loop run at
//! real-time speed. The cpal stream lives on its own thread because cpal
//! streams are not `Send`.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::STEREO;
use crate::error::AudioError;

/// Queue bound in whole stereo frames (~200 ms at the stream rate).
fn high_watermark(sample_rate: u32) -> usize {
    (sample_rate as usize / 5) * STEREO
}

/// Blocking sink for interleaved stereo PCM at the source's sample width.
pub trait AudioSink: Send {
    /// Write signed little-endian PCM bytes, blocking until the sink has
    /// drained enough to absorb them.
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;
}

/// System audio output via cpal.
pub struct CpalSink {
    shared: Arc<SinkShared>,
    running: Arc<AtomicBool>,
    error_rx: Receiver<AudioError>,
    thread_handle: Option<JoinHandle<()>>,
    bytes_per_sample: usize,
    high_watermark: usize,
}

struct SinkShared {
    queue: Mutex<VecDeque<f32>>,
    drained: Condvar,
}

impl CpalSink {
    /// Open the default output device as a stereo f32 stream at
    /// `sample_rate`. `bytes_per_sample` is the width of the incoming PCM
    /// (2 or 3).
    pub fn open(sample_rate: u32, bytes_per_sample: usize) -> Result<Self, AudioError> {
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(VecDeque::new()),
            drained: Condvar::new(),
        });
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (init_tx, init_rx) = bounded::<Result<(), AudioError>>(1);

        let shared_for_thread = Arc::clone(&shared);
        let running_for_thread = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                run_output(
                    sample_rate,
                    shared_for_thread,
                    running_for_thread,
                    error_tx,
                    init_tx,
                );
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match init_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                shared,
                running,
                error_rx,
                thread_handle: Some(handle),
                bytes_per_sample,
                high_watermark: high_watermark(sample_rate),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(AudioError::StreamError("stream start timed out".to_string()))
            }
        }
    }

    fn check_errors(&self) -> Result<(), AudioError> {
        match self.error_rx.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.drained.notify_all();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.check_errors()?;
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::Closed);
        }

        let samples = pcm_to_f32(pcm, self.bytes_per_sample);

        let mut queue = self.shared.queue.lock().unwrap();
        while queue.len() > self.high_watermark {
            if !self.running.load(Ordering::SeqCst) {
                return Err(AudioError::Closed);
            }
            let (guard, _) = self
                .shared
                .drained
                .wait_timeout(queue, Duration::from_millis(500))
                .unwrap();
            queue = guard;
        }
        queue.extend(samples);
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_output(
    sample_rate: u32,
    shared: Arc<SinkShared>,
    running: Arc<AtomicBool>,
    error_tx: crossbeam_channel::Sender<AudioError>,
    init_tx: crossbeam_channel::Sender<Result<(), AudioError>>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(d) => d,
        None => {
            let _ = init_tx.send(Err(AudioError::NoDevice));
            return;
        }
    };

    let config = cpal::StreamConfig {
        channels: STEREO as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_shared = Arc::clone(&shared);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = callback_shared.queue.lock().unwrap();
            for sample in data.iter_mut() {
                // silence on underrun keeps the stream alive
                *sample = queue.pop_front().unwrap_or(0.0);
            }
            drop(queue);
            callback_shared.drained.notify_all();
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    );

    match stream {
        Ok(stream) => {
            if let Err(e) = stream.play() {
                let _ = init_tx.send(Err(AudioError::StreamError(e.to_string())));
                return;
            }
            let _ = init_tx.send(Ok(()));

            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
            }

            // stream is dropped here, stopping output
        }
        Err(e) => {
            let _ = init_tx.send(Err(AudioError::StreamError(e.to_string())));
        }
    }
}

/// Convert signed little-endian PCM bytes to f32 samples in [-1, 1].
fn pcm_to_f32(pcm: &[u8], bytes_per_sample: usize) -> Vec<f32> {
    match bytes_per_sample {
        2 => pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
            .collect(),
        3 => pcm
            .chunks_exact(3)
            .map(|b| {
                let value = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                value as f32 / 8_388_608.0
            })
            .collect(),
        _ => Vec::new(),
    }
}
