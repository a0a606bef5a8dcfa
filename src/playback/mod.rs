//! WAV playback pipeline
//!
//! A dedicated worker thread demultiplexes the 8-channel stream: channels
//! 1-5 become laser points handed to the point callback, channels 7-8
//! become stereo PCM written to the audio sink. The sink's blocking write
//! is the pacing clock - while playing, the loop runs exactly at real-time
//! speed. Every iteration also publishes a preview frame through the
//! display callback, seeking or not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::audio::AudioSink;
use crate::constants::{FRAME_SAMPLES, ILDA_WAV_AUDIO_CHANNEL, ILDA_WAV_CHANNELS, STEREO};
use crate::protocol::PointBlock;
use crate::wav::IldaWavReader;

/// 8-bit preview color derived from the 16-bit point intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayPoint {
    pub x: i32,
    pub y: i32,
    pub color: DisplayColor,
}

/// Preview frame of exactly [`FRAME_SAMPLES`] points.
///
/// The engine keeps a private frame and hands each subscriber a copy, so it
/// may freely overwrite its own on the next iteration.
#[derive(Clone)]
pub struct DisplayFrame {
    pub points: Vec<DisplayPoint>,
}

impl DisplayFrame {
    fn new() -> Self {
        Self {
            points: vec![DisplayPoint::default(); FRAME_SAMPLES],
        }
    }
}

/// Invoked once per decoded frame with (position, frame, caused-by-seek).
pub type DisplayCallback = Box<dyn FnMut(f32, DisplayFrame, bool) + Send>;

/// Receives the decoded point blocks while playback is running.
pub type PointCallback = Box<dyn FnMut(PointBlock) + Send>;

#[derive(Default)]
struct Requests {
    seek: Option<f32>,
    play: bool,
    shutdown: bool,
}

struct EngineShared {
    requests: Mutex<Requests>,
    cond: Condvar,
}

/// Decode loop with a play/pause/seek request latch.
pub struct PlaybackEngine {
    shared: Arc<EngineShared>,
    /// Mirror of the play request for lock-free UI polling
    playing: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Spawn the worker thread over a validated reader. Playback starts
    /// paused.
    pub fn start(
        reader: IldaWavReader,
        sink: Box<dyn AudioSink>,
        display_callback: DisplayCallback,
        point_callback: PointCallback,
    ) -> crate::Result<Self> {
        let shared = Arc::new(EngineShared {
            requests: Mutex::new(Requests::default()),
            cond: Condvar::new(),
        });
        let playing = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            reader,
            sink,
            display_callback,
            point_callback,
            shared: Arc::clone(&shared),
            playing: Arc::clone(&playing),
        };
        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || worker.run())
            .map_err(crate::Error::Io)?;

        Ok(Self {
            shared,
            playing,
            handle: Some(handle),
        })
    }

    /// Reposition the stream; `position` is a fraction of the file in
    /// `[0, 1]`, applied on the next loop iteration.
    pub fn seek(&self, position: f32) {
        let mut requests = self.shared.requests.lock().unwrap();
        requests.seek = Some(position.clamp(0.0, 1.0));
        drop(requests);
        self.shared.cond.notify_all();
    }

    /// Toggle play/pause.
    pub fn request_playback(&self, play: bool) {
        let mut requests = self.shared.requests.lock().unwrap();
        requests.play = play;
        self.playing.store(play, Ordering::Relaxed);
        drop(requests);
        self.shared.cond.notify_all();
    }

    /// Current play request, readable without taking the engine lock.
    pub fn is_playback_requested(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Stop the worker thread.
    pub fn shutdown(&mut self) {
        {
            let mut requests = self.shared.requests.lock().unwrap();
            requests.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    reader: IldaWavReader,
    sink: Box<dyn AudioSink>,
    display_callback: DisplayCallback,
    point_callback: PointCallback,
    shared: Arc<EngineShared>,
    playing: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) {
        let channels = ILDA_WAV_CHANNELS as usize;
        let sample_bytes = self.reader.bytes_per_sample();
        // point channels are consumed at 16-bit depth regardless of width
        let shift = u32::from(self.reader.bits_per_sample()) - 16;
        let len_frames = u64::from(self.reader.len_frames());
        let rate = self.reader.sample_rate();

        let mut samples: Vec<i32> = Vec::with_capacity(FRAME_SAMPLES * channels);
        let mut pcm = vec![0u8; FRAME_SAMPLES * STEREO * sample_bytes];
        let mut display = DisplayFrame::new();
        let mut position_samples: u64 = 0;

        loop {
            // wait until there is something to do
            let seek_request = {
                let mut requests = self.shared.requests.lock().unwrap();
                loop {
                    if requests.shutdown {
                        return;
                    }
                    if requests.play || requests.seek.is_some() {
                        break;
                    }
                    requests = self.shared.cond.wait(requests).unwrap();
                }
                requests.seek.take()
            };

            if let Some(position) = seek_request {
                position_samples = (len_frames as f64 * f64::from(position)).round() as u64;
                if let Err(e) = self.reader.seek_to_frame(position_samples as u32) {
                    tracing::error!("Seek failed: {}", e);
                    return;
                }
            }

            let frames_read = match self.reader.read_frames(FRAME_SAMPLES, &mut samples) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("WAV read failed: {}", e);
                    return;
                }
            };

            if frames_read == 0 {
                // end of stream: fall back to pause, keep serving seeks
                let mut requests = self.shared.requests.lock().unwrap();
                requests.play = false;
                self.playing.store(false, Ordering::Relaxed);
                continue;
            }

            let mut block = PointBlock::new(frames_read, rate);
            for i in 0..frames_read {
                let frame = &samples[i * channels..(i + 1) * channels];

                // ILDA convention: signs inverted, colors doubled onto the
                // unsigned 16-bit range; set_point clamps
                let x = -(frame[0] >> shift);
                let y = -(frame[1] >> shift);
                let r = -(frame[2] >> shift) * 2;
                let g = -(frame[3] >> shift) * 2;
                let b = -(frame[4] >> shift) * 2;
                block.set_point(i, x, y, r, g, b);

                // channels 6 and 7 pass through as interleaved stereo PCM
                let out = i * STEREO * sample_bytes;
                let left = frame[ILDA_WAV_AUDIO_CHANNEL].to_le_bytes();
                let right = frame[ILDA_WAV_AUDIO_CHANNEL + 1].to_le_bytes();
                pcm[out..out + sample_bytes].copy_from_slice(&left[..sample_bytes]);
                pcm[out + sample_bytes..out + 2 * sample_bytes]
                    .copy_from_slice(&right[..sample_bytes]);

                display.points[i] = DisplayPoint {
                    x,
                    y,
                    color: DisplayColor {
                        r: (r >> 8).clamp(0, 255) as u8,
                        g: (g >> 8).clamp(0, 255) as u8,
                        b: (b >> 8).clamp(0, 255) as u8,
                    },
                };
            }

            let position = match seek_request {
                Some(p) => p,
                None => position_samples as f32 / len_frames.max(1) as f32,
            };
            (self.display_callback)(position, display.clone(), seek_request.is_some());

            let play = self.shared.requests.lock().unwrap().play;
            if play {
                // the blocking audio write paces the loop
                if let Err(e) = self.sink.write(&pcm[..frames_read * STEREO * sample_bytes]) {
                    tracing::error!("Audio sink failed, stopping playback: {}", e);
                    return;
                }
                (self.point_callback)(block);
            }

            position_samples += frames_read as u64;
        }
    }
}
