//! # Ether Dream Player
//!
//! Streams laser-projector control data to Ether Dream DACs on the local
//! network while decoding it from an 8-channel ILDA-WAV file.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        PLAYER PROCESS                            │
//! │                                                                  │
//! │  ┌───────────────┐        UDP/7654 broadcasts                    │
//! │  │  Discovery    │◄───────────────────────────── Ether Dream(s)  │
//! │  │  Listener     │──snapshots──► UI / supervisor selection       │
//! │  └───────────────┘                                               │
//! │                                                                  │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐       │
//! │  │  8-ch WAV     │──►│  Playback     │──►│  Audio Sink   │       │
//! │  │  Reader       │   │  Engine       │   │  (pacing)     │       │
//! │  └───────────────┘   └──────┬────────┘   └───────────────┘       │
//! │                             │ PointBlocks                        │
//! │                             ▼                                    │
//! │  ┌───────────────┐   ┌───────────────┐    TCP/7765               │
//! │  │  Supervisor   │──►│  Connection   │─────────────► Ether Dream │
//! │  │  (reconnect)  │   │  (paced TCP)  │                           │
//! │  └───────────────┘   └───────────────┘                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! WAV channels 1-5 carry X, Y, R, G, B point data at the PCM sample rate;
//! channels 7-8 carry synchronized stereo audio. The playback engine
//! demultiplexes both, the audio sink's blocking write provides pacing, and
//! the protocol connection rate-matches the DAC's on-device point buffer.
//!
//! Everything runs on plain blocking OS threads: one discovery listener,
//! one playback worker, one sender thread per supervisor, and one reader
//! thread per live connection.

pub mod audio;
pub mod discovery;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod wav;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// UDP port Ether Dream DACs broadcast their presence on
    pub const BROADCAST_PORT: u16 = 7654;

    /// TCP port of the Ether Dream point-streaming protocol
    pub const CONTROL_PORT: u16 = 7765;

    /// Exact length of a valid discovery broadcast packet
    pub const BROADCAST_PACKET_LEN: usize = 36;

    /// A DAC is dropped from the directory after this long without a broadcast
    pub const DAC_EXPIRY: Duration = Duration::from_secs(3);

    /// Receive timeout of the discovery socket (bounds the eviction latency)
    pub const BROADCAST_RECV_TIMEOUT: Duration = Duration::from_millis(1200);

    /// Per-call timeout for every read and write on the control channel
    pub const COMM_TIMEOUT: Duration = Duration::from_millis(500);

    /// TCP connect timeout for the control channel
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

    /// PCM samples decoded per playback iteration
    pub const FRAME_SAMPLES: usize = 1600;

    /// Required channel count of an ILDA-WAV file
    pub const ILDA_WAV_CHANNELS: u16 = 8;

    /// First of the two audio channels in an ILDA-WAV file (zero-indexed)
    pub const ILDA_WAV_AUDIO_CHANNEL: usize = 6;

    /// Audio output channel count
    pub const STEREO: usize = 2;
}
