//! Error types for the laser streaming application

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WAV error: {0}")]
    Wav(#[from] WavError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovery listener errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),
}

/// Ether Dream control-channel errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DAC returned response byte 0x{0:02x}")]
    UnexpectedResponse(u8),

    #[error("ACK for command '{0}' without an outstanding command")]
    AckUnderflow(char),

    #[error("Timed out waiting for a command ACK")]
    AckTimeout,

    #[error("Read timed out with point data queued")]
    ReadTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session has been shut down")]
    ShutDown,
}

/// ILDA-WAV input errors
#[derive(Error, Debug)]
pub enum WavError {
    #[error("Failed to open WAV file: {0}")]
    Open(#[from] hound::Error),

    #[error("Expected an 8-channel ILDA WAV file, got {0} channel(s)")]
    ChannelCount(u16),

    #[error("Unsupported sample format: {bits}-bit {format}, expected 16- or 24-bit signed PCM")]
    SampleFormat { bits: u16, format: &'static str },

    #[error("Seek failed: {0}")]
    Seek(String),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No output device available")]
    NoDevice,

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Audio sink is closed")]
    Closed,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
