//! Ether Dream wire formats
//!
//! Status blocks, command/response framing and the point layout are defined
//! by the Ether Dream point-streaming protocol. All multi-byte integers are
//! little-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Length of a parsed status block
pub const STATUS_LEN: usize = 20;

/// Length of a command response (response byte, command echo, status)
pub const RESPONSE_LEN: usize = 22;

/// Length of one point record on the wire
pub const POINT_LEN: usize = 18;

/// Length of the firmware version string returned by the `'v'` command
pub const VERSION_LEN: usize = 32;

/// Happy-path response byte
pub const ACK: u8 = b'a';

/// Tolerated NAK; does not invalidate the stream
pub const NAK_INVALID: u8 = b'I';

/// High bit of the point control word; applies a queued rate change
pub const RATE_CHANGE_BIT: u16 = 0x8000;

/// Playback state reported by the DAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DacState {
    #[default]
    Idle,
    Prepared,
    Playing,
    Invalid,
}

impl DacState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DacState::Idle,
            1 => DacState::Prepared,
            2 => DacState::Playing,
            _ => DacState::Invalid,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            DacState::Idle => 0,
            DacState::Prepared => 1,
            DacState::Playing => 2,
            DacState::Invalid => 3,
        }
    }
}

/// Status block embedded in every response (20 bytes)
///
/// The playback engine only consumes `playback_state`, `buffer_fullness`,
/// `point_rate` and `point_count`; the remaining fields are carried so the
/// block round-trips wire-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DacStatus {
    pub protocol: u8,
    pub light_engine_state: u8,
    pub playback_state: DacState,
    pub source: u8,
    pub light_engine_flags: u16,
    pub playback_flags: u16,
    pub source_flags: u16,
    /// Points currently in the DAC's on-device buffer
    pub buffer_fullness: u16,
    /// Current playback rate in points per second
    pub point_rate: u32,
    /// Total points played this session
    pub point_count: u32,
}

impl DacStatus {
    /// Decode a 20-byte status block.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < STATUS_LEN {
            return Err(ProtocolError::ConnectionFailed(format!(
                "short status block: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            protocol: buf.get_u8(),
            light_engine_state: buf.get_u8(),
            playback_state: DacState::from_u8(buf.get_u8()),
            source: buf.get_u8(),
            light_engine_flags: buf.get_u16_le(),
            playback_flags: buf.get_u16_le(),
            source_flags: buf.get_u16_le(),
            buffer_fullness: buf.get_u16_le(),
            point_rate: buf.get_u32_le(),
            point_count: buf.get_u32_le(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol);
        buf.put_u8(self.light_engine_state);
        buf.put_u8(self.playback_state.to_u8());
        buf.put_u8(self.source);
        buf.put_u16_le(self.light_engine_flags);
        buf.put_u16_le(self.playback_flags);
        buf.put_u16_le(self.source_flags);
        buf.put_u16_le(self.buffer_fullness);
        buf.put_u32_le(self.point_rate);
        buf.put_u32_le(self.point_count);
    }
}

/// One 22-byte response: response byte, echoed command byte, status block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacResponse {
    pub response: u8,
    pub command: u8,
    pub status: DacStatus,
}

impl DacResponse {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RESPONSE_LEN {
            return Err(ProtocolError::ConnectionFailed(format!(
                "short response: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            response: buf[0],
            command: buf[1],
            status: DacStatus::decode(&buf[2..])?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.response);
        buf.put_u8(self.command);
        self.status.encode(buf);
    }

    /// True for ACK and the tolerated NAK_INVALID; anything else is fatal
    /// for the connection.
    pub fn is_acceptable(&self) -> bool {
        self.response == ACK || self.response == NAK_INVALID
    }
}

/// Command framing
pub mod commands {
    use super::*;

    pub const PREPARE: u8 = b'p';
    pub const BEGIN: u8 = b'b';
    pub const QUEUE_RATE: u8 = b'q';
    pub const DATA: u8 = b'd';
    pub const VERSION: u8 = b'v';

    /// `'p'` - transitions IDLE to PREPARED.
    pub fn prepare() -> [u8; 1] {
        [PREPARE]
    }

    /// `'b'`, low-water u16 (always 0), rate u32 - starts playback.
    pub fn begin(rate: u32) -> [u8; 7] {
        let mut buf = [0u8; 7];
        let mut cursor = &mut buf[..];
        cursor.put_u8(BEGIN);
        cursor.put_u16_le(0);
        cursor.put_u32_le(rate);
        buf
    }

    /// `'q'`, rate u32 - queues a rate change applied by the next point
    /// carrying [`RATE_CHANGE_BIT`].
    pub fn queue_rate(rate: u32) -> [u8; 5] {
        let mut buf = [0u8; 5];
        let mut cursor = &mut buf[..];
        cursor.put_u8(QUEUE_RATE);
        cursor.put_u32_le(rate);
        buf
    }

    /// `'d'`, point count u16 - followed by `count × 18` point bytes.
    pub fn data_header(count: u16) -> [u8; 3] {
        let mut buf = [0u8; 3];
        let mut cursor = &mut buf[..];
        cursor.put_u8(DATA);
        cursor.put_u16_le(count);
        buf
    }

    pub fn version() -> [u8; 1] {
        [VERSION]
    }
}

/// Set the rate-change bit on the first point of a raw point payload.
///
/// The control word is a little-endian u16 at point offset 0, so the high
/// bit lives in the byte at offset 1.
pub fn mark_rate_change(points: &mut [u8]) {
    if points.len() >= POINT_LEN {
        points[1] |= 0x80;
    }
}
