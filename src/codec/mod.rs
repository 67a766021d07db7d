//! MQTT wire codec
//!
//! Pure functions between bytes and [`Packet`](crate::protocol::Packet):
//! fixed header framing, variable byte integers, length-prefixed strings
//! and the per-packet layouts for v3.1.1 and v5.0.

mod decode;
mod encode;
mod template;


pub use decode::Decoder;
pub use encode::Encoder;
pub use template::PublishTemplate;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Largest value a variable byte integer can carry (256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default limit on a single inbound packet
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Fixed header of a complete frame sitting at the front of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub first_byte: u8,
    /// Bytes taken by the type byte plus the remaining-length field
    pub header_len: usize,
    pub remaining_len: usize,
}

impl FrameHeader {
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_len
    }
}

/// Locate the next complete frame.
///
/// `Ok(None)` means more bytes are needed. The claimed remaining length is
/// checked against `max_packet_size` before the body has arrived so an
/// oversized claim is rejected without buffering it.
pub fn peek_frame(buf: &[u8], max_packet_size: usize) -> Result<Option<FrameHeader>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (remaining, len_bytes) = match read_variable_int(&buf[1..]) {
        Ok(r) => r,
        Err(DecodeError::InsufficientData) => return Ok(None),
        Err(e) => return Err(e),
    };
    if remaining as usize > max_packet_size {
        return Err(DecodeError::PacketTooLarge);
    }
    let header = FrameHeader {
        first_byte: buf[0],
        header_len: 1 + len_bytes,
        remaining_len: remaining as usize,
    };
    if buf.len() < header.frame_len() {
        return Ok(None);
    }
    Ok(Some(header))
}

/// Read a variable byte integer: 7 bits per byte, low group first,
/// high bit set on every byte but the last. Returns (value, bytes used).
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;
    let mut shift = 0;

    for (i, byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }

    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Write a variable byte integer. Returns bytes written.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            return Ok(count);
        }
    }
}

#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [a, b, ..] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(DecodeError::InsufficientData),
    }
}

#[inline]
pub fn read_u32(buf: &[u8]) -> Result<u32, DecodeError> {
    match buf {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Read a length-prefixed binary field. Returns (data, bytes used).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let end = 2 + len;
    if buf.len() < end {
        return Err(DecodeError::InsufficientData);
    }
    Ok((&buf[2..end], end))
}

/// Read a length-prefixed UTF-8 string. Null characters are rejected.
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, used) = read_binary(buf)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains null character"));
    }
    Ok((s, used))
}

#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
