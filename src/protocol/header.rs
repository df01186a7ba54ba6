//! Fixed header layout and remaining-length encoding
//!
//! The transport's frame codec owns full packet encode/decode; this module
//! pins down the one byte of layout both sides must agree on (bit 3 = DUP,
//! bits 2-1 = QoS, bit 0 = RETAIN, bits 7-4 = type code) and the 1-4 byte
//! variable-length remaining-length integer.

use bytes::{BufMut, BytesMut};

use super::{ProtocolError, QoS};

/// Maximum remaining length: 4 bytes of 7 data bits each
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Decoded fixed-header flag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Message type code (bits 7-4)
    pub type_code: u8,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl FixedHeader {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        let type_code = byte >> 4;
        if type_code == 0 || type_code > 14 {
            return Err(ProtocolError::InvalidTypeCode(type_code));
        }
        // QoS value 3 is reserved
        let qos = QoS::from_u8((byte >> 1) & 0x03).ok_or(ProtocolError::InvalidQoS(3))?;
        Ok(Self {
            type_code,
            dup: (byte & 0x08) != 0,
            qos,
            retain: (byte & 0x01) != 0,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.type_code << 4)
            | ((self.dup as u8) << 3)
            | ((self.qos as u8) << 1)
            | (self.retain as u8)
    }
}

/// Read a remaining-length variable integer
/// Returns (value, bytes_consumed)
#[inline]
pub fn read_remaining_length(buf: &[u8]) -> Result<(u32, usize), ProtocolError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(ProtocolError::InsufficientData);
        }
        if pos >= 4 {
            return Err(ProtocolError::InvalidRemainingLength);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a remaining-length variable integer
/// Returns bytes written
#[inline]
pub fn write_remaining_length(buf: &mut BytesMut, mut value: u32) -> Result<usize, ProtocolError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Number of bytes a remaining-length value encodes to
#[inline]
pub fn remaining_length_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}
