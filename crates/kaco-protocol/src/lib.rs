//! Frame codec for the KACO RS485 ASCII protocol.
//!
//! Queries look like `#01 0\r` without the space: a `#`, the two digit bus
//! address, one command byte and a carriage return. Replies start with
//! `\n*`, repeat address and command, and carry either fixed-width fields
//! protected by a one byte sum (legacy inverters) or variable-width fields
//! protected by a CRC-16/X-25 in hex (generic protocol).

use crc::{Crc, CRC_16_IBM_SDLC};
use thiserror::Error;

mod fields;
mod models;
mod query;
mod response;

pub use models::resolve_model_name;
pub use query::{decode_query, encode, QueryFrame, MAX_PAYLOAD_LEN};
pub use response::{decode, LegacyLayout, ResponseBody, ResponseFrame, GENERIC_ELEMENT_COUNT};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("cannot encode frame: {0}")]
    Encoding(String),
    #[error("expected checksum {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("unexpected end-of-frame")]
    FrameTooShort,
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Command byte shared by queries and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `0`: current readings.
    Readings,
    /// `1`..`3`: readings of one unit of a three-unit (000xi) inverter.
    Unit(u8),
    /// `4`: reply telling the master to query the units separately.
    UnitsFollow,
    /// `n`: readings in the generic protocol.
    Generic,
    /// `s`: serial number.
    SerialNumber,
}

impl Command {
    pub const UNIT_COUNT: u8 = 3;

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Readings => b'0',
            Command::Unit(index) => b'0'.wrapping_add(index),
            Command::UnitsFollow => b'4',
            Command::Generic => b'n',
            Command::SerialNumber => b's',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            b'0' => Ok(Command::Readings),
            b'1'..=b'3' => Ok(Command::Unit(byte - b'0')),
            b'4' => Ok(Command::UnitsFollow),
            b'n' => Ok(Command::Generic),
            b's' => Ok(Command::SerialNumber),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }

    fn is_valid(self) -> bool {
        match self {
            Command::Unit(index) => (1..=Self::UNIT_COUNT).contains(&index),
            _ => true,
        }
    }
}

/// One byte sum used by legacy frames.
pub fn legacy_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// CRC-16/X-25 used by generic-protocol frames.
pub fn crc16_x25(bytes: &[u8]) -> u16 {
    X25.checksum(bytes)
}
