//! Status replies sent from the device to the peer.
//!
//! ## Reply Format
//!
//! ```text
//! +---------+-----+--------+-----------+
//! | Length  | CMD | STATUS |   Data    |
//! +---------+-----+--------+-----------+
//! | 2 bytes | 1   | 1      | 0..16     |
//! +---------+-----+--------+-----------+
//! ```
//!
//! `Length` is little-endian and counts CMD + STATUS + Data.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Largest data section a reply may carry so it fits one notification.
pub const MAX_REPLY_PAYLOAD: usize = 16;

/// Size of the reply header (length + command + status).
pub const REPLY_HEADER_SIZE: usize = 4;

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Command accepted.
    Success = 0,
    /// Packet or image checksum mismatch.
    CrcError = 1,
    /// FW_HEADER payload malformed.
    InvalidHeaderInfo = 2,
    /// Packet length invalid or write beyond the image.
    InvalidPacketLength = 3,
    /// Packet larger than the reassembly buffer.
    InsufficientBuffer = 4,
    /// Image does not fit the OTA area.
    InsufficientFlash = 5,
    /// Unclassified failure.
    UnknownError = 6,
    /// Flash erase/program/read-back failure.
    FlashWriteError = 7,
}

impl Status {
    /// Decode a status byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::CrcError),
            2 => Some(Self::InvalidHeaderInfo),
            3 => Some(Self::InvalidPacketLength),
            4 => Some(Self::InsufficientBuffer),
            5 => Some(Self::InsufficientFlash),
            6 => Some(Self::UnknownError),
            7 => Some(Self::FlashWriteError),
            _ => None,
        }
    }

    /// Whether this is [`Status::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::CrcError => "CRC error",
            Self::InvalidHeaderInfo => "invalid header info",
            Self::InvalidPacketLength => "invalid packet length",
            Self::InsufficientBuffer => "insufficient buffer",
            Self::InsufficientFlash => "insufficient flash",
            Self::UnknownError => "unknown error",
            Self::FlashWriteError => "flash write error",
        };
        f.write_str(name)
    }
}

/// A decoded (or to-be-encoded) status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Command byte this reply answers.
    pub command: u8,
    /// Outcome.
    pub status: Status,
    /// Optional data, at most [`MAX_REPLY_PAYLOAD`] bytes.
    pub payload: Vec<u8>,
}

impl Reply {
    /// Create a reply.
    pub fn new(command: u8, status: Status, payload: &[u8]) -> Self {
        Self {
            command,
            status,
            payload: payload.to_vec(),
        }
    }

    /// Encode the reply.
    ///
    /// # Panics
    ///
    /// Panics if the payload exceeds [`MAX_REPLY_PAYLOAD`]; the protocol never
    /// produces such replies.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        assert!(
            self.payload.len() <= MAX_REPLY_PAYLOAD,
            "reply payload of {} bytes does not fit a notification",
            self.payload.len()
        );
        let mut buf = Vec::with_capacity(REPLY_HEADER_SIZE + self.payload.len());
        buf.write_u16::<LittleEndian>((2 + self.payload.len()) as u16)
            .unwrap();
        buf.push(self.command);
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a reply as received by the peer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < REPLY_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "reply too short ({} bytes)",
                data.len()
            )));
        }

        let len = u16::from_le_bytes([data[0], data[1]]) as usize;
        if len < 2 || data.len() != 2 + len {
            return Err(Error::Protocol(format!(
                "reply length field {len} does not match {} received bytes",
                data.len()
            )));
        }

        let status = Status::from_u8(data[3])
            .ok_or_else(|| Error::Protocol(format!("unknown status code {}", data[3])))?;

        Ok(Self {
            command: data[2],
            status,
            payload: data[REPLY_HEADER_SIZE..].to_vec(),
        })
    }

    /// Interpret the payload as a little-endian u32 (offset or CRC replies).
    pub fn value_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for code in 0..=7u8 {
            let status = Status::from_u8(code).unwrap();
            assert_eq!(status as u8, code);
        }
        assert_eq!(Status::from_u8(8), None);
        assert!(Status::Success.is_success());
        assert!(!Status::CrcError.is_success());
    }

    #[test]
    fn test_reply_layout() {
        let data = Reply::new(2, Status::Success, &512u32.to_le_bytes()).encode();
        assert_eq!(data, vec![0x06, 0x00, 0x02, 0x00, 0x00, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = Reply::new(1, Status::InsufficientFlash, &[0xDE, 0xAD]);
        assert_eq!(Reply::decode(&reply.encode()).unwrap(), reply);

        let empty = Reply::new(4, Status::Success, &[]);
        assert_eq!(Reply::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(Reply::decode(&[0x02, 0x00, 0x01]).is_err());
        assert!(Reply::decode(&[0x05, 0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        assert!(Reply::decode(&[0x02, 0x00, 0x01, 0x09]).is_err());
    }

    #[test]
    fn test_value_u32() {
        let reply = Reply::new(2, Status::Success, &4096u32.to_le_bytes());
        assert_eq!(reply.value_u32(), Some(4096));
        assert_eq!(Reply::new(2, Status::Success, &[1]).value_u32(), None);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_oversized_payload_panics() {
        let _ = Reply::new(2, Status::Success, &[0; MAX_REPLY_PAYLOAD + 1]).encode();
    }
}
