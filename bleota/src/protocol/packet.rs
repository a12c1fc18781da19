//! OTA request packets.
//!
//! ## Packet Format
//!
//! ```text
//! +---------+-----+---------------+--------+
//! | Length  | CMD |    Payload    | CRC32  |
//! +---------+-----+---------------+--------+
//! | 2 bytes | 1   |   variable    | 4 bytes|
//! +---------+-----+---------------+--------+
//! ```
//!
//! `Length` is little-endian and counts CMD + payload + CRC32, but not
//! itself. The CRC32 covers CMD + payload.

use crate::image::header::FirmwareHeader;
use crate::protocol::crc::crc32;
use byteorder::{LittleEndian, WriteBytesExt};

/// Size of the length prefix.
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Size of the command byte.
pub const COMMAND_SIZE: usize = 1;

/// Size of the trailing checksum.
pub const CRC_SIZE: usize = 4;

/// Minimum bytes a first fragment must carry (length prefix + command).
pub const MIN_HEADER_SIZE: usize = LENGTH_FIELD_SIZE + COMMAND_SIZE;

/// Smallest legal value of the length field (command + CRC, empty payload).
pub const MIN_DECLARED_LENGTH: usize = COMMAND_SIZE + CRC_SIZE;

/// OTA command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Firmware header, starts or resumes a transfer.
    FwHeader = 1,
    /// A slice of image data.
    FwData = 2,
    /// Verify the complete image and activate it.
    FwVerify = 3,
    /// Disconnect and reboot the device.
    FwReset = 4,
}

impl Command {
    /// Decode a command byte. Unknown codes yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::FwHeader),
            2 => Some(Self::FwData),
            3 => Some(Self::FwVerify),
            4 => Some(Self::FwReset),
            _ => None,
        }
    }

    /// Wire code of this command.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Request packet builder.
#[derive(Debug, Clone)]
pub struct Packet {
    command: u8,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet with an empty payload.
    pub fn new(command: Command) -> Self {
        Self::raw(command.code(), Vec::new())
    }

    /// Create a packet with an arbitrary command byte (used to probe peers).
    pub fn raw(command: u8, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Build a FW_HEADER packet.
    pub fn header(header: &FirmwareHeader) -> Self {
        Self::raw(Command::FwHeader.code(), header.to_bytes().to_vec())
    }

    /// Build a FW_DATA packet.
    pub fn data(chunk: &[u8]) -> Self {
        Self::raw(Command::FwData.code(), chunk.to_vec())
    }

    /// Build a FW_VERIFY packet.
    pub fn verify() -> Self {
        Self::new(Command::FwVerify)
    }

    /// Build a FW_RESET packet.
    pub fn reset() -> Self {
        Self::new(Command::FwReset)
    }

    /// Command byte.
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode the complete packet.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let declared = COMMAND_SIZE + self.payload.len() + CRC_SIZE;
        let mut buf = Vec::with_capacity(LENGTH_FIELD_SIZE + declared);

        // Length - safe cast, packets are bounded far below 64KB
        buf.write_u16::<LittleEndian>(declared as u16).unwrap();

        buf.push(self.command);
        buf.extend_from_slice(&self.payload);

        let crc = crc32(&buf[LENGTH_FIELD_SIZE..]);
        buf.write_u32::<LittleEndian>(crc).unwrap();

        buf
    }
}

/// Split an encoded packet into transport fragments of at most `mtu` bytes.
///
/// # Panics
///
/// Panics if `mtu` is zero.
pub fn fragment(packet: &[u8], mtu: usize) -> impl Iterator<Item = &[u8]> {
    assert!(mtu > 0, "MTU must be non-zero");
    packet.chunks(mtu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::FwHeader.code(), 1);
        assert_eq!(Command::FwData.code(), 2);
        assert_eq!(Command::FwVerify.code(), 3);
        assert_eq!(Command::FwReset.code(), 4);
        assert_eq!(Command::from_u8(3), Some(Command::FwVerify));
        assert_eq!(Command::from_u8(0), None);
        assert_eq!(Command::from_u8(0x42), None);
    }

    #[test]
    fn test_empty_packet_layout() {
        let data = Packet::verify().build();
        // len(2) + cmd(1) + crc(4)
        assert_eq!(data.len(), 7);
        assert_eq!(&data[0..2], &[0x05, 0x00]);
        assert_eq!(data[2], 3);
        let crc = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
        assert_eq!(crc, crc32(&[3]));
    }

    #[test]
    fn test_length_field_excludes_itself() {
        let data = Packet::data(&[0xAA; 100]).build();
        let declared = u16::from_le_bytes([data[0], data[1]]) as usize;
        assert_eq!(declared, data.len() - LENGTH_FIELD_SIZE);
        assert_eq!(declared, 105);
    }

    #[test]
    fn test_crc_covers_command_and_payload() {
        let data = Packet::data(&[1, 2, 3]).build();
        let crc = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        assert_eq!(crc, crc32(&[2, 1, 2, 3]));
    }

    #[test]
    fn test_fragment_sizes() {
        let data = Packet::data(&[0x55; 50]).build();
        let sizes: Vec<usize> = fragment(&data, 20).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![20, 20, 17]);
    }
}
