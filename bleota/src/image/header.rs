//! Firmware header carried by the FW_HEADER command.
//!
//! ## Layout (44 bytes, little-endian)
//!
//! ```text
//! +--------+-----------------------+
//! | Offset | Field                 |
//! +--------+-----------------------+
//! |   0    | encrypted (u32)       |
//! |   4    | start_address (u32)   |
//! |   8    | length (u32)          |
//! |  12    | crc32 (u32)           |
//! |  16    | security_info_length  |
//! |  20    | reserved (12 bytes)   |
//! |  32    | version (u32)         |
//! |  36    | data_type (u32)       |
//! |  40    | storage_type (u32)    |
//! +--------+-----------------------+
//! ```

use crate::error::{Error, Result};
use crate::flash::StorageType;
use crate::protocol::crc::crc32;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 44;

/// Size of the reserved gap in the header.
pub const RESERVED_SIZE: usize = 12;

/// Kind of payload being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum DataType {
    /// Executable firmware image.
    #[default]
    Binary = 0,
    /// Opaque data blob.
    Data = 1,
}

impl DataType {
    /// Decode a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Binary),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Metadata describing an incoming image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareHeader {
    /// Image payload is encrypted (verification of that is external).
    pub encrypted: bool,
    /// Address the bootloader should install the image at.
    pub start_address: u32,
    /// Image length in bytes, including any security-info prefix.
    pub length: u32,
    /// Expected CRC-32 of the full image.
    pub crc32: u32,
    /// Bytes of security metadata prefixed to the image.
    pub security_info_length: u32,
    /// Monotonic image identifier.
    pub version: u32,
    /// Binary or data blob.
    pub data_type: DataType,
    /// Internal or external flash.
    pub storage_type: StorageType,
}

impl FirmwareHeader {
    /// Build a header describing `image`, with defaults for everything else.
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_image(image: &[u8]) -> Self {
        Self {
            encrypted: false,
            start_address: 0,
            // Safe cast: images are far below 4GB
            length: image.len() as u32,
            crc32: crc32(image),
            security_info_length: 0,
            version: 0,
            data_type: DataType::Binary,
            storage_type: StorageType::Internal,
        }
    }

    /// Set the version.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the install address.
    #[must_use]
    pub fn with_start_address(mut self, addr: u32) -> Self {
        self.start_address = addr;
        self
    }

    /// Set the storage type.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage_type = storage;
        self
    }

    /// Set the data type.
    #[must_use]
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Set the encrypted flag.
    #[must_use]
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Set the security-info prefix length.
    #[must_use]
    pub fn with_security_info_length(mut self, len: u32) -> Self {
        self.security_info_length = len;
        self
    }

    /// Read a header from a reader (44 bytes).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let encrypted = reader.read_u32::<LittleEndian>()?;
        let start_address = reader.read_u32::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;
        let crc32 = reader.read_u32::<LittleEndian>()?;
        let security_info_length = reader.read_u32::<LittleEndian>()?;

        let mut reserved = [0u8; RESERVED_SIZE];
        reader.read_exact(&mut reserved)?;

        let version = reader.read_u32::<LittleEndian>()?;
        let data_type = reader.read_u32::<LittleEndian>()?;
        let storage_type = reader.read_u32::<LittleEndian>()?;

        let data_type = DataType::from_u32(data_type)
            .ok_or_else(|| Error::InvalidHeader(format!("unknown data type {data_type}")))?;
        let storage_type = StorageType::from_u32(storage_type).ok_or_else(|| {
            Error::InvalidHeader(format!("unknown storage type {storage_type}"))
        })?;

        Ok(Self {
            encrypted: encrypted != 0,
            start_address,
            length,
            crc32,
            security_info_length,
            version,
            data_type,
            storage_type,
        })
    }

    /// Parse and validate a FW_HEADER payload.
    ///
    /// Trailing bytes beyond the 44-byte layout are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "payload too short ({} bytes, need {HEADER_SIZE})",
                payload.len()
            )));
        }

        let header = Self::read_from(&mut &payload[..HEADER_SIZE])?;
        header.validate()?;
        Ok(header)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.length == 0 {
            return Err(Error::InvalidHeader("image length is zero".into()));
        }
        if self.security_info_length > self.length {
            return Err(Error::InvalidHeader(format!(
                "security info ({} bytes) longer than image ({} bytes)",
                self.security_info_length, self.length
            )));
        }
        Ok(())
    }

    /// Encode the header.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<LittleEndian>(u32::from(self.encrypted))
            .unwrap();
        buf.write_u32::<LittleEndian>(self.start_address)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.length).unwrap();
        buf.write_u32::<LittleEndian>(self.crc32).unwrap();
        buf.write_u32::<LittleEndian>(self.security_info_length)
            .unwrap();
        buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
        buf.write_u32::<LittleEndian>(self.version).unwrap();
        buf.write_u32::<LittleEndian>(self.data_type as u32)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.storage_type as u32)
            .unwrap();

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Whether `other` describes the same transfer (resume detection).
    pub fn same_transfer(&self, other: &Self) -> bool {
        self.version == other.version && self.crc32 == other.crc32
    }

    /// Image length without the security-info prefix.
    pub fn image_length(&self) -> u32 {
        self.length - self.security_info_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FirmwareHeader {
        FirmwareHeader {
            encrypted: true,
            start_address: 0x0800_4000,
            length: 4096,
            crc32: 0xCAFE_BABE,
            security_info_length: 64,
            version: 7,
            data_type: DataType::Data,
            storage_type: StorageType::External,
        }
    }

    #[test]
    fn test_field_offsets() {
        let data = sample().to_bytes();
        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(&data[0..4], &1u32.to_le_bytes());
        assert_eq!(&data[4..8], &0x0800_4000u32.to_le_bytes());
        assert_eq!(&data[8..12], &4096u32.to_le_bytes());
        assert_eq!(&data[12..16], &0xCAFE_BABEu32.to_le_bytes());
        assert_eq!(&data[16..20], &64u32.to_le_bytes());
        assert_eq!(&data[20..32], &[0u8; 12]);
        assert_eq!(&data[32..36], &7u32.to_le_bytes());
        assert_eq!(&data[36..40], &1u32.to_le_bytes());
        assert_eq!(&data[40..44], &1u32.to_le_bytes());
    }

    #[test]
    fn test_parse_encoded() {
        let header = sample();
        assert_eq!(FirmwareHeader::parse(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_parse_ignores_reserved_and_trailing_bytes() {
        let mut data = sample().to_bytes().to_vec();
        data[20..32].copy_from_slice(&[0xAB; 12]);
        data.extend_from_slice(&[0xFF; 8]);
        assert_eq!(FirmwareHeader::parse(&data).unwrap(), sample());
    }

    #[test]
    fn test_parse_too_short() {
        let data = sample().to_bytes();
        assert!(matches!(
            FirmwareHeader::parse(&data[..43]),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_parse_unknown_storage_type() {
        let mut data = sample().to_bytes();
        data[40] = 9;
        assert!(matches!(
            FirmwareHeader::parse(&data),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_validate_zero_length() {
        let header = FirmwareHeader::for_image(&[]);
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_validate_security_info_too_long() {
        let header = FirmwareHeader::for_image(&[0; 16]).with_security_info_length(17);
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_for_image() {
        let image = b"firmware";
        let header = FirmwareHeader::for_image(image).with_version(3);
        assert_eq!(header.length, 8);
        assert_eq!(header.crc32, crc32(image));
        assert_eq!(header.version, 3);
        assert_eq!(header.storage_type, StorageType::Internal);
    }

    #[test]
    fn test_same_transfer() {
        let a = sample();
        let mut b = sample();
        b.start_address = 0;
        assert!(a.same_transfer(&b));
        b.version = 8;
        assert!(!a.same_transfer(&b));
    }

    #[test]
    fn test_image_length() {
        assert_eq!(sample().image_length(), 4032);
    }
}
