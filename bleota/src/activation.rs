//! Activation descriptor handed to the bootloader.
//!
//! After a successful verify the engine records where the new image lives and
//! how to check it. The bootloader reads this record on the next boot and
//! installs the image.
//!
//! ## Layout (32 bytes, little-endian)
//!
//! ```text
//! +--------+------------------------+
//! | Offset | Field                  |
//! +--------+------------------------+
//! |   0    | link_address           |
//! |   4    | image_address          |
//! |   8    | image_length           |
//! |  12    | image_crc              |
//! |  16    | security_info_pointer  |
//! |  20    | options                |
//! |  24    | magic ("DATO")         |
//! |  28    | self_crc (bytes 0..28) |
//! +--------+------------------------+
//! ```

use crate::error::{Error, FlashError, Result};
use crate::flash::{FlashRegion, StorageType};
use crate::image::header::{DataType, FirmwareHeader};
use crate::protocol::crc::crc32;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info};

/// Encoded descriptor size in bytes.
pub const DESCRIPTOR_SIZE: usize = 32;

/// Magic value identifying a descriptor.
pub const DESCRIPTOR_MAGIC: u32 = 0x4F54_4144;

/// Image is staged in external flash.
pub const OPTION_EXTERNAL_FLASH: u32 = 1 << 0;
/// Image is a data blob rather than executable firmware.
pub const OPTION_DATA: u32 = 1 << 1;
/// Image payload is encrypted.
pub const OPTION_ENCRYPTED: u32 = 1 << 2;

/// Where the bootloader finds a verified image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActivationDescriptor {
    /// Address the image is linked for.
    pub link_address: u32,
    /// Address of the image proper, after the security-info prefix.
    pub image_address: u32,
    /// Image length without the security-info prefix.
    pub image_length: u32,
    /// CRC-32 of the full staged image.
    pub image_crc: u32,
    /// Address of the security-info prefix, or 0 when there is none.
    pub security_info_pointer: u32,
    /// `OPTION_*` bits.
    pub options: u32,
}

impl ActivationDescriptor {
    /// Describe an image staged at `base` according to `header`.
    pub fn from_header(header: &FirmwareHeader, base: u32) -> Self {
        let mut options = 0;
        if header.storage_type == StorageType::External {
            options |= OPTION_EXTERNAL_FLASH;
        }
        if header.data_type == DataType::Data {
            options |= OPTION_DATA;
        }
        if header.encrypted {
            options |= OPTION_ENCRYPTED;
        }

        Self {
            link_address: header.start_address,
            image_address: base + header.security_info_length,
            image_length: header.image_length(),
            image_crc: header.crc32,
            security_info_pointer: if header.security_info_length > 0 {
                base
            } else {
                0
            },
            options,
        }
    }

    /// Storage the image was staged in.
    pub fn storage_type(&self) -> StorageType {
        if self.options & OPTION_EXTERNAL_FLASH != 0 {
            StorageType::External
        } else {
            StorageType::Internal
        }
    }

    /// Whether the data-blob option is set.
    pub fn is_data(&self) -> bool {
        self.options & OPTION_DATA != 0
    }

    /// Whether the encrypted option is set.
    pub fn is_encrypted(&self) -> bool {
        self.options & OPTION_ENCRYPTED != 0
    }

    /// Encode, including magic and self-CRC.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = Vec::with_capacity(DESCRIPTOR_SIZE);
        buf.write_u32::<LittleEndian>(self.link_address).unwrap();
        buf.write_u32::<LittleEndian>(self.image_address).unwrap();
        buf.write_u32::<LittleEndian>(self.image_length).unwrap();
        buf.write_u32::<LittleEndian>(self.image_crc).unwrap();
        buf.write_u32::<LittleEndian>(self.security_info_pointer)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.options).unwrap();
        buf.write_u32::<LittleEndian>(DESCRIPTOR_MAGIC).unwrap();
        let self_crc = crc32(&buf);
        buf.write_u32::<LittleEndian>(self_crc).unwrap();

        let mut out = [0u8; DESCRIPTOR_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode and validate a descriptor.
    ///
    /// Fails if fewer than 32 bytes are given, the magic is wrong (including
    /// erased flash), or the self-CRC does not match.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DESCRIPTOR_SIZE {
            return Err(Error::InvalidDescriptor(format!(
                "need {DESCRIPTOR_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let mut reader = &data[..DESCRIPTOR_SIZE];
        let link_address = reader.read_u32::<LittleEndian>()?;
        let image_address = reader.read_u32::<LittleEndian>()?;
        let image_length = reader.read_u32::<LittleEndian>()?;
        let image_crc = reader.read_u32::<LittleEndian>()?;
        let security_info_pointer = reader.read_u32::<LittleEndian>()?;
        let options = reader.read_u32::<LittleEndian>()?;
        let magic = reader.read_u32::<LittleEndian>()?;
        let self_crc = reader.read_u32::<LittleEndian>()?;

        if magic != DESCRIPTOR_MAGIC {
            return Err(Error::InvalidDescriptor(format!(
                "bad magic {magic:#010x}"
            )));
        }

        let actual = crc32(&data[..DESCRIPTOR_SIZE - 4]);
        if actual != self_crc {
            return Err(Error::CrcMismatch {
                expected: self_crc,
                actual,
            });
        }

        Ok(Self {
            link_address,
            image_address,
            image_length,
            image_crc,
            security_info_pointer,
            options,
        })
    }
}

/// Persists descriptors at a fixed flash address.
///
/// Writing goes through a read-modify-write of every sector the descriptor
/// touches, so unrelated data sharing those sectors is preserved.
#[derive(Debug, Clone, Copy)]
pub struct ActivationWriter {
    address: u32,
}

impl ActivationWriter {
    /// Create a writer for descriptors stored at `address`.
    pub fn new(address: u32) -> Self {
        Self { address }
    }

    /// Descriptor address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Write `descriptor` into `flash`.
    ///
    /// The region is enabled for the duration of the write if it was not
    /// already, and returned to its previous state afterwards.
    pub fn persist<F: FlashRegion + ?Sized>(
        &self,
        flash: &mut F,
        descriptor: &ActivationDescriptor,
    ) -> std::result::Result<(), FlashError> {
        let geometry = flash.geometry();
        if !geometry.contains(self.address, DESCRIPTOR_SIZE) {
            return Err(FlashError::OutOfBounds {
                addr: self.address,
                len: DESCRIPTOR_SIZE,
            });
        }

        let was_enabled = flash.is_enabled();
        if !was_enabled {
            flash.enable()?;
        }

        let encoded = descriptor.encode();
        let result = self.patch_sectors(flash, &encoded);

        if !was_enabled {
            flash.disable();
        }

        match &result {
            Ok(()) => info!(
                "Activation descriptor written at {:#010x} (image {:#010x}, {} bytes)",
                self.address, descriptor.image_address, descriptor.image_length
            ),
            Err(e) => error!("Writing activation descriptor failed: {e}"),
        }
        result
    }

    #[allow(clippy::cast_possible_truncation)]
    fn patch_sectors<F: FlashRegion + ?Sized>(
        &self,
        flash: &mut F,
        encoded: &[u8; DESCRIPTOR_SIZE],
    ) -> std::result::Result<(), FlashError> {
        let geometry = flash.geometry();
        let sector_size = geometry.sector_size as usize;
        let page_size = geometry.page_size as usize;
        let mut scratch = vec![0u8; sector_size];
        let mut readback = vec![0u8; page_size];

        // Safe cast: the descriptor is 32 bytes
        let end = self.address + DESCRIPTOR_SIZE as u32;
        let mut sector = geometry.sector_base(self.address);

        while sector < end {
            for (i, page) in scratch.chunks_mut(page_size).enumerate() {
                flash.read_page(sector + (i * page_size) as u32, page)?;
            }

            // Patch the part of the descriptor that falls into this sector.
            let sector_end = sector + geometry.sector_size;
            let from = self.address.max(sector);
            let to = end.min(sector_end);
            let src = (from - self.address) as usize;
            let dst = (from - sector) as usize;
            let n = (to - from) as usize;
            scratch[dst..dst + n].copy_from_slice(&encoded[src..src + n]);

            debug!("Rewriting sector {sector:#010x} for activation descriptor");
            flash.erase_sector(sector)?;
            for (i, page) in scratch.chunks(page_size).enumerate() {
                let addr = sector + (i * page_size) as u32;
                flash.write_page(addr, page)?;
                flash.read_page(addr, &mut readback)?;
                if readback != page {
                    return Err(FlashError::ReadbackMismatch { addr });
                }
            }

            sector = sector_end;
        }
        Ok(())
    }

    /// Read and validate the descriptor currently stored in `flash`.
    pub fn read<F: FlashRegion + ?Sized>(&self, flash: &mut F) -> Result<ActivationDescriptor> {
        let geometry = flash.geometry();
        if !geometry.contains(self.address, DESCRIPTOR_SIZE) {
            return Err(FlashError::OutOfBounds {
                addr: self.address,
                len: DESCRIPTOR_SIZE,
            }
            .into());
        }

        let page_size = geometry.page_size;
        let mut page = vec![0u8; page_size as usize];
        let mut bytes = Vec::with_capacity(DESCRIPTOR_SIZE + page.len());
        let first = geometry.page_base(self.address);
        let skip = (self.address - first) as usize;

        let mut addr = first;
        while bytes.len() < skip + DESCRIPTOR_SIZE {
            flash.read_page(addr, &mut page)?;
            bytes.extend_from_slice(&page);
            addr += page_size;
        }
        ActivationDescriptor::decode(&bytes[skip..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::memory::ERASED;
    use crate::flash::{FlashGeometry, MemoryFlash};

    fn header() -> FirmwareHeader {
        FirmwareHeader::for_image(&[0x5A; 4096])
            .with_start_address(0x0801_0000)
            .with_version(2)
    }

    #[test]
    fn test_from_header_plain() {
        let desc = ActivationDescriptor::from_header(&header(), 0x4_0000);
        assert_eq!(desc.link_address, 0x0801_0000);
        assert_eq!(desc.image_address, 0x4_0000);
        assert_eq!(desc.image_length, 4096);
        assert_eq!(desc.image_crc, header().crc32);
        assert_eq!(desc.security_info_pointer, 0);
        assert_eq!(desc.options, 0);
        assert_eq!(desc.storage_type(), StorageType::Internal);
    }

    #[test]
    fn test_from_header_with_security_prefix() {
        let h = header()
            .with_security_info_length(256)
            .with_storage(StorageType::External)
            .with_data_type(DataType::Data)
            .with_encrypted(true);
        let desc = ActivationDescriptor::from_header(&h, 0x10_0000);
        assert_eq!(desc.image_address, 0x10_0100);
        assert_eq!(desc.image_length, 3840);
        assert_eq!(desc.security_info_pointer, 0x10_0000);
        assert_eq!(
            desc.options,
            OPTION_EXTERNAL_FLASH | OPTION_DATA | OPTION_ENCRYPTED
        );
        assert!(desc.is_data());
        assert!(desc.is_encrypted());
    }

    #[test]
    fn test_encode_layout() {
        let desc = ActivationDescriptor::from_header(&header(), 0x4_0000);
        let data = desc.encode();
        assert_eq!(&data[0..4], &0x0801_0000u32.to_le_bytes());
        assert_eq!(&data[4..8], &0x4_0000u32.to_le_bytes());
        assert_eq!(&data[8..12], &4096u32.to_le_bytes());
        assert_eq!(&data[24..28], &DESCRIPTOR_MAGIC.to_le_bytes());
        assert_eq!(&data[28..32], &crc32(&data[..28]).to_le_bytes());
        assert_eq!(ActivationDescriptor::decode(&data).unwrap(), desc);
    }

    #[test]
    fn test_decode_rejects_erased_flash() {
        assert!(matches!(
            ActivationDescriptor::decode(&[ERASED; DESCRIPTOR_SIZE]),
            Err(Error::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_self_crc() {
        let mut data = ActivationDescriptor::from_header(&header(), 0).encode();
        data[8] ^= 0x01;
        assert!(matches!(
            ActivationDescriptor::decode(&data),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_persist_preserves_neighbours() {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0, 0x2000, 64, 0x400));
        let neighbours: Vec<u8> = (0..0x400u32).map(|i| (i % 251) as u8).collect();
        flash.load(0x400, &neighbours).unwrap();

        let writer = ActivationWriter::new(0x440);
        let desc = ActivationDescriptor::from_header(&header(), 0x1000);
        writer.persist(&mut flash, &desc).unwrap();

        assert_eq!(flash.slice(0x440, DESCRIPTOR_SIZE), &desc.encode());
        assert_eq!(flash.slice(0x400, 0x40), &neighbours[..0x40]);
        assert_eq!(flash.slice(0x460, 0x3A0), &neighbours[0x60..]);
        assert_eq!(flash.erase_count(), 1);
        // Writer restores the disabled state.
        assert!(!flash.is_enabled());
        assert_eq!(writer.read(&mut flash).unwrap(), desc);
    }

    #[test]
    fn test_persist_overwrites_previous_descriptor() {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0, 0x1000, 64, 0x400));
        let writer = ActivationWriter::new(0x800);

        let first = ActivationDescriptor::from_header(&header(), 0x100);
        writer.persist(&mut flash, &first).unwrap();
        let second = ActivationDescriptor::from_header(&header().with_version(3), 0x200);
        writer.persist(&mut flash, &second).unwrap();

        assert_eq!(writer.read(&mut flash).unwrap(), second);
    }

    #[test]
    fn test_persist_spanning_sectors() {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0, 0x1000, 16, 64));
        let writer = ActivationWriter::new(0x30);
        let desc = ActivationDescriptor::from_header(&header(), 0x800);
        writer.persist(&mut flash, &desc).unwrap();

        assert_eq!(flash.erase_count(), 2);
        assert_eq!(writer.read(&mut flash).unwrap(), desc);
    }

    #[test]
    fn test_persist_erase_failure() {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0, 0x1000, 64, 0x400));
        flash.fail_erase_at(0x800);
        let writer = ActivationWriter::new(0x800);
        let desc = ActivationDescriptor::from_header(&header(), 0);

        assert_eq!(
            writer.persist(&mut flash, &desc),
            Err(FlashError::EraseFailed { addr: 0x800 })
        );
        assert!(!flash.is_enabled());
    }

    #[test]
    fn test_read_empty_slot() {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0, 0x1000, 64, 0x400));
        assert!(ActivationWriter::new(0x800).read(&mut flash).is_err());
    }
}
