//! Flash abstraction for OTA staging storage.
//!
//! The engine never drives flash hardware directly. It talks to a
//! [`FlashRegion`], which exposes the handful of primitives a NOR flash
//! driver offers: sector erase, page program and page read, plus
//! enable/disable so the region can be held exclusively during a transfer.
//!
//! ```text
//! +------------------+
//! |  TransferSession |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  StagingBuffer   |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+     +------------------+
//! | FlashRegion trait| --> | internal / ext.  |
//! +------------------+     |   flash driver   |
//!                          +------------------+
//! ```

pub mod memory;
pub mod staging;

use crate::error::FlashError;
use std::fmt;

pub use memory::MemoryFlash;
pub use staging::StagingBuffer;

/// Which flash device an image is staged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum StorageType {
    /// On-chip flash.
    #[default]
    Internal = 0,
    /// External (e.g. SPI) flash.
    External = 1,
}

impl StorageType {
    /// Decode a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Internal),
            1 => Some(Self::External),
            _ => None,
        }
    }

    /// Get the storage type from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "internal" | "int" => Some(Self::Internal),
            "external" | "ext" => Some(Self::External),
            _ => None,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Physical layout of a flash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashGeometry {
    /// First address of the region.
    pub base: u32,
    /// Size of the region in bytes.
    pub size: u32,
    /// Program unit.
    pub page_size: u32,
    /// Erase unit.
    pub sector_size: u32,
}

impl FlashGeometry {
    /// Create a geometry.
    pub fn new(base: u32, size: u32, page_size: u32, sector_size: u32) -> Self {
        Self {
            base,
            size,
            page_size,
            sector_size,
        }
    }

    /// One past the last address of the region.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        addr >= self.base && u64::from(addr) + len as u64 <= self.end()
    }

    /// Whether `addr` sits on a page boundary.
    pub fn is_page_aligned(&self, addr: u32) -> bool {
        (addr - self.base) % self.page_size == 0
    }

    /// Whether `addr` sits on a sector boundary.
    pub fn is_sector_aligned(&self, addr: u32) -> bool {
        (addr - self.base) % self.sector_size == 0
    }

    /// Start of the page containing `addr`.
    pub fn page_base(&self, addr: u32) -> u32 {
        addr - (addr - self.base) % self.page_size
    }

    /// Start of the sector containing `addr`.
    pub fn sector_base(&self, addr: u32) -> u32 {
        addr - (addr - self.base) % self.sector_size
    }

    /// Check the geometry is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 || self.sector_size == 0 {
            return Err("page and sector size must be non-zero".into());
        }
        if self.sector_size % self.page_size != 0 {
            return Err(format!(
                "sector size {} is not a multiple of page size {}",
                self.sector_size, self.page_size
            ));
        }
        if self.size % self.sector_size != 0 {
            return Err(format!(
                "region size {:#x} is not a multiple of sector size {}",
                self.size, self.sector_size
            ));
        }
        if self.end() > u64::from(u32::MAX) + 1 {
            return Err("region extends past the 32-bit address space".into());
        }
        Ok(())
    }
}

/// A contiguous erase/program/read flash range.
///
/// Addresses are absolute. `write_page` and `read_page` operate on exactly one
/// page at a page-aligned address; `erase_sector` on one sector at a
/// sector-aligned address.
pub trait FlashRegion {
    /// Layout of this region.
    fn geometry(&self) -> FlashGeometry;

    /// Power up the driver.
    fn init(&mut self) -> Result<(), FlashError>;

    /// Power down the driver.
    fn deinit(&mut self);

    /// Acquire the region for erase/program.
    fn enable(&mut self) -> Result<(), FlashError>;

    /// Release the region.
    fn disable(&mut self);

    /// Whether the region is currently enabled.
    fn is_enabled(&self) -> bool;

    /// Erase the sector starting at `addr`.
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;

    /// Program one page at `addr`. `data` must be exactly one page.
    fn write_page(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read one page at `addr` into `buf` (exactly one page).
    fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase every sector overlapping `[addr, addr + len)`.
    fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        let geometry = self.geometry();
        if !geometry.contains(addr, len as usize) {
            return Err(FlashError::OutOfBounds {
                addr,
                len: len as usize,
            });
        }

        let end = u64::from(addr) + u64::from(len);
        let mut sector = geometry.sector_base(addr);
        while u64::from(sector) < end {
            self.erase_sector(sector)?;
            sector += geometry.sector_size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_names() {
        assert_eq!(StorageType::from_name("External"), Some(StorageType::External));
        assert_eq!(StorageType::from_name("int"), Some(StorageType::Internal));
        assert_eq!(StorageType::from_name("sd"), None);
        assert_eq!(StorageType::External.to_string(), "external");
    }

    #[test]
    fn test_geometry_alignment() {
        let g = FlashGeometry::new(0x1000, 0x4000, 256, 4096);
        assert!(g.is_page_aligned(0x1100));
        assert!(!g.is_page_aligned(0x1101));
        assert!(g.is_sector_aligned(0x2000));
        assert_eq!(g.page_base(0x11FF), 0x1100);
        assert_eq!(g.sector_base(0x2FFF), 0x2000);
    }

    #[test]
    fn test_geometry_contains() {
        let g = FlashGeometry::new(0x1000, 0x1000, 256, 4096);
        assert!(g.contains(0x1000, 0x1000));
        assert!(!g.contains(0x1000, 0x1001));
        assert!(!g.contains(0x0FFF, 1));
    }

    #[test]
    fn test_geometry_validate() {
        assert!(FlashGeometry::new(0, 0x10000, 256, 4096).validate().is_ok());
        assert!(FlashGeometry::new(0, 0x10000, 300, 4096).validate().is_err());
        assert!(FlashGeometry::new(0, 0x10100, 256, 4096).validate().is_err());
        assert!(FlashGeometry::new(0, 0x10000, 0, 4096).validate().is_err());
    }

    #[test]
    fn test_erase_range_covers_partial_sectors() {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0, 0x4000, 256, 0x1000));
        flash.enable().unwrap();
        flash.erase_range(0x0800, 0x1000).unwrap();
        assert_eq!(flash.erase_count(), 2);
    }
}
