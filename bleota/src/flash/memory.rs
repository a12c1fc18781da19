//! RAM-backed NOR flash model.
//!
//! Behaves like a NOR device: erase sets every byte of a sector to `0xFF`,
//! programming can only clear bits (the stored byte becomes `old & new`).
//! Faults can be injected per page or sector to exercise error paths.

use crate::error::FlashError;
use crate::flash::{FlashGeometry, FlashRegion};
use log::trace;
use std::collections::HashSet;

/// Value of an erased byte.
pub const ERASED: u8 = 0xFF;

/// In-memory flash region.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    geometry: FlashGeometry,
    data: Vec<u8>,
    initialized: bool,
    enabled: bool,
    fail_program: HashSet<u32>,
    fail_erase: HashSet<u32>,
    corrupt_read: HashSet<u32>,
    erase_count: usize,
    program_count: usize,
    read_count: usize,
}

impl MemoryFlash {
    /// Create a fully erased region.
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            geometry,
            data: vec![ERASED; geometry.size as usize],
            initialized: false,
            enabled: false,
            fail_program: HashSet::new(),
            fail_erase: HashSet::new(),
            corrupt_read: HashSet::new(),
            erase_count: 0,
            program_count: 0,
            read_count: 0,
        }
    }

    /// Raw view of the whole region.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Raw view of `[addr, addr + len)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the region.
    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        assert!(self.geometry.contains(addr, len), "slice out of bounds");
        let start = (addr - self.geometry.base) as usize;
        &self.data[start..start + len]
    }

    /// Overwrite bytes directly, bypassing NOR semantics (preloading content).
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FlashError> {
        self.check_bounds(addr, bytes.len())?;
        let start = (addr - self.geometry.base) as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Make every program of the page at `addr` fail.
    pub fn fail_program_at(&mut self, addr: u32) {
        self.fail_program.insert(self.geometry.page_base(addr));
    }

    /// Make every erase of the sector at `addr` fail.
    pub fn fail_erase_at(&mut self, addr: u32) {
        self.fail_erase.insert(self.geometry.sector_base(addr));
    }

    /// Flip a bit in every read of the page at `addr`.
    pub fn corrupt_readback_at(&mut self, addr: u32) {
        self.corrupt_read.insert(self.geometry.page_base(addr));
    }

    /// Remove all injected faults.
    pub fn clear_faults(&mut self) {
        self.fail_program.clear();
        self.fail_erase.clear();
        self.corrupt_read.clear();
    }

    /// Number of successful sector erases.
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    /// Number of successful page programs.
    pub fn program_count(&self) -> usize {
        self.program_count
    }

    /// Number of page reads.
    pub fn read_count(&self) -> usize {
        self.read_count
    }

    /// Whether the driver is powered up.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn check_bounds(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        if self.geometry.contains(addr, len) {
            Ok(())
        } else {
            Err(FlashError::OutOfBounds { addr, len })
        }
    }

    fn check_page(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        self.check_bounds(addr, len)?;
        if !self.geometry.is_page_aligned(addr) {
            return Err(FlashError::Misaligned {
                addr,
                align: self.geometry.page_size,
            });
        }
        if len != self.geometry.page_size as usize {
            return Err(FlashError::OutOfBounds { addr, len });
        }
        Ok(())
    }
}

impl FlashRegion for MemoryFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn init(&mut self) -> Result<(), FlashError> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.enabled = false;
        self.initialized = false;
    }

    fn enable(&mut self) -> Result<(), FlashError> {
        self.initialized = true;
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if !self.enabled {
            return Err(FlashError::Disabled);
        }
        self.check_bounds(addr, self.geometry.sector_size as usize)?;
        if !self.geometry.is_sector_aligned(addr) {
            return Err(FlashError::Misaligned {
                addr,
                align: self.geometry.sector_size,
            });
        }
        if self.fail_erase.contains(&addr) {
            return Err(FlashError::EraseFailed { addr });
        }

        trace!("erase sector {addr:#010x}");
        let start = (addr - self.geometry.base) as usize;
        let end = start + self.geometry.sector_size as usize;
        self.data[start..end].fill(ERASED);
        self.erase_count += 1;
        Ok(())
    }

    fn write_page(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if !self.enabled {
            return Err(FlashError::Disabled);
        }
        self.check_page(addr, data.len())?;
        if self.fail_program.contains(&addr) {
            return Err(FlashError::ProgramFailed { addr });
        }

        trace!("program page {addr:#010x}");
        let start = (addr - self.geometry.base) as usize;
        for (cell, byte) in self.data[start..start + data.len()]
            .iter_mut()
            .zip(data)
        {
            *cell &= *byte;
        }
        self.program_count += 1;
        Ok(())
    }

    fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_page(addr, buf.len())?;

        let start = (addr - self.geometry.base) as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        if self.corrupt_read.contains(&addr) {
            buf[0] ^= 0x01;
        }
        self.read_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flash() -> MemoryFlash {
        let mut flash = MemoryFlash::new(FlashGeometry::new(0x1000, 0x2000, 16, 64));
        flash.enable().unwrap();
        flash
    }

    #[test]
    fn test_starts_erased() {
        let flash = flash();
        assert!(flash.contents().iter().all(|&b| b == ERASED));
    }

    #[test]
    fn test_program_and_read() {
        let mut flash = flash();
        let page: Vec<u8> = (0..16).collect();
        flash.write_page(0x1010, &page).unwrap();

        let mut buf = [0u8; 16];
        flash.read_page(0x1010, &mut buf).unwrap();
        assert_eq!(buf.to_vec(), page);
        assert_eq!(flash.program_count(), 1);
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = flash();
        flash.write_page(0x1000, &[0xF0; 16]).unwrap();
        flash.write_page(0x1000, &[0x3C; 16]).unwrap();
        assert_eq!(flash.slice(0x1000, 16), &[0x30; 16]);

        flash.erase_sector(0x1000).unwrap();
        assert_eq!(flash.slice(0x1000, 16), &[ERASED; 16]);
    }

    #[test]
    fn test_disabled_rejects_writes() {
        let mut flash = flash();
        flash.disable();
        assert_eq!(flash.write_page(0x1000, &[0; 16]), Err(FlashError::Disabled));
        assert_eq!(flash.erase_sector(0x1000), Err(FlashError::Disabled));
    }

    #[test]
    fn test_alignment_and_bounds() {
        let mut flash = flash();
        assert!(matches!(
            flash.write_page(0x1001, &[0; 16]),
            Err(FlashError::Misaligned { .. })
        ));
        assert!(matches!(
            flash.write_page(0x3000, &[0; 16]),
            Err(FlashError::OutOfBounds { .. })
        ));
        assert!(matches!(
            flash.erase_sector(0x1010),
            Err(FlashError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_injected_faults() {
        let mut flash = flash();
        flash.fail_program_at(0x1025);
        assert_eq!(
            flash.write_page(0x1020, &[0; 16]),
            Err(FlashError::ProgramFailed { addr: 0x1020 })
        );

        flash.corrupt_readback_at(0x1030);
        let mut buf = [0u8; 16];
        flash.read_page(0x1030, &mut buf).unwrap();
        assert_eq!(buf[0], 0xFE);

        flash.fail_erase_at(0x1040);
        assert_eq!(
            flash.erase_sector(0x1040),
            Err(FlashError::EraseFailed { addr: 0x1040 })
        );

        flash.clear_faults();
        flash.write_page(0x1020, &[0; 16]).unwrap();
    }
}
