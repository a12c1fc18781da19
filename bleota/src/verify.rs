//! Streaming image checksum.
//!
//! The verifier is fed in two ways: incrementally with every accepted data
//! packet (so the session always knows the CRC of what it has accepted), and
//! from flash by re-reading a written range page by page (the authoritative
//! check before activation).

use crate::error::FlashError;
use crate::flash::FlashRegion;
use crate::protocol::crc::crc32_digest;
use crc::Digest;
use log::debug;

/// Running CRC-32 accumulator.
#[derive(Clone)]
pub struct ImageVerifier {
    digest: Digest<'static, u32>,
    processed: u64,
}

impl ImageVerifier {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self {
            digest: crc32_digest(),
            processed: 0,
        }
    }

    /// Forget everything accumulated so far.
    pub fn reset(&mut self) {
        self.digest = crc32_digest();
        self.processed = 0;
    }

    /// Fold `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.processed += data.len() as u64;
    }

    /// Number of bytes folded in.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// CRC-32 of everything folded in so far.
    pub fn value(&self) -> u32 {
        self.digest.clone().finalize()
    }

    /// Fold `len` bytes of flash starting at `addr` into the checksum,
    /// reading one page at a time.
    pub fn update_from_flash<F: FlashRegion + ?Sized>(
        &mut self,
        flash: &mut F,
        addr: u32,
        len: u32,
    ) -> Result<(), FlashError> {
        let geometry = flash.geometry();
        if !geometry.contains(addr, len as usize) {
            return Err(FlashError::OutOfBounds {
                addr,
                len: len as usize,
            });
        }

        let page_size = geometry.page_size;
        let mut page = vec![0u8; page_size as usize];
        let mut page_addr = geometry.page_base(addr);
        let mut skip = (addr - page_addr) as usize;
        let mut remaining = len as usize;

        while remaining > 0 {
            flash.read_page(page_addr, &mut page)?;
            let take = (page.len() - skip).min(remaining);
            self.update(&page[skip..skip + take]);
            remaining -= take;
            skip = 0;
            page_addr += page_size;
        }
        Ok(())
    }

    /// CRC-32 of `len` bytes of flash starting at `addr`.
    pub fn checksum_region<F: FlashRegion + ?Sized>(
        flash: &mut F,
        addr: u32,
        len: u32,
    ) -> Result<u32, FlashError> {
        let mut verifier = Self::new();
        verifier.update_from_flash(flash, addr, len)?;
        let crc = verifier.value();
        debug!("CRC-32 of {len} bytes at {addr:#010x}: {crc:#010x}");
        Ok(crc)
    }
}

impl Default for ImageVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ImageVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageVerifier")
            .field("processed", &self.processed)
            .field("value", &format_args!("{:#010x}", self.value()))
            .finish()
    }
}
