//! Page staging buffer.
//!
//! Incoming data rarely lines up with flash pages: a packet may end mid-page,
//! and the next one continues where it left off. The staging buffer collects
//! bytes until a whole page is available, programs it, and reads it back to
//! confirm the write. The final page of an image is programmed even if short;
//! its tail keeps whatever the buffer already held.

use crate::error::FlashError;
use crate::flash::FlashRegion;
use log::{error, trace};

/// One-page write-behind buffer.
#[derive(Debug, Clone)]
pub struct StagingBuffer {
    page: Vec<u8>,
    readback: Vec<u8>,
    // Page contents before the first flush of a `write`, for rollback.
    rollback: Vec<u8>,
    fill: usize,
    region_start: u32,
}

impl StagingBuffer {
    /// Create an empty buffer for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page: vec![0; page_size],
            readback: vec![0; page_size],
            rollback: vec![0; page_size],
            fill: 0,
            region_start: 0,
        }
    }

    /// Prepare for a new session writing into a region starting at
    /// `region_start`. The page buffer is zeroed.
    pub fn reset(&mut self, page_size: usize, region_start: u32) {
        self.page.clear();
        self.page.resize(page_size, 0);
        self.readback.resize(page_size, 0);
        self.rollback.resize(page_size, 0);
        self.fill = 0;
        self.region_start = region_start;
    }

    /// Page size this buffer stages.
    pub fn page_size(&self) -> usize {
        self.page.len()
    }

    /// Bytes held but not yet programmed.
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// The bytes held but not yet programmed.
    pub fn staged(&self) -> &[u8] {
        &self.page[..self.fill]
    }

    /// Stage `bytes` destined for `dest`, programming every page that fills.
    ///
    /// `dest` must directly follow the previously staged bytes. When
    /// `is_last` is set, a partially filled page is programmed as well.
    ///
    /// On error the buffer is restored to its state before the call, so the
    /// caller can retry with the same data.
    ///
    /// # Panics
    ///
    /// Panics if the derived page address is not page-aligned or lies before
    /// the region start; both indicate broken offset tracking in the caller.
    pub fn write<F: FlashRegion + ?Sized>(
        &mut self,
        flash: &mut F,
        dest: u32,
        bytes: &[u8],
        is_last: bool,
    ) -> Result<(), FlashError> {
        let saved_fill = self.fill;
        let total = self.fill + bytes.len();
        // Without a flush nothing can fail and bytes past `fill` are free to
        // overwrite, so only a programming call needs the snapshot.
        let flushes = total >= self.page.len() || (is_last && total > 0);
        if flushes {
            self.rollback.copy_from_slice(&self.page);
        }

        let result = self.stage(flash, dest, bytes, is_last);
        if result.is_err() {
            self.fill = saved_fill;
            self.page.copy_from_slice(&self.rollback);
        }
        result
    }

    #[allow(clippy::cast_possible_truncation)]
    fn stage<F: FlashRegion + ?Sized>(
        &mut self,
        flash: &mut F,
        dest: u32,
        bytes: &[u8],
        is_last: bool,
    ) -> Result<(), FlashError> {
        let geometry = flash.geometry();
        let page_size = self.page.len();

        // Safe cast: fill is bounded by the page size
        let page_addr = dest.checked_sub(self.fill as u32);
        assert!(
            page_addr.is_some_and(|a| a >= self.region_start && geometry.is_page_aligned(a)),
            "staging write at {dest:#010x} with {} bytes staged is misaligned or before {:#010x}",
            self.fill,
            self.region_start
        );
        let mut page_addr = page_addr.unwrap_or_default();

        let mut remaining = bytes;
        while !remaining.is_empty() {
            let n = (page_size - self.fill).min(remaining.len());
            self.page[self.fill..self.fill + n].copy_from_slice(&remaining[..n]);
            self.fill += n;
            remaining = &remaining[n..];

            if self.fill == page_size {
                self.flush(flash, page_addr)?;
                page_addr += page_size as u32;
                self.fill = 0;
            }
        }

        if is_last && self.fill > 0 {
            self.flush(flash, page_addr)?;
            self.fill = 0;
        }

        Ok(())
    }

    fn flush<F: FlashRegion + ?Sized>(&mut self, flash: &mut F, addr: u32) -> Result<(), FlashError> {
        trace!("Flushing page {addr:#010x} ({} bytes staged)", self.fill);

        flash.write_page(addr, &self.page).inspect_err(|e| {
            error!("Page program at {addr:#010x} failed: {e}");
        })?;
        flash.read_page(addr, &mut self.readback)?;

        if self.readback != self.page {
            error!("Read-back mismatch at {addr:#010x}");
            return Err(FlashError::ReadbackMismatch { addr });
        }
        Ok(())
    }
}
