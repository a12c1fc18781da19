//! Engine configuration.

use crate::activation::DESCRIPTOR_SIZE;
use crate::error::{Error, Result};
use crate::flash::{FlashGeometry, StorageType};
use crate::image::header::HEADER_SIZE;
use crate::protocol::framer::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::packet::MIN_DECLARED_LENGTH;
use std::time::Duration;

/// Default delay between the FW_RESET reply and closing the link.
pub const DEFAULT_DISCONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Default delay between closing the link and rebooting.
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(200);

/// The part of a flash region set aside for incoming images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionLayout {
    /// Start of the OTA area. Must be sector-aligned.
    pub ota_base: u32,
    /// Largest image the area accepts.
    pub ota_max_size: u32,
}

impl RegionLayout {
    /// Create a layout.
    pub fn new(ota_base: u32, ota_max_size: u32) -> Self {
        Self {
            ota_base,
            ota_max_size,
        }
    }

    /// Whether an image of `length` bytes fits.
    pub fn fits(&self, length: u32) -> bool {
        length <= self.ota_max_size
    }

    fn validate(&self, name: StorageType, geometry: &FlashGeometry) -> Result<()> {
        geometry
            .validate()
            .map_err(|e| Error::Config(format!("{name} flash: {e}")))?;
        if self.ota_max_size == 0 {
            return Err(Error::Config(format!("{name} OTA area is empty")));
        }
        if !geometry.contains(self.ota_base, self.ota_max_size as usize) {
            return Err(Error::Config(format!(
                "{name} OTA area {:#010x}+{:#x} is outside the flash region",
                self.ota_base, self.ota_max_size
            )));
        }
        if !geometry.is_sector_aligned(self.ota_base) {
            return Err(Error::Config(format!(
                "{name} OTA base {:#010x} is not sector-aligned",
                self.ota_base
            )));
        }
        Ok(())
    }
}

/// How a re-sent identical header is treated mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ResumePolicy {
    /// Re-read what was already programmed and compare it with the running
    /// checksum; restart from zero on mismatch.
    #[default]
    Verify,
    /// Continue from the recorded offset without checking flash.
    Trust,
}

/// OTA engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OtaConfig {
    /// OTA area in internal flash.
    pub internal: RegionLayout,
    /// OTA area in external flash, if the device has one.
    pub external: Option<RegionLayout>,
    /// Address of the activation descriptor in internal flash.
    pub descriptor_address: u32,
    /// Largest declared packet length accepted by the framer.
    pub max_packet_size: usize,
    /// Delay between the FW_RESET reply and closing the link.
    pub disconnect_delay: Duration,
    /// Delay between closing the link and rebooting.
    pub reset_delay: Duration,
    /// Resume handling.
    pub resume_policy: ResumePolicy,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            internal: RegionLayout::new(0x0004_0000, 0x0003_F000),
            external: None,
            descriptor_address: 0x0007_F000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            disconnect_delay: DEFAULT_DISCONNECT_DELAY,
            reset_delay: DEFAULT_RESET_DELAY,
            resume_policy: ResumePolicy::default(),
        }
    }
}

impl OtaConfig {
    /// Create a configuration with the given internal OTA area.
    pub fn new(internal: RegionLayout) -> Self {
        Self {
            internal,
            ..Self::default()
        }
    }

    /// Set the external OTA area.
    #[must_use]
    pub fn with_external(mut self, layout: RegionLayout) -> Self {
        self.external = Some(layout);
        self
    }

    /// Set the descriptor address.
    #[must_use]
    pub fn with_descriptor_address(mut self, addr: u32) -> Self {
        self.descriptor_address = addr;
        self
    }

    /// Set the maximum packet size.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the disconnect delay.
    #[must_use]
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    /// Set the reset delay.
    #[must_use]
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Set the resume policy.
    #[must_use]
    pub fn with_resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.resume_policy = policy;
        self
    }

    /// OTA area for `storage`, if configured.
    pub fn layout(&self, storage: StorageType) -> Option<&RegionLayout> {
        match storage {
            StorageType::Internal => Some(&self.internal),
            StorageType::External => self.external.as_ref(),
        }
    }

    /// Check the configuration against the flash it will drive.
    pub fn validate(
        &self,
        internal: &FlashGeometry,
        external: Option<&FlashGeometry>,
    ) -> Result<()> {
        self.internal.validate(StorageType::Internal, internal)?;

        match (&self.external, external) {
            (Some(layout), Some(geometry)) => {
                layout.validate(StorageType::External, geometry)?;
            }
            (Some(_), None) => {
                return Err(Error::Config(
                    "external OTA area configured without external flash".into(),
                ));
            }
            (None, _) => {}
        }

        self.validate_descriptor(internal)?;

        let min = MIN_DECLARED_LENGTH + HEADER_SIZE;
        if self.max_packet_size < min || self.max_packet_size > usize::from(u16::MAX) {
            return Err(Error::Config(format!(
                "max packet size {} must be between {min} and {}",
                self.max_packet_size,
                u16::MAX
            )));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn validate_descriptor(&self, internal: &FlashGeometry) -> Result<()> {
        let addr = self.descriptor_address;
        if !internal.contains(addr, DESCRIPTOR_SIZE) {
            return Err(Error::Config(format!(
                "descriptor address {addr:#010x} is outside internal flash"
            )));
        }

        // The descriptor sectors are rewritten whole, so they must not share
        // a sector with the internal OTA area.
        let sector = u64::from(internal.sector_size);
        let desc_start = u64::from(internal.sector_base(addr));
        // Safe cast: the descriptor is 32 bytes
        let desc_end = u64::from(internal.sector_base(addr + DESCRIPTOR_SIZE as u32 - 1)) + sector;
        let ota_start = u64::from(self.internal.ota_base);
        let ota_end = (ota_start + u64::from(self.internal.ota_max_size)).div_ceil(sector) * sector;

        if desc_start < ota_end && ota_start < desc_end {
            return Err(Error::Config(format!(
                "descriptor at {addr:#010x} shares a sector with the internal OTA area"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal() -> FlashGeometry {
        FlashGeometry::new(0, 0x8_0000, 256, 0x1000)
    }

    #[test]
    fn test_default_is_valid() {
        OtaConfig::default().validate(&internal(), None).unwrap();
    }

    #[test]
    fn test_builders() {
        let config = OtaConfig::new(RegionLayout::new(0x1000, 0x2000))
            .with_external(RegionLayout::new(0, 0x10_0000))
            .with_descriptor_address(0x7_F000)
            .with_resume_policy(ResumePolicy::Trust)
            .with_reset_delay(Duration::from_millis(50));
        assert_eq!(config.internal.ota_base, 0x1000);
        assert_eq!(config.layout(StorageType::External).map(|l| l.ota_max_size), Some(0x10_0000));
        assert_eq!(config.resume_policy, ResumePolicy::Trust);
        assert_eq!(config.reset_delay, Duration::from_millis(50));
        assert_eq!(config.disconnect_delay, DEFAULT_DISCONNECT_DELAY);
    }

    #[test]
    fn test_layout_without_external() {
        assert!(OtaConfig::default().layout(StorageType::External).is_none());
    }

    #[test]
    fn test_rejects_area_outside_flash() {
        let config = OtaConfig::new(RegionLayout::new(0x7_0000, 0x2_0000));
        assert!(matches!(
            config.validate(&internal(), None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unaligned_base() {
        let config = OtaConfig::new(RegionLayout::new(0x4_0100, 0x1000));
        assert!(config.validate(&internal(), None).is_err());
    }

    #[test]
    fn test_rejects_descriptor_in_ota_sector() {
        // OTA area ends mid-sector; the descriptor lives in that sector.
        let config = OtaConfig::new(RegionLayout::new(0x4_0000, 0x800))
            .with_descriptor_address(0x4_0C00);
        assert!(config.validate(&internal(), None).is_err());

        let config = config.with_descriptor_address(0x4_1000);
        assert!(config.validate(&internal(), None).is_ok());
    }

    #[test]
    fn test_rejects_external_layout_without_flash() {
        let config = OtaConfig::default().with_external(RegionLayout::new(0, 0x1000));
        assert!(config.validate(&internal(), None).is_err());

        let external = FlashGeometry::new(0, 0x40_0000, 256, 0x1000);
        assert!(config.validate(&internal(), Some(&external)).is_ok());
    }

    #[test]
    fn test_rejects_tiny_packets() {
        let config = OtaConfig::default().with_max_packet_size(16);
        assert!(config.validate(&internal(), None).is_err());
    }
}
