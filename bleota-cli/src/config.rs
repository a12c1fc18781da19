//! Configuration file support for bleota.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BLEOTA_*)
//! 3. Local config file (./bleota.toml)
//! 4. Global config file (~/.config/bleota/config.toml)
//!
//! ```toml
//! [device.internal]
//! size = 0x80000
//! page_size = 256
//! sector_size = 4096
//! ota_base = 0x40000
//! ota_max_size = 0x3F000
//!
//! [device]
//! descriptor_address = 0x7F000
//! resume_policy = "verify"
//!
//! [transfer]
//! mtu = 244
//! chunk_size = 512
//! ```

use anyhow::{Result, bail};
use bleota::{FlashGeometry, OtaConfig, RegionLayout, ResumePolicy};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default internal flash size of the simulated device.
const DEFAULT_INTERNAL_SIZE: u32 = 0x0008_0000;
/// Default external flash size of the simulated device.
const DEFAULT_EXTERNAL_SIZE: u32 = 0x0040_0000;
/// Default external flash base address.
const DEFAULT_EXTERNAL_BASE: u32 = 0x1000_0000;
/// Default program unit.
const DEFAULT_PAGE_SIZE: u32 = 256;
/// Default erase unit.
const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// One flash region of the simulated device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionConfig {
    /// First address of the region.
    pub base: Option<u32>,
    /// Region size in bytes.
    pub size: Option<u32>,
    /// Program unit.
    pub page_size: Option<u32>,
    /// Erase unit.
    pub sector_size: Option<u32>,
    /// Start of the OTA area.
    pub ota_base: Option<u32>,
    /// Largest image the OTA area accepts.
    pub ota_max_size: Option<u32>,
}

impl RegionConfig {
    fn merge(&mut self, other: Self) {
        if other.base.is_some() {
            self.base = other.base;
        }
        if other.size.is_some() {
            self.size = other.size;
        }
        if other.page_size.is_some() {
            self.page_size = other.page_size;
        }
        if other.sector_size.is_some() {
            self.sector_size = other.sector_size;
        }
        if other.ota_base.is_some() {
            self.ota_base = other.ota_base;
        }
        if other.ota_max_size.is_some() {
            self.ota_max_size = other.ota_max_size;
        }
    }

    fn geometry(&self, default_base: u32, default_size: u32) -> FlashGeometry {
        FlashGeometry::new(
            self.base.unwrap_or(default_base),
            self.size.unwrap_or(default_size),
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            self.sector_size.unwrap_or(DEFAULT_SECTOR_SIZE),
        )
    }
}

/// Simulated device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Internal flash.
    #[serde(default)]
    pub internal: RegionConfig,
    /// External flash, if the device has one.
    pub external: Option<RegionConfig>,
    /// Activation descriptor address.
    pub descriptor_address: Option<u32>,
    /// Largest declared packet length.
    pub max_packet_size: Option<usize>,
    /// Delay before closing the link after FW_RESET.
    pub disconnect_delay_ms: Option<u64>,
    /// Delay before rebooting after the link closed.
    pub reset_delay_ms: Option<u64>,
    /// "verify" or "trust".
    pub resume_policy: Option<String>,
}

impl DeviceConfig {
    /// Geometry of the internal flash.
    pub fn internal_geometry(&self) -> FlashGeometry {
        self.internal.geometry(0, DEFAULT_INTERNAL_SIZE)
    }

    /// Geometry of the external flash, if configured.
    pub fn external_geometry(&self) -> Option<FlashGeometry> {
        self.external
            .as_ref()
            .map(|ext| ext.geometry(DEFAULT_EXTERNAL_BASE, DEFAULT_EXTERNAL_SIZE))
    }

    /// Descriptor address with defaults applied.
    pub fn descriptor_address(&self) -> u32 {
        self.descriptor_address
            .unwrap_or(OtaConfig::default().descriptor_address)
    }

    /// Build the engine configuration.
    pub fn ota_config(&self) -> Result<OtaConfig> {
        let defaults = OtaConfig::default();

        let internal = RegionLayout::new(
            self.internal
                .ota_base
                .unwrap_or(defaults.internal.ota_base),
            self.internal
                .ota_max_size
                .unwrap_or(defaults.internal.ota_max_size),
        );
        let mut config = OtaConfig::new(internal)
            .with_descriptor_address(self.descriptor_address())
            .with_max_packet_size(
                self.max_packet_size
                    .unwrap_or(defaults.max_packet_size),
            );

        if let (Some(ext), Some(geometry)) = (&self.external, self.external_geometry()) {
            config = config.with_external(RegionLayout::new(
                ext.ota_base.unwrap_or(geometry.base),
                ext.ota_max_size.unwrap_or(geometry.size),
            ));
        }
        if let Some(ms) = self.disconnect_delay_ms {
            config = config.with_disconnect_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.reset_delay_ms {
            config = config.with_reset_delay(Duration::from_millis(ms));
        }
        if let Some(policy) = &self.resume_policy {
            config = config.with_resume_policy(parse_resume_policy(policy)?);
        }
        Ok(config)
    }

    fn merge(&mut self, other: Self) {
        self.internal.merge(other.internal);
        match (&mut self.external, other.external) {
            (Some(ext), Some(other)) => ext.merge(other),
            (None, Some(other)) => self.external = Some(other),
            (_, None) => {},
        }
        if other.descriptor_address.is_some() {
            self.descriptor_address = other.descriptor_address;
        }
        if other.max_packet_size.is_some() {
            self.max_packet_size = other.max_packet_size;
        }
        if other.disconnect_delay_ms.is_some() {
            self.disconnect_delay_ms = other.disconnect_delay_ms;
        }
        if other.reset_delay_ms.is_some() {
            self.reset_delay_ms = other.reset_delay_ms;
        }
        if other.resume_policy.is_some() {
            self.resume_policy = other.resume_policy;
        }
    }
}

/// Transfer defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Fragment size.
    pub mtu: Option<usize>,
    /// FW_DATA payload size.
    pub chunk_size: Option<usize>,
    /// Image version placed in the header.
    pub version: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Simulated device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Transfer defaults.
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Parse a resume policy name.
pub fn parse_resume_policy(name: &str) -> Result<ResumePolicy> {
    match name.to_lowercase().as_str() {
        "verify" => Ok(ResumePolicy::Verify),
        "trust" => Ok(ResumePolicy::Trust),
        other => bail!("unknown resume policy '{other}' (expected 'verify' or 'trust')"),
    }
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("bleota.toml")) {
            debug!("Loaded local config from bleota.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bleota").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        self.device.merge(other.device);

        if other.transfer.mtu.is_some() {
            self.transfer.mtu = other.transfer.mtu;
        }
        if other.transfer.chunk_size.is_some() {
            self.transfer.chunk_size = other.transfer.chunk_size;
        }
        if other.transfer.version.is_some() {
            self.transfer.version = other.transfer.version;
        }
    }
}
