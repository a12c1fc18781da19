//! # bleota
//!
//! Device-side firmware-over-the-air update engine for BLE products.
//!
//! The engine receives a firmware image from a peer in small write
//! fragments, reassembles them into CRC-protected packets, stages the data
//! into flash page by page, verifies the finished image and records an
//! activation descriptor for the bootloader. It includes:
//!
//! - Fragment reassembly and packet framing
//! - A resumable transfer state machine
//! - Page staging with program read-back
//! - CRC-32 image verification
//! - Activation descriptor encoding and persistence
//! - Status replies and the disconnect/reset sequence
//!
//! The radio stack and the flash driver are supplied by the host through the
//! [`Transport`] and [`FlashRegion`] traits. [`MemoryFlash`] is a RAM-backed
//! NOR model for tests and host-side simulation.
//!
//! ## Features
//!
//! - `serde`: Serialization support for configuration and data types
//!
//! ## Example
//!
//! ```rust
//! use bleota::{
//!     FirmwareHeader, FlashGeometry, MemoryFlash, OtaConfig, OtaEngine, RecordingTransport,
//!     RegionLayout, UpdateClient,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let flash = MemoryFlash::new(FlashGeometry::new(0, 0x8000, 256, 0x1000));
//!     let config = OtaConfig::new(RegionLayout::new(0x1000, 0x4000))
//!         .with_descriptor_address(0x7000);
//!     let mut device = OtaEngine::new(config, flash, None, RecordingTransport::new())?;
//!
//!     let image = vec![0x5A; 4096];
//!     let header = FirmwareHeader::for_image(&image).with_version(1);
//!     let client = UpdateClient::new(&image, header)?;
//!
//!     let packet = client.header_packet();
//!     for fragment in client.fragments(&packet) {
//!         device.on_fragment(0, fragment)?;
//!     }
//!     assert_eq!(device.transport().replies.len(), 1);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activation;
pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod flash;
pub mod image;
pub mod protocol;
pub mod session;
pub mod timer;
pub mod transport;
pub mod verify;

// Re-exports for convenience
pub use {
    activation::{ActivationDescriptor, ActivationWriter},
    channel::ReplyChannel,
    client::UpdateClient,
    config::{OtaConfig, RegionLayout, ResumePolicy},
    engine::OtaEngine,
    error::{Error, FlashError, FrameError, Result},
    flash::{FlashGeometry, FlashRegion, MemoryFlash, StagingBuffer, StorageType},
    image::{DataType, FirmwareHeader},
    protocol::{Command, ConnectionId, Frame, Packet, PacketFramer, Reply, Status},
    session::{SessionState, TransferSession},
    timer::OneShot,
    transport::{RecordingTransport, Transport},
    verify::ImageVerifier,
};
