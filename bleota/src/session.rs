//! Transfer state machine.
//!
//! ```text
//!            FW_HEADER (fresh)              FW_DATA
//!   +------+ -----------------> +----------------+ <--+
//!   | Idle |                    | ReceivingImage |    |
//!   +------+ <----------------- +----------------+ ---+
//!      ^      FW_VERIFY (any outcome)   |  FW_HEADER (same version+crc)
//!      |                                |  -> resume at current offset
//!      +--------------------------------+
//!         FW_HEADER that does not fit
//! ```
//!
//! FW_RESET is accepted in either state. Commands that are unknown or not
//! valid in the current state are dropped without a reply.

use crate::activation::{ActivationDescriptor, ActivationWriter};
use crate::channel::ReplyChannel;
use crate::config::{OtaConfig, ResumePolicy};
use crate::error::Result;
use crate::flash::{FlashRegion, StagingBuffer, StorageType};
use crate::image::header::FirmwareHeader;
use crate::protocol::packet::Command;
use crate::protocol::reply::Status;
use crate::transport::Transport;
use crate::verify::ImageVerifier;
use log::{debug, error, info, trace, warn};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No transfer in progress.
    #[default]
    Idle,
    /// A header was accepted and data is being written.
    ReceivingImage,
}

/// One update attempt and the flash it writes to.
#[derive(Debug)]
pub struct TransferSession<F: FlashRegion> {
    config: OtaConfig,
    internal: F,
    external: Option<F>,
    state: SessionState,
    header: Option<FirmwareHeader>,
    storage: StorageType,
    base_address: u32,
    write_offset: u32,
    staging: StagingBuffer,
    verifier: ImageVerifier,
    activation: ActivationWriter,
    descriptor: Option<ActivationDescriptor>,
}

fn select<'a, F>(
    internal: &'a mut F,
    external: &'a mut Option<F>,
    storage: StorageType,
) -> Option<&'a mut F> {
    match storage {
        StorageType::Internal => Some(internal),
        StorageType::External => external.as_mut(),
    }
}

impl<F: FlashRegion> TransferSession<F> {
    /// Create an idle session.
    ///
    /// The configuration is validated against the flash geometries and both
    /// regions are initialised.
    pub fn new(config: OtaConfig, mut internal: F, mut external: Option<F>) -> Result<Self> {
        let external_geometry = external.as_ref().map(FlashRegion::geometry);
        config.validate(&internal.geometry(), external_geometry.as_ref())?;

        internal.init()?;
        if let Some(flash) = external.as_mut() {
            flash.init()?;
        }

        let page_size = internal.geometry().page_size as usize;
        let activation = ActivationWriter::new(config.descriptor_address);
        Ok(Self {
            config,
            internal,
            external,
            state: SessionState::Idle,
            header: None,
            storage: StorageType::Internal,
            base_address: 0,
            write_offset: 0,
            staging: StagingBuffer::new(page_size),
            verifier: ImageVerifier::new(),
            activation,
            descriptor: None,
        })
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Header of the transfer in progress.
    pub fn header(&self) -> Option<&FirmwareHeader> {
        self.header.as_ref()
    }

    /// Bytes accepted so far.
    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Address the image is being written to.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Storage the current transfer targets.
    pub fn storage(&self) -> StorageType {
        self.storage
    }

    /// Configuration in use.
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// The flash region for `storage`, if present.
    pub fn region(&self, storage: StorageType) -> Option<&F> {
        match storage {
            StorageType::Internal => Some(&self.internal),
            StorageType::External => self.external.as_ref(),
        }
    }

    /// The flash region for `storage`, mutably.
    pub fn region_mut(&mut self, storage: StorageType) -> Option<&mut F> {
        select(&mut self.internal, &mut self.external, storage)
    }

    /// Descriptor written by the last successful verify.
    pub fn last_descriptor(&self) -> Option<&ActivationDescriptor> {
        self.descriptor.as_ref()
    }

    /// Consume the session, shutting down both flash drivers.
    ///
    /// Any transfer in progress is abandoned.
    pub fn into_regions(mut self) -> (F, Option<F>) {
        self.abort();
        self.internal.deinit();
        if let Some(flash) = self.external.as_mut() {
            flash.deinit();
        }
        (self.internal, self.external)
    }

    /// Handle one complete packet.
    ///
    /// Errors are only returned when a reply could not be delivered; protocol
    /// failures are reported to the peer as status codes.
    pub fn dispatch<T: Transport>(
        &mut self,
        command: u8,
        payload: &[u8],
        channel: &mut ReplyChannel<T>,
    ) -> Result<()> {
        let Some(cmd) = Command::from_u8(command) else {
            debug!("Dropping unknown command {command:#04x}");
            return Ok(());
        };

        debug!(
            "Dispatching {cmd:?} ({} bytes) in state {:?}",
            payload.len(),
            self.state
        );
        match (cmd, self.state) {
            (Command::FwHeader, _) => self.on_header(payload, channel),
            (Command::FwData, SessionState::ReceivingImage) => self.on_data(payload, channel),
            (Command::FwVerify, SessionState::ReceivingImage) => self.on_verify(channel),
            (Command::FwReset, _) => {
                channel.reply(cmd.code(), Status::Success, &[])?;
                channel.schedule_reset();
                Ok(())
            }
            (cmd, state) => {
                debug!("Dropping {cmd:?}: not valid in state {state:?}");
                Ok(())
            }
        }
    }

    /// The link dropped. The flash is released; header and offset are kept so
    /// the same transfer can resume on the next connection.
    pub fn on_disconnect(&mut self) {
        if self.state == SessionState::ReceivingImage {
            info!(
                "Link lost at offset {} of {}, transfer can be resumed",
                self.write_offset,
                self.header.map_or(0, |h| h.length)
            );
            if let Some(flash) = self.region_mut(self.storage) {
                flash.disable();
            }
        }
    }

    /// Abandon any transfer and return to idle.
    pub fn abort(&mut self) {
        if self.state == SessionState::ReceivingImage {
            warn!("Abandoning transfer at offset {}", self.write_offset);
        }
        self.finish();
    }

    fn on_header<T: Transport>(
        &mut self,
        payload: &[u8],
        channel: &mut ReplyChannel<T>,
    ) -> Result<()> {
        let code = Command::FwHeader.code();
        let header = match FirmwareHeader::parse(payload) {
            Ok(header) => header,
            Err(e) => {
                warn!("Rejecting firmware header: {e}");
                return channel.reply(
                    code,
                    Status::InvalidHeaderInfo,
                    &self.write_offset.to_le_bytes(),
                );
            }
        };

        let same = self.header.is_some_and(|h| h.same_transfer(&header));
        if self.state == SessionState::ReceivingImage && same {
            if self.resume() {
                info!(
                    "Resuming transfer of v{} at offset {}",
                    header.version, self.write_offset
                );
                return channel.reply(code, Status::Success, &self.write_offset.to_le_bytes());
            }
            warn!("Staged data failed resume check, restarting transfer");
        }

        let status = self.start(header);
        channel.reply(code, status, &self.write_offset.to_le_bytes())
    }

    fn resume(&mut self) -> bool {
        let base = self.base_address;
        // Safe cast: fill is bounded by the page size
        #[allow(clippy::cast_possible_truncation)]
        let flushed = self.write_offset - self.staging.fill() as u32;
        let policy = self.config.resume_policy;

        let Some(flash) = select(&mut self.internal, &mut self.external, self.storage) else {
            return false;
        };
        if let Err(e) = flash.enable() {
            error!("Cannot re-enable {} flash: {e}", self.storage);
            return false;
        }

        match policy {
            ResumePolicy::Trust => true,
            ResumePolicy::Verify => {
                let mut check = ImageVerifier::new();
                if let Err(e) = check.update_from_flash(flash, base, flushed) {
                    warn!("Reading back staged data failed: {e}");
                    return false;
                }
                check.update(self.staging.staged());
                let ok = check.value() == self.verifier.value();
                if !ok {
                    warn!(
                        "Resume check mismatch: flash {:#010x}, expected {:#010x}",
                        check.value(),
                        self.verifier.value()
                    );
                }
                ok
            }
        }
    }

    fn start(&mut self, header: FirmwareHeader) -> Status {
        self.finish();

        let storage = header.storage_type;
        let Some(layout) = self.config.layout(storage).copied() else {
            warn!("No OTA area configured in {storage} flash");
            return Status::InsufficientFlash;
        };
        if !layout.fits(header.length) {
            warn!(
                "Image of {} bytes does not fit the {storage} OTA area ({} bytes)",
                header.length, layout.ota_max_size
            );
            return Status::InsufficientFlash;
        }
        let Some(flash) = select(&mut self.internal, &mut self.external, storage) else {
            warn!("No {storage} flash present");
            return Status::InsufficientFlash;
        };

        let erased = flash
            .enable()
            .and_then(|()| flash.erase_range(layout.ota_base, header.length));
        if let Err(e) = erased {
            error!("Preparing {storage} OTA area failed: {e}");
            flash.disable();
            return Status::FlashWriteError;
        }

        let page_size = flash.geometry().page_size as usize;
        self.staging.reset(page_size, layout.ota_base);
        self.verifier.reset();
        self.header = Some(header);
        self.storage = storage;
        self.base_address = layout.ota_base;
        self.write_offset = 0;
        self.state = SessionState::ReceivingImage;

        info!(
            "Receiving image v{} ({} bytes, crc {:#010x}) into {storage} flash at {:#010x}",
            header.version, header.length, header.crc32, layout.ota_base
        );
        Status::Success
    }

    #[allow(clippy::cast_possible_truncation)]
    fn on_data<T: Transport>(
        &mut self,
        payload: &[u8],
        channel: &mut ReplyChannel<T>,
    ) -> Result<()> {
        let code = Command::FwData.code();
        let Some(header) = self.header else {
            return Ok(());
        };

        // Data on a new link without a fresh FW_HEADER: reacquire the flash
        // under the same check a header-driven resume gets.
        if !self.region(self.storage).is_some_and(FlashRegion::is_enabled) {
            if !self.resume() {
                warn!(
                    "Cannot continue at offset {} after reconnect, header required",
                    self.write_offset
                );
                self.abort();
                return channel.reply(
                    code,
                    Status::InvalidHeaderInfo,
                    &self.write_offset.to_le_bytes(),
                );
            }
            info!(
                "Continuing transfer at offset {} on new link",
                self.write_offset
            );
        }

        let offset = self.write_offset;
        let end = u64::from(offset) + payload.len() as u64;
        if end > u64::from(header.length) {
            warn!(
                "Data of {} bytes at offset {offset} overruns image length {}",
                payload.len(),
                header.length
            );
            return channel.reply(code, Status::InvalidPacketLength, &offset.to_le_bytes());
        }
        if payload.is_empty() {
            return channel.reply(code, Status::Success, &offset.to_le_bytes());
        }

        let is_last = end == u64::from(header.length);
        let dest = self.base_address + offset;
        let Some(flash) = select(&mut self.internal, &mut self.external, self.storage) else {
            return channel.reply(code, Status::UnknownError, &offset.to_le_bytes());
        };

        if let Err(e) = self.staging.write(flash, dest, payload, is_last) {
            error!(
                "Writing {} bytes at offset {offset} failed: {e}",
                payload.len()
            );
            return channel.reply(code, Status::FlashWriteError, &offset.to_le_bytes());
        }

        self.verifier.update(payload);
        // Safe cast: end <= header.length
        self.write_offset = end as u32;
        trace!("Offset {}/{}", self.write_offset, header.length);
        if is_last {
            info!("All {} bytes received", header.length);
        }
        channel.reply(code, Status::Success, &self.write_offset.to_le_bytes())
    }

    fn on_verify<T: Transport>(&mut self, channel: &mut ReplyChannel<T>) -> Result<()> {
        let code = Command::FwVerify.code();
        let Some(header) = self.header else {
            return Ok(());
        };

        let (status, crc) = if self.write_offset != header.length {
            warn!(
                "Verify requested with {} of {} bytes received",
                self.write_offset, header.length
            );
            (Status::CrcError, self.verifier.value())
        } else {
            self.verify_and_activate(&header)
        };

        self.finish();
        channel.reply(code, status, &crc.to_le_bytes())
    }

    fn verify_and_activate(&mut self, header: &FirmwareHeader) -> (Status, u32) {
        let base = self.base_address;
        let Some(flash) = select(&mut self.internal, &mut self.external, self.storage) else {
            return (Status::UnknownError, 0);
        };

        let crc = match ImageVerifier::checksum_region(flash, base, header.length) {
            Ok(crc) => crc,
            Err(e) => {
                error!("Reading back image failed: {e}");
                return (Status::FlashWriteError, 0);
            }
        };
        if crc != header.crc32 {
            warn!(
                "Image CRC mismatch: expected {:#010x}, computed {crc:#010x}",
                header.crc32
            );
            return (Status::CrcError, crc);
        }

        let descriptor = ActivationDescriptor::from_header(header, base);
        match self.activation.persist(&mut self.internal, &descriptor) {
            Ok(()) => {
                info!("Image v{} verified, activation recorded", header.version);
                self.descriptor = Some(descriptor);
                (Status::Success, crc)
            }
            Err(_) => (Status::FlashWriteError, crc),
        }
    }

    /// Release the flash and return to idle.
    fn finish(&mut self) {
        if self.state == SessionState::ReceivingImage {
            if let Some(flash) = self.region_mut(self.storage) {
                flash.disable();
            }
        }
        self.state = SessionState::Idle;
        self.header = None;
        self.write_offset = 0;
    }
}
