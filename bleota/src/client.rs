//! Peer-side transfer driver.
//!
//! [`UpdateClient`] produces the packets a phone or host sends to the device
//! and tracks the device's acknowledged offset from its replies. It does not
//! do any I/O; the caller moves bytes.
//!
//! ```rust
//! use bleota::client::UpdateClient;
//! use bleota::image::FirmwareHeader;
//!
//! let image = vec![0xA5; 2048];
//! let header = FirmwareHeader::for_image(&image).with_version(2);
//! let client = UpdateClient::new(&image, header).unwrap().with_chunk_size(512);
//!
//! let packet = client.next_data_packet().unwrap();
//! assert_eq!(packet.len(), 2 + 1 + 512 + 4);
//! ```

use crate::error::{Error, Result};
use crate::image::header::FirmwareHeader;
use crate::protocol::packet::{Command, Packet, fragment};
use crate::protocol::reply::Reply;
use log::{debug, warn};

/// Default FW_DATA payload size.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default fragment size (ATT MTU 247 minus the 3-byte write header).
pub const DEFAULT_MTU: usize = 244;

/// Drives one image transfer from the sending side.
#[derive(Debug, Clone)]
pub struct UpdateClient<'a> {
    image: &'a [u8],
    header: FirmwareHeader,
    chunk_size: usize,
    mtu: usize,
    offset: u32,
}

impl<'a> UpdateClient<'a> {
    /// Create a client sending `image` described by `header`.
    pub fn new(image: &'a [u8], header: FirmwareHeader) -> Result<Self> {
        if header.length as usize != image.len() {
            return Err(Error::InvalidHeader(format!(
                "header length {} does not match image size {}",
                header.length,
                image.len()
            )));
        }
        header.validate()?;

        Ok(Self {
            image,
            header,
            chunk_size: DEFAULT_CHUNK_SIZE,
            mtu: DEFAULT_MTU,
            offset: 0,
        })
    }

    /// Set the FW_DATA payload size.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Set the fragment size.
    #[must_use]
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(1);
        self
    }

    /// Header sent with FW_HEADER.
    pub fn header(&self) -> &FirmwareHeader {
        &self.header
    }

    /// Offset last acknowledged by the device.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether the device acknowledged the whole image.
    pub fn is_complete(&self) -> bool {
        self.offset == self.header.length
    }

    /// Encoded FW_HEADER packet.
    pub fn header_packet(&self) -> Vec<u8> {
        Packet::header(&self.header).build()
    }

    /// Encoded FW_DATA packet for the next chunk, or `None` once complete.
    pub fn next_data_packet(&self) -> Option<Vec<u8>> {
        let start = self.offset as usize;
        if start >= self.image.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.image.len());
        Some(Packet::data(&self.image[start..end]).build())
    }

    /// Encoded FW_VERIFY packet.
    pub fn verify_packet(&self) -> Vec<u8> {
        Packet::verify().build()
    }

    /// Encoded FW_RESET packet.
    pub fn reset_packet(&self) -> Vec<u8> {
        Packet::reset().build()
    }

    /// Split `packet` into fragments of at most the configured MTU.
    pub fn fragments<'p>(&self, packet: &'p [u8]) -> impl Iterator<Item = &'p [u8]> {
        fragment(packet, self.mtu)
    }

    /// Interpret a reply to `expected`.
    ///
    /// Header and data replies carry the device's write offset, which is
    /// adopted whatever the status. Replies to other commands leave the
    /// offset alone.
    pub fn handle_reply(&mut self, expected: Command, data: &[u8]) -> Result<Reply> {
        let reply = Reply::decode(data)?;

        // Framing errors on a fragment whose command was unknown come back as 0.
        if reply.command != expected.code() && reply.command != 0 {
            return Err(Error::Protocol(format!(
                "expected reply to {expected:?}, got command {}",
                reply.command
            )));
        }

        if matches!(expected, Command::FwHeader | Command::FwData) {
            if let Some(offset) = reply.value_u32() {
                if offset > self.header.length {
                    return Err(Error::Protocol(format!(
                        "device offset {offset} beyond image length {}",
                        self.header.length
                    )));
                }
                if offset != self.offset {
                    debug!("Device offset {} -> {offset}", self.offset);
                }
                self.offset = offset;
            }
        }

        if !reply.status.is_success() {
            warn!("{expected:?} answered with {}", reply.status);
        }
        Ok(reply)
    }
}
