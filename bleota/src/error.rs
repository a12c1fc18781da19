//! Error types for bleota.

use crate::protocol::reply::Status;
use std::io;
use thiserror::Error;

/// Result type for bleota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bleota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (image files, flash dumps).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Flash driver error.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Packet framing error.
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed firmware header.
    #[error("Invalid firmware header: {0}")]
    InvalidHeader(String),

    /// Malformed or corrupted activation descriptor.
    #[error("Invalid activation descriptor: {0}")]
    InvalidDescriptor(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u32,
        /// Actual CRC value.
        actual: u32,
    },

    /// Transport refused or failed to deliver bytes.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed reply from the device.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors reported by a [`FlashRegion`](crate::flash::FlashRegion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    /// The region has not been enabled.
    #[error("flash region is disabled")]
    Disabled,

    /// Access outside the region.
    #[error("access of {len} bytes at {addr:#010x} is out of bounds")]
    OutOfBounds {
        /// Start address of the access.
        addr: u32,
        /// Length of the access.
        len: usize,
    },

    /// Address does not sit on the required page or sector boundary.
    #[error("address {addr:#010x} is not aligned to {align} bytes")]
    Misaligned {
        /// Offending address.
        addr: u32,
        /// Required alignment.
        align: u32,
    },

    /// Sector erase failed.
    #[error("erase failed at {addr:#010x}")]
    EraseFailed {
        /// Sector address.
        addr: u32,
    },

    /// Page program failed.
    #[error("program failed at {addr:#010x}")]
    ProgramFailed {
        /// Page address.
        addr: u32,
    },

    /// Page read back differs from what was programmed.
    #[error("read-back mismatch at {addr:#010x}")]
    ReadbackMismatch {
        /// Page address.
        addr: u32,
    },
}

/// Errors detected while reassembling a packet from fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fragment too short, declared length too small, or overrun.
    #[error("invalid packet length")]
    InvalidPacketLength,

    /// Packet would exceed the reassembly buffer.
    #[error("packet exceeds reassembly buffer")]
    InsufficientBuffer,

    /// Trailing CRC-32 does not match.
    #[error("packet CRC mismatch")]
    CrcError,
}

impl FrameError {
    /// Status code reported to the peer for this error.
    pub fn status(self) -> Status {
        match self {
            Self::InvalidPacketLength => Status::InvalidPacketLength,
            Self::InsufficientBuffer => Status::InsufficientBuffer,
            Self::CrcError => Status::CrcError,
        }
    }
}
