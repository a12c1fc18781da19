//! Reassembly of transport fragments into complete OTA packets.
//!
//! A packet may arrive split across any number of fragments. The first
//! fragment must carry at least the length prefix and the command byte; the
//! rest is accumulated until the declared length is reached, at which point
//! the trailing CRC-32 is checked and the packet is handed out.

use crate::error::FrameError;
use crate::protocol::crc::crc32;
use crate::protocol::packet::{
    COMMAND_SIZE, CRC_SIZE, LENGTH_FIELD_SIZE, MIN_DECLARED_LENGTH, MIN_HEADER_SIZE,
};
use log::{trace, warn};

/// Identifier of a transport connection.
pub type ConnectionId = u16;

/// Default maximum declared length (command + 1024-byte payload + CRC).
pub const DEFAULT_MAX_PACKET_SIZE: usize = COMMAND_SIZE + 1024 + CRC_SIZE;

/// A complete, CRC-checked packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Raw command byte.
    pub command: u8,
    /// Payload without the trailing CRC.
    pub payload: &'a [u8],
}

/// State of a packet that has started but not yet completed.
#[derive(Debug)]
struct InFlight {
    connection: ConnectionId,
    declared_length: usize,
    command: u8,
}

/// Fragment reassembler.
#[derive(Debug)]
pub struct PacketFramer {
    max_packet_size: usize,
    /// Bytes after the length prefix: command + payload + CRC.
    buffer: Vec<u8>,
    in_flight: Option<InFlight>,
    /// Set once a packet completes; cleared on the next `feed`.
    completed: bool,
}

impl PacketFramer {
    /// Create a framer accepting packets up to `max_packet_size` declared bytes.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            buffer: Vec::with_capacity(max_packet_size),
            in_flight: None,
            completed: false,
        }
    }

    /// Maximum declared packet length accepted.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Whether a packet is partially received.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Command byte of the packet currently being reassembled, if any.
    pub fn pending_command(&self) -> Option<u8> {
        self.in_flight.as_ref().map(|p| p.command)
    }

    /// Command byte that `fragment` from `connection` belongs to, or 0 when
    /// it cannot be known. Used to address error replies.
    pub fn command_for(&self, connection: ConnectionId, fragment: &[u8]) -> u8 {
        match &self.in_flight {
            Some(p) if p.connection == connection => p.command,
            _ => fragment.get(LENGTH_FIELD_SIZE).copied().unwrap_or(0),
        }
    }

    /// Bytes received so far for the in-flight packet (after the length prefix).
    pub fn received(&self) -> usize {
        if self.in_flight.is_some() {
            self.buffer.len()
        } else {
            0
        }
    }

    /// Discard any partially received packet.
    pub fn reset(&mut self) {
        if let Some(p) = self.in_flight.take() {
            trace!(
                "Discarding in-flight packet (cmd {}, {}/{} bytes)",
                p.command,
                self.buffer.len(),
                p.declared_length
            );
        }
        self.buffer.clear();
        self.completed = false;
    }

    /// Feed one transport fragment.
    ///
    /// Returns `Ok(Some(frame))` when the fragment completes a valid packet,
    /// `Ok(None)` when more fragments are needed, and an error when the packet
    /// was rejected. On error nothing stays buffered.
    pub fn feed(
        &mut self,
        connection: ConnectionId,
        fragment: &[u8],
    ) -> Result<Option<Frame<'_>>, FrameError> {
        if self.completed {
            self.buffer.clear();
            self.completed = false;
        }

        let switched = self
            .in_flight
            .as_ref()
            .is_some_and(|p| p.connection != connection);
        if switched {
            warn!("Fragment from connection {connection} interrupts an in-flight packet, discarding");
            self.reset();
        }

        let body = if self.in_flight.is_none() {
            if fragment.len() < MIN_HEADER_SIZE {
                warn!("First fragment too short ({} bytes)", fragment.len());
                return Err(FrameError::InvalidPacketLength);
            }

            let declared = u16::from_le_bytes([fragment[0], fragment[1]]) as usize;
            if declared < MIN_DECLARED_LENGTH {
                warn!("Declared packet length {declared} too small");
                return Err(FrameError::InvalidPacketLength);
            }
            if declared > self.max_packet_size {
                warn!(
                    "Declared packet length {declared} exceeds buffer ({})",
                    self.max_packet_size
                );
                return Err(FrameError::InsufficientBuffer);
            }

            self.buffer.clear();
            self.in_flight = Some(InFlight {
                connection,
                declared_length: declared,
                command: fragment[LENGTH_FIELD_SIZE],
            });
            &fragment[LENGTH_FIELD_SIZE..]
        } else {
            fragment
        };

        let declared = self
            .in_flight
            .as_ref()
            .map_or(0, |p| p.declared_length);

        let total = self.buffer.len() + body.len();
        if total > self.max_packet_size {
            warn!("Packet overflows reassembly buffer ({total} bytes)");
            self.reset();
            return Err(FrameError::InsufficientBuffer);
        }
        if total > declared {
            warn!("Fragment overruns declared length ({total} > {declared})");
            self.reset();
            return Err(FrameError::InvalidPacketLength);
        }

        self.buffer.extend_from_slice(body);
        trace!("Framer: {}/{} bytes", self.buffer.len(), declared);

        if self.buffer.len() < declared {
            return Ok(None);
        }

        let Some(packet) = self.in_flight.take() else {
            return Ok(None);
        };

        let split = self.buffer.len() - CRC_SIZE;
        let expected = u32::from_le_bytes([
            self.buffer[split],
            self.buffer[split + 1],
            self.buffer[split + 2],
            self.buffer[split + 3],
        ]);
        let actual = crc32(&self.buffer[..split]);
        if expected != actual {
            warn!(
                "Packet CRC mismatch (cmd {}): expected {expected:#010x}, got {actual:#010x}",
                packet.command
            );
            self.buffer.clear();
            return Err(FrameError::CrcError);
        }

        self.completed = true;
        Ok(Some(Frame {
            command: packet.command,
            payload: &self.buffer[COMMAND_SIZE..split],
        }))
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}
