//! Transport abstraction.
//!
//! The engine never talks to the radio stack itself. Everything it needs from
//! the outside world goes through this trait: delivering a reply
//! notification, dropping a link, and rebooting the device.

use crate::error::{Error, Result};
use crate::protocol::framer::ConnectionId;

/// Capabilities the OTA engine needs from its host.
pub trait Transport {
    /// Deliver one reply as a single notification.
    fn send_reply(&mut self, data: &[u8]) -> Result<()>;

    /// Close the connection with the given id.
    fn disconnect(&mut self, connection: ConnectionId);

    /// Reboot the device.
    fn reset_system(&mut self);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_reply(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_reply(data)
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        (**self).disconnect(connection);
    }

    fn reset_system(&mut self) {
        (**self).reset_system();
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_reply(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_reply(data)
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        (**self).disconnect(connection);
    }

    fn reset_system(&mut self) {
        (**self).reset_system();
    }
}

/// Transport that records everything sent through it.
///
/// Used by tests and by host-side simulation.
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    /// Encoded replies, oldest first.
    pub replies: Vec<Vec<u8>>,
    /// Connections that were closed.
    pub disconnects: Vec<ConnectionId>,
    /// Number of system resets requested.
    pub resets: usize,
    /// While set, `send_reply` fails as if the notification queue were full.
    pub link_down: bool,
}

impl RecordingTransport {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return all recorded replies.
    pub fn take_replies(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.replies)
    }
}

impl Transport for RecordingTransport {
    fn send_reply(&mut self, data: &[u8]) -> Result<()> {
        if self.link_down {
            return Err(Error::Transport(format!(
                "cannot notify {} bytes, link down",
                data.len()
            )));
        }
        self.replies.push(data.to_vec());
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        self.disconnects.push(connection);
    }

    fn reset_system(&mut self) {
        self.resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive<T: Transport>(mut transport: T) {
        transport.send_reply(&[1, 2]).unwrap();
        transport.disconnect(4);
        transport.reset_system();
    }

    #[test]
    fn test_records_through_mut_ref() {
        let mut recorder = RecordingTransport::new();
        drive(&mut recorder);
        assert_eq!(recorder.take_replies(), vec![vec![1, 2]]);
        assert!(recorder.replies.is_empty());
        assert_eq!(recorder.disconnects, vec![4]);
        assert_eq!(recorder.resets, 1);
    }

    #[test]
    fn test_link_down_rejects_replies() {
        let mut transport: Box<dyn Transport> = Box::new(RecordingTransport {
            link_down: true,
            ..RecordingTransport::default()
        });
        let err = transport.send_reply(&[0; 6]).unwrap_err();
        assert!(matches!(err, Error::Transport(ref msg) if msg.contains("6 bytes")));
    }
}
