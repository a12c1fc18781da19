//! Reply delivery and the disconnect/reset sequence.
//!
//! After FW_RESET the device must not reboot straight away: the Success reply
//! and then the disconnect still have to leave the radio. The channel runs
//! two one-shot timers for that:
//!
//! ```text
//! FW_RESET --reply--> [disconnect delay] --disconnect--> [reset delay] --reset-->
//! ```
//!
//! If the link drops on its own while the first timer is pending, the
//! sequence skips straight to the reset delay.

use crate::error::Result;
use crate::protocol::framer::ConnectionId;
use crate::protocol::reply::{Reply, Status};
use crate::timer::OneShot;
use crate::transport::Transport;
use log::{debug, info};
use std::time::Duration;

/// Sends status replies and owns the reboot timers.
#[derive(Debug)]
pub struct ReplyChannel<T: Transport> {
    transport: T,
    connection: Option<ConnectionId>,
    disconnect_timer: OneShot,
    reset_timer: OneShot,
    disconnect_delay: Duration,
    reset_delay: Duration,
}

impl<T: Transport> ReplyChannel<T> {
    /// Create a channel over `transport`.
    pub fn new(transport: T, disconnect_delay: Duration, reset_delay: Duration) -> Self {
        Self {
            transport,
            connection: None,
            disconnect_timer: OneShot::new(),
            reset_timer: OneShot::new(),
            disconnect_delay,
            reset_delay,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the channel, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Connection replies currently go to.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Record the connection that drives the transfer.
    pub fn set_connection(&mut self, connection: ConnectionId) {
        self.connection = Some(connection);
    }

    /// Encode and send a status reply.
    pub fn reply(&mut self, command: u8, status: Status, payload: &[u8]) -> Result<()> {
        debug!("Reply cmd {command}: {status} ({} data bytes)", payload.len());
        let data = Reply::new(command, status, payload).encode();
        self.transport.send_reply(&data)
    }

    /// Start the disconnect-then-reset sequence. Restarts it if already running.
    pub fn schedule_reset(&mut self) {
        info!(
            "Device reset scheduled: disconnect in {:?}, reset {:?} later",
            self.disconnect_delay, self.reset_delay
        );
        self.reset_timer.cancel();
        self.disconnect_timer.start(self.disconnect_delay);
    }

    /// Whether a disconnect or reset is pending.
    pub fn is_reset_pending(&self) -> bool {
        self.disconnect_timer.is_pending() || self.reset_timer.is_pending()
    }

    /// The link dropped.
    pub fn on_disconnect(&mut self) {
        self.connection = None;
        if self.disconnect_timer.is_pending() {
            debug!("Link dropped before scheduled disconnect, arming reset");
            self.disconnect_timer.cancel();
            self.reset_timer.start(self.reset_delay);
        }
    }

    /// Advance the timers by `elapsed`. At most one timer expires per call.
    pub fn tick(&mut self, elapsed: Duration) {
        if self.disconnect_timer.advance(elapsed) {
            if let Some(connection) = self.connection.take() {
                info!("Closing connection {connection}");
                self.transport.disconnect(connection);
            }
            self.reset_timer.start(self.reset_delay);
        } else if self.reset_timer.advance(elapsed) {
            info!("Resetting device");
            self.transport.reset_system();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;

    const DISCONNECT: Duration = Duration::from_millis(1000);
    const RESET: Duration = Duration::from_millis(200);

    fn channel() -> ReplyChannel<RecordingTransport> {
        let mut channel = ReplyChannel::new(RecordingTransport::new(), DISCONNECT, RESET);
        channel.set_connection(7);
        channel
    }

    #[test]
    fn test_reply_encoding() {
        let mut channel = channel();
        channel.reply(2, Status::Success, &512u32.to_le_bytes()).unwrap();
        let replies = channel.transport_mut().take_replies();
        assert_eq!(replies.len(), 1);
        let reply = Reply::decode(&replies[0]).unwrap();
        assert_eq!(reply.command, 2);
        assert_eq!(reply.value_u32(), Some(512));
    }

    #[test]
    fn test_reset_sequence() {
        let mut channel = channel();
        channel.schedule_reset();

        channel.tick(Duration::from_millis(999));
        assert!(channel.transport().disconnects.is_empty());

        channel.tick(Duration::from_millis(1));
        assert_eq!(channel.transport().disconnects, vec![7]);
        assert_eq!(channel.transport().resets, 0);

        channel.tick(Duration::from_millis(199));
        assert_eq!(channel.transport().resets, 0);
        channel.tick(Duration::from_millis(1));
        assert_eq!(channel.transport().resets, 1);
        assert!(!channel.is_reset_pending());
    }

    #[test]
    fn test_reschedule_restarts_delay() {
        let mut channel = channel();
        channel.schedule_reset();
        channel.tick(Duration::from_millis(900));
        channel.schedule_reset();
        channel.tick(Duration::from_millis(900));
        assert!(channel.transport().disconnects.is_empty());
        channel.tick(Duration::from_millis(100));
        assert_eq!(channel.transport().disconnects, vec![7]);
    }

    #[test]
    fn test_link_drop_skips_to_reset() {
        let mut channel = channel();
        channel.schedule_reset();
        channel.on_disconnect();

        channel.tick(RESET);
        assert!(channel.transport().disconnects.is_empty());
        assert_eq!(channel.transport().resets, 1);
    }

    #[test]
    fn test_no_timers_without_reset() {
        let mut channel = channel();
        channel.tick(Duration::from_secs(60));
        assert!(channel.transport().disconnects.is_empty());
        assert_eq!(channel.transport().resets, 0);
    }
}
