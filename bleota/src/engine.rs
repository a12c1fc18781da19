//! Entry points for transport events.
//!
//! [`OtaEngine`] is what the host's BLE stack talks to. It owns the packet
//! framer, the transfer session and the reply channel, and routes the three
//! kinds of events the host delivers:
//!
//! - a fragment written by the peer ([`OtaEngine::on_fragment`])
//! - the link going down ([`OtaEngine::on_disconnect`])
//! - time passing ([`OtaEngine::tick`])

use crate::channel::ReplyChannel;
use crate::config::OtaConfig;
use crate::error::Result;
use crate::flash::FlashRegion;
use crate::protocol::framer::{ConnectionId, PacketFramer};
use crate::session::TransferSession;
use crate::transport::Transport;
use log::debug;
use std::time::Duration;

/// Device-side OTA engine.
#[derive(Debug)]
pub struct OtaEngine<F: FlashRegion, T: Transport> {
    framer: PacketFramer,
    session: TransferSession<F>,
    channel: ReplyChannel<T>,
}

impl<F: FlashRegion, T: Transport> OtaEngine<F, T> {
    /// Create an engine.
    ///
    /// `external` is only needed when the configuration has an external OTA
    /// area.
    pub fn new(config: OtaConfig, internal: F, external: Option<F>, transport: T) -> Result<Self> {
        let framer = PacketFramer::new(config.max_packet_size);
        let channel = ReplyChannel::new(transport, config.disconnect_delay, config.reset_delay);
        let session = TransferSession::new(config, internal, external)?;
        Ok(Self {
            framer,
            session,
            channel,
        })
    }

    /// A fragment arrived on the OTA write characteristic.
    ///
    /// Framing errors are answered with the matching status. The returned
    /// error only reports a reply the transport could not deliver.
    pub fn on_fragment(&mut self, connection: ConnectionId, fragment: &[u8]) -> Result<()> {
        self.channel.set_connection(connection);
        let command = self.framer.command_for(connection, fragment);

        match self.framer.feed(connection, fragment) {
            Ok(None) => Ok(()),
            Ok(Some(frame)) => {
                self.session
                    .dispatch(frame.command, frame.payload, &mut self.channel)
            }
            Err(e) => {
                debug!("Framing error on cmd {command}: {e}");
                let offset = self.session.write_offset().to_le_bytes();
                self.channel.reply(command, e.status(), &offset)
            }
        }
    }

    /// The link with `connection` went down.
    pub fn on_disconnect(&mut self, connection: ConnectionId) {
        if self
            .channel
            .connection()
            .is_some_and(|active| active != connection)
        {
            debug!("Ignoring disconnect of inactive connection {connection}");
            return;
        }

        self.framer.reset();
        self.session.on_disconnect();
        self.channel.on_disconnect();
    }

    /// Advance the disconnect and reset timers.
    pub fn tick(&mut self, elapsed: Duration) {
        self.channel.tick(elapsed);
    }

    /// The transfer session.
    pub fn session(&self) -> &TransferSession<F> {
        &self.session
    }

    /// The transfer session, mutably.
    pub fn session_mut(&mut self) -> &mut TransferSession<F> {
        &mut self.session
    }

    /// The packet framer.
    pub fn framer(&self) -> &PacketFramer {
        &self.framer
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        self.channel.transport()
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        self.channel.transport_mut()
    }

    /// Whether a disconnect or reset is pending.
    pub fn is_reset_pending(&self) -> bool {
        self.channel.is_reset_pending()
    }

    /// Consume the engine, returning the flash regions and the transport.
    pub fn into_parts(self) -> (F, Option<F>, T) {
        let (internal, external) = self.session.into_regions();
        (internal, external, self.channel.into_transport())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionLayout;
    use crate::error::Error;
    use crate::flash::{FlashGeometry, MemoryFlash};
    use crate::image::header::FirmwareHeader;
    use crate::protocol::packet::{Packet, fragment};
    use crate::protocol::reply::{Reply, Status};
    use crate::session::SessionState;
    use crate::transport::RecordingTransport;

    fn engine() -> OtaEngine<MemoryFlash, RecordingTransport> {
        let config = OtaConfig::new(RegionLayout::new(0x1000, 0x4000)).with_descriptor_address(0x7000);
        let internal = MemoryFlash::new(FlashGeometry::new(0, 0x8000, 64, 0x400));
        OtaEngine::new(config, internal, None, RecordingTransport::new()).unwrap()
    }

    fn feed(engine: &mut OtaEngine<MemoryFlash, RecordingTransport>, packet: &[u8], mtu: usize) {
        for frag in fragment(packet, mtu) {
            engine.on_fragment(3, frag).unwrap();
        }
    }

    fn replies(engine: &mut OtaEngine<MemoryFlash, RecordingTransport>) -> Vec<Reply> {
        engine
            .transport_mut()
            .take_replies()
            .iter()
            .map(|r| Reply::decode(r).unwrap())
            .collect()
    }

    #[test]
    fn test_header_through_fragments() {
        let mut engine = engine();
        let header = FirmwareHeader::for_image(&[1; 100]);
        feed(&mut engine, &Packet::header(&header).build(), 20);

        let replies = replies(&mut engine);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, 1);
        assert_eq!(replies[0].status, Status::Success);
        assert_eq!(engine.session().state(), SessionState::ReceivingImage);
    }

    #[test]
    fn test_framing_error_reply() {
        let mut engine = engine();
        let mut packet = Packet::data(&[1; 10]).build();
        packet[4] ^= 0x80;
        feed(&mut engine, &packet, 20);

        let replies = replies(&mut engine);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, 2);
        assert_eq!(replies[0].status, Status::CrcError);
    }

    #[test]
    fn test_short_fragment_reply_uses_zero_command() {
        let mut engine = engine();
        engine.on_fragment(3, &[0x01]).unwrap();

        let replies = replies(&mut engine);
        assert_eq!(replies[0].command, 0);
        assert_eq!(replies[0].status, Status::InvalidPacketLength);
    }

    #[test]
    fn test_disconnect_drops_partial_packet() {
        let mut engine = engine();
        let packet = Packet::header(&FirmwareHeader::for_image(&[1; 100])).build();
        engine.on_fragment(3, &packet[..20]).unwrap();
        assert!(engine.framer().is_in_flight());

        engine.on_disconnect(3);
        assert!(!engine.framer().is_in_flight());
    }

    #[test]
    fn test_disconnect_of_other_connection_ignored() {
        let mut engine = engine();
        let packet = Packet::header(&FirmwareHeader::for_image(&[1; 100])).build();
        engine.on_fragment(3, &packet[..20]).unwrap();

        engine.on_disconnect(9);
        assert!(engine.framer().is_in_flight());
    }

    #[test]
    fn test_undeliverable_reply_is_reported() {
        let mut engine = engine();
        let header = FirmwareHeader::for_image(&[1; 100]);
        engine.transport_mut().link_down = true;

        let err = engine
            .on_fragment(3, &Packet::header(&header).build())
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        // The command itself took effect; only the notification was lost.
        assert_eq!(engine.session().state(), SessionState::ReceivingImage);

        engine.transport_mut().link_down = false;
        feed(&mut engine, &Packet::data(&[1; 40]).build(), 20);
        let replies = replies(&mut engine);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].value_u32(), Some(40));
    }

    #[test]
    fn test_reset_sequence() {
        let mut engine = engine();
        feed(&mut engine, &Packet::reset().build(), 20);
        assert_eq!(replies(&mut engine)[0].status, Status::Success);

        engine.tick(Duration::from_millis(1000));
        assert_eq!(engine.transport().disconnects, vec![3]);
        engine.on_disconnect(3);

        engine.tick(Duration::from_millis(200));
        assert_eq!(engine.transport().resets, 1);
    }
}
