//! OTA wire protocol: packets, fragment reassembly and status replies.

pub mod crc;
pub mod framer;
pub mod packet;
pub mod reply;

// Re-export common types
pub use framer::{ConnectionId, Frame, PacketFramer};
pub use packet::{Command, Packet, fragment};
pub use reply::{Reply, Status};
