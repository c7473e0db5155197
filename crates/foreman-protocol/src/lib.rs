//! # Foreman Protocol
//!
//! Wire format of the Foreman job broker: a 12 byte big-endian header
//! followed by NUL-separated payload fields, plus a line-oriented admin
//! text mode sharing the same socket.
//!
//! ```
//! use foreman_protocol::{Packet, PacketBody, PacketType};
//!
//! let packet = Packet::request(PacketBody::EchoReq { data: "OK".into() });
//! let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
//! assert_eq!(decoded.packet_type(), PacketType::EchoReq);
//! ```

pub mod codec;
pub mod error;
pub mod packet;
mod payload;
pub mod types;

pub use codec::{Frame, PacketCodec, DEFAULT_MAX_LINE, DEFAULT_MAX_PAYLOAD};
pub use error::{ProtocolError, ProtocolResult};
pub use packet::{Packet, PacketBody, Schedule};
pub use types::{Magic, PacketType, Priority, HEADER_LEN};
