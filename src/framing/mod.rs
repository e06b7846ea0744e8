//! Framed IPC codec (spec.md §4.A).
//!
//! Every socket in the system — IPC link or external client connection —
//! speaks the same typed, length-prefixed framing. [`packet`] implements the
//! plain `DataPacket` layer; [`authed`] layers the stream-cipher + MAC
//! "authed packet" on top of it for connections that have completed a
//! handshake.

pub mod authed;
pub mod packet;

pub use authed::{AuthedCodec, SessionDirection, SessionKeys};
pub use packet::{DataPacket, DataType, PacketCodec};

/// Payload size cap shared by plain and authed packets (spec.md §4.A).
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;
