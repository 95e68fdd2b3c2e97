//! Peer-wire protocol: handshake, message framing, bitfield tracking, and the per-connection
//! piece download loop.
pub mod bitfield;
pub mod connection;
pub mod handshake;
pub mod message;

pub use bitfield::Bitfield;
pub use connection::{PeerConnection, PeerConnectionError, PieceResult, PieceTask};
pub use handshake::{Handshake, HandshakeError};
pub use message::{Message, MessageError};
