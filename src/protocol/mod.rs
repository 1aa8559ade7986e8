//! Wire protocol: handshake datagrams and control-channel messages

pub mod control;
pub mod handshake;

pub use control::{ControlMessage, PeerCall, PeerReply, TimePacket, TrackerCall, TrackerReply};
pub use handshake::HandshakeMessage;
