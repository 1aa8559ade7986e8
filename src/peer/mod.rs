//! Peer side of the control channel: membership, callbacks and playback

pub mod context;
pub mod node;

pub use context::{PeerContext, SharedSink};
pub use node::PeerNode;
