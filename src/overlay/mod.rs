//! Overlay handshake engine
//!
//! Wires the relay edges of a session: a seeding peer solicits every other
//! member with `request`, reserves up to `max_fanout` of those that `accept`
//! and `confirm`s them; a confirmed peer becomes a relay-seeder and repeats.

pub mod handshake;
pub mod solicit;
pub mod state;

pub use handshake::{send_redundant, HandshakeLoop};
pub use solicit::{candidates, Solicitation};
pub use state::{HandshakeAction, OverlayEdges, OverlayState, Role};
