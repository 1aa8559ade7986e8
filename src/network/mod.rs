//! Transport primitives: UDP sockets and the control-channel RPC

pub mod rpc;
pub mod udp;

pub use rpc::{Incoming, PeerClient, PeerSide, Responder, RpcChannel, TrackerClient, TrackerSide};
pub use udp::{create_sender, create_socket, local_ip};
