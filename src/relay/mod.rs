//! Relay/buffer engine and the local song buffer

pub mod buffer;
pub mod engine;

pub use buffer::{create_shared_buffer, SharedSongBuffer, SongBuffer, SongStream};
pub use engine::{relay_received, relay_source, RelayEngine, RelayStats, UpstreamFilter};
