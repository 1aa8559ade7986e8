//! # Mob Radio
//!
//! Tracker-coordinated peer-to-peer relay streaming: one peer holds the song,
//! every other peer receives it over a relay chain and all of them start
//! playback on a signal from the tracker.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                TRACKER                                   │
//! │   membership table    song queue    current song + playing/done counters │
//! │        ▲  join/leave/ping/ready-to-play/done-playing (tracker::server)   │
//! │        │                                                                 │
//! │        │  seed / listen-for-mp3 / start-playing callbacks                │
//! └────────┼─────────────────────────────────────────────────────────────────┘
//!          │  one TCP control connection per peer (network::rpc)
//!          ▼
//! ┌──────────────────────┐        UDP :6121 handshake        ┌──────────────────────┐
//! │  PEER A (source)     │  request:<song> ─────────────────▶│  PEER B (listener)   │
//! │                      │◀──────────────────────── accept   │                      │
//! │  overlay::solicit    │  confirm x5 ─────────────────────▶│  overlay::state      │
//! │                      │                                   │  becomes relay-seeder│
//! │  media::decoder      │        UDP :6122 raw frames       │                      │
//! │    └▶ relay::engine ─┼──────────────────────────────────▶│  relay::engine ──────┼──▶ PEER C ...
//! │        └▶ SongBuffer │                                   │    └▶ SongBuffer     │
//! │                      │                                   │                      │
//! │  watermark ─▶ ready-to-play ─▶ start-playing ─▶ media::sink ─▶ done-playing     │
//! └──────────────────────┘                                   └──────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod overlay;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod shell;
pub mod tracker;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// UDP port every peer listens on for handshake packets
    pub const DEFAULT_HANDSHAKE_PORT: u16 = 6121;

    /// UDP port every peer listens on for relayed frames
    pub const DEFAULT_FRAME_PORT: u16 = 6122;

    /// Default TCP port for the tracker control listener
    pub const DEFAULT_TRACKER_PORT: u16 = 1234;

    /// Default HTTP port for the tracker status API
    pub const DEFAULT_STATUS_PORT: u16 = 8080;

    /// Largest datagram read from either UDP socket
    pub const MAX_DATAGRAM_SIZE: usize = 2048;

    /// Frames buffered before a peer asks to start playing
    pub const PREBUFFER_WATERMARK: usize = 300;

    /// Downstream relays a seeding peer accepts
    pub const DEFAULT_MAX_FANOUT: usize = 1;

    /// Copies sent of each `confirm`/stale `reject`
    pub const REDUNDANT_SENDS: usize = 5;

    /// Gap between redundant copies in microseconds
    pub const REDUNDANT_SEND_GAP_US: u64 = 500;

    /// Interval between `request` retransmissions in microseconds
    pub const SOLICIT_INTERVAL_US: u64 = 500;

    /// Delay after each forwarded frame in microseconds
    pub const RELAY_PACING_US: u64 = 300;

    /// Silence from the upstream relay, after its first frame, that ends
    /// a listener's stream, in milliseconds
    pub const END_OF_STREAM_IDLE_MS: u64 = 2000;

    /// Tracker ping interval in milliseconds
    pub const PING_INTERVAL_MS: u64 = 10;

    /// Playback sink poll interval in milliseconds
    pub const PLAYBACK_POLL_MS: u64 = 5;

    /// Grace period before sockets are torn down on leave
    pub const LEAVE_GRACE_SECS: u64 = 3;

    /// Local audio buffer capacity, sized to the largest expected song
    pub const DEFAULT_BUFFER_CAPACITY: usize = 20 * 1024 * 1024;
}
