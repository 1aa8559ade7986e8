//! Control channel messages between peers and the tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Calls a peer makes to the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerCall {
    Join { identity: String, songs: Vec<String> },
    Leave { identity: String },
    ListSongs,
    ListPeers,
    Play { song: String },
    Ping { identity: String },
    ReadyToPlay { identity: String },
    DonePlaying { identity: String },
}

impl TrackerCall {
    /// Method name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::ListSongs => "list-songs",
            Self::ListPeers => "list-peers",
            Self::Play { .. } => "play",
            Self::Ping { .. } => "ping",
            Self::ReadyToPlay { .. } => "ready-to-play",
            Self::DonePlaying { .. } => "done-playing",
        }
    }
}

/// Tracker replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerReply {
    Ack,
    Songs(Vec<String>),
    Peers(Vec<String>),
}

/// Scheduled playback start; `None` means start on receipt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePacket {
    pub time_to_play: Option<DateTime<Utc>>,
}

impl TimePacket {
    /// Start `delay` from now
    pub fn after(delay: std::time::Duration) -> Self {
        Self {
            time_to_play: chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d),
        }
    }

    /// Time left until the scheduled start; `None` if it is due already
    pub fn wait_time(&self) -> Option<std::time::Duration> {
        let at = self.time_to_play?;
        (at - Utc::now()).to_std().ok()
    }
}

/// Callbacks the tracker makes to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerCall {
    /// The peer holds the current song and must start seeding it
    Seed { song: String },
    /// The peer lacks the current song and must receive frames
    ListenForMp3,
    /// Start playing the buffered song
    StartPlaying(TimePacket),
}

impl PeerCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Seed { .. } => "seed",
            Self::ListenForMp3 => "listen-for-mp3",
            Self::StartPlaying(_) => "start-playing",
        }
    }
}

/// Peer replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    Ack,
}

/// One frame on the control connection. Requests and responses for both
/// directions share the stream; ids are scoped to the direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    TrackerRequest {
        id: u64,
        call: TrackerCall,
    },
    TrackerResponse {
        id: u64,
        reply: Result<TrackerReply, String>,
    },
    PeerRequest {
        id: u64,
        call: PeerCall,
    },
    PeerResponse {
        id: u64,
        reply: Result<PeerReply, String>,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}
