//! Error types for the tracker and peer processes

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("not connected to a tracker")]
    NotConnected,

    #[error("Song not found locally: {0}")]
    SongNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport faults on datagram and control sockets
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("No usable local network address: {0}")]
    NoLocalAddress(String),
}

/// Malformed or unexpected messages
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty handshake packet")]
    Empty,

    #[error("Unknown handshake tag: {0}")]
    UnknownTag(String),

    #[error("Missing payload for {0}")]
    MissingPayload(&'static str),

    #[error("Packet is not valid UTF-8")]
    InvalidUtf8,

    #[error("Control frame codec failure: {0}")]
    Codec(String),
}

/// Remote-call channel failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Control channel closed")]
    Closed,

    #[error("Remote handler failed: {0}")]
    Remote(String),

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

/// Local audio buffer faults
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer overflow: need {needed} bytes, capacity is {capacity}")]
    Overflow { needed: usize, capacity: usize },
}

/// Playback sink errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AudioError {
    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Nothing loaded to play")]
    NothingLoaded,

    #[error("Failed to decode buffered stream: {0}")]
    DecodeFailed(String),

    #[error("Playback thread stopped")]
    ThreadStopped,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
