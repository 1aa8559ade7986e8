//! Media collaborators: frame splitting, song lookup and playback

pub mod catalog;
pub mod decoder;
pub mod sink;

pub use catalog::{song_matches, SongCatalog};
pub use decoder::{FrameHeader, Mp3Frames};
pub use sink::{default_sink, PlaybackSink, SilentSink};

#[cfg(feature = "playback")]
pub use sink::RodioSink;
