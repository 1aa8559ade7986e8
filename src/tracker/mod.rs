//! Tracker coordinator: membership, song queue and playback synchronization

pub mod server;
pub mod state;
pub mod status;

pub use server::{dispatch, SharedTrackerState, TrackerServer};
pub use state::{PeerRecord, TrackerSnapshot, TrackerState};
