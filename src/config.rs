//! Application configuration
//!
//! Every section has defaults matching [`crate::constants`]; a TOML file only
//! needs the keys it overrides.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration shared by the tracker and peer binaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub overlay: OverlayConfig,
    pub relay: RelayConfig,
    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
}

/// UDP socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port for handshake packets (same on every peer)
    pub handshake_port: u16,
    /// Port for relayed frames (same on every peer)
    pub frame_port: u16,
    /// Largest datagram accepted
    pub max_datagram_size: usize,
    /// Kernel send/receive buffer size for UDP sockets
    pub socket_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_port: DEFAULT_HANDSHAKE_PORT,
            frame_port: DEFAULT_FRAME_PORT,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            socket_buffer_size: 1024 * 1024,
        }
    }
}

/// Handshake tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub max_fanout: usize,
    pub solicit_interval_us: u64,
    pub redundant_sends: usize,
    pub redundant_send_gap_us: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_fanout: DEFAULT_MAX_FANOUT,
            solicit_interval_us: SOLICIT_INTERVAL_US,
            redundant_sends: REDUNDANT_SENDS,
            redundant_send_gap_us: REDUNDANT_SEND_GAP_US,
        }
    }
}

impl OverlayConfig {
    pub fn solicit_interval(&self) -> Duration {
        Duration::from_micros(self.solicit_interval_us)
    }

    pub fn redundant_send_gap(&self) -> Duration {
        Duration::from_micros(self.redundant_send_gap_us)
    }
}

/// Relay and buffering settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub watermark_frames: usize,
    pub buffer_capacity: usize,
    pub pacing_us: u64,
    /// Upstream silence that marks the end of a received song
    pub end_of_stream_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            watermark_frames: PREBUFFER_WATERMARK,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            pacing_us: RELAY_PACING_US,
            end_of_stream_ms: END_OF_STREAM_IDLE_MS,
        }
    }
}

impl RelayConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_micros(self.pacing_us)
    }

    pub fn end_of_stream_idle(&self) -> Duration {
        Duration::from_millis(self.end_of_stream_ms)
    }
}

/// Peer process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Directory scanned for local songs
    pub songs_dir: PathBuf,
    pub ping_interval_ms: u64,
    pub playback_poll_ms: u64,
    pub leave_grace_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            songs_dir: PathBuf::from("songs"),
            ping_interval_ms: PING_INTERVAL_MS,
            playback_poll_ms: PLAYBACK_POLL_MS,
            leave_grace_secs: LEAVE_GRACE_SECS,
        }
    }
}

impl PeerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn playback_poll(&self) -> Duration {
        Duration::from_millis(self.playback_poll_ms)
    }

    pub fn leave_grace(&self) -> Duration {
        Duration::from_secs(self.leave_grace_secs)
    }
}

/// Tracker process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub port: u16,
    /// HTTP status API port; `None` disables it
    pub status_port: Option<u16>,
    /// When set, `start-playing` carries `now + delay` as the scheduled start
    pub start_delay_ms: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TRACKER_PORT,
            status_port: Some(DEFAULT_STATUS_PORT),
            start_delay_ms: None,
        }
    }
}

impl AppConfig {
    /// Default config file location (`<config dir>/mob-radio/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mob-radio").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        Self::from_toml(&text)
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write this config as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
