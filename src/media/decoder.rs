//! MPEG audio frame splitter
//!
//! Splits a compressed MP3 file into its frames without decoding them. Each
//! frame is self-contained on the wire, so one frame travels per datagram.
//! Leading ID3v2 tags and any bytes that do not start a valid frame header
//! are skipped.

use bytes::Bytes;
use std::path::Path;

/// Bitrates in kbit/s, indexed by the header's 4-bit bitrate index
const BITRATES_V1_L1: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    I,
    II,
    III,
}

/// Parsed fields of a 4-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    version: Version,
    layer: Layer,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
}

impl FrameHeader {
    /// Parse a header; `None` if the bytes are not a usable frame start.
    /// Free-format bitrates are not supported.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }

        let version = match (bytes[1] >> 3) & 0b11 {
            0b00 => Version::Mpeg25,
            0b10 => Version::Mpeg2,
            0b11 => Version::Mpeg1,
            _ => return None,
        };
        let layer = match (bytes[1] >> 1) & 0b11 {
            0b01 => Layer::III,
            0b10 => Layer::II,
            0b11 => Layer::I,
            _ => return None,
        };

        let bitrate_index = (bytes[2] >> 4) as usize;
        if bitrate_index == 0 || bitrate_index == 15 {
            return None;
        }
        let table = match (version, layer) {
            (Version::Mpeg1, Layer::I) => &BITRATES_V1_L1,
            (Version::Mpeg1, Layer::II) => &BITRATES_V1_L2,
            (Version::Mpeg1, Layer::III) => &BITRATES_V1_L3,
            (_, Layer::I) => &BITRATES_V2_L1,
            (_, _) => &BITRATES_V2_L23,
        };

        let base_rate = match (bytes[2] >> 2) & 0b11 {
            0 => 44_100,
            1 => 48_000,
            2 => 32_000,
            _ => return None,
        };
        let sample_rate = match version {
            Version::Mpeg1 => base_rate,
            Version::Mpeg2 => base_rate / 2,
            Version::Mpeg25 => base_rate / 4,
        };

        Some(Self {
            version,
            layer,
            bitrate_kbps: table[bitrate_index],
            sample_rate,
            padding: (bytes[2] >> 1) & 1 == 1,
        })
    }

    /// Total frame length in bytes, header included
    pub fn frame_len(&self) -> usize {
        let bitrate = self.bitrate_kbps * 1000;
        let padding = self.padding as u32;
        let len = match (self.layer, self.version) {
            (Layer::I, _) => (12 * bitrate / self.sample_rate + padding) * 4,
            (Layer::III, Version::Mpeg2 | Version::Mpeg25) => 72 * bitrate / self.sample_rate + padding,
            (_, _) => 144 * bitrate / self.sample_rate + padding,
        };
        len as usize
    }
}

/// Size of a leading ID3v2 tag, if any
fn id3v2_len(data: &[u8]) -> usize {
    if data.len() < 10 || &data[..3] != b"ID3" {
        return 0;
    }
    // Sync-safe size: 7 bits per byte
    let size = data[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | (*b & 0x7F) as usize);
    let footer = if data[5] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}

/// Lazy, finite, non-restartable sequence of frames.
///
/// Iteration ends (`None`) at end of data or at a truncated final frame.
pub struct Mp3Frames {
    data: Bytes,
    pos: usize,
}

impl Mp3Frames {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let pos = id3v2_len(&data).min(data.len());
        Self { data, pos }
    }

    /// Read a whole file and split it
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(tokio::fs::read(path).await?))
    }
}

impl Iterator for Mp3Frames {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        while self.pos + 4 <= self.data.len() {
            let Some(header) = FrameHeader::parse(&self.data[self.pos..]) else {
                self.pos += 1;
                continue;
            };

            let len = header.frame_len();
            if len < 4 {
                self.pos += 1;
                continue;
            }
            let end = self.pos + len;
            if end > self.data.len() {
                self.pos = self.data.len();
                return None;
            }

            let frame = self.data.slice(self.pos..end);
            self.pos = end;
            return Some(frame);
        }
        None
    }
}
