//! Handshake datagrams
//!
//! On the wire each packet is a UTF-8 string, `tag` or `tag:payload`.

use std::fmt;

use crate::error::ProtocolError;

/// A handshake packet exchanged on the handshake port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// A seeding peer asks whether the receiver wants to be fed `song`
    Request { song: String },
    /// The seeder selected the receiver as a downstream relay
    Confirm,
    /// The receiver is willing to be fed
    Accept,
    /// The receiver declines, or the confirm was stale
    Reject,
}

impl HandshakeMessage {
    pub fn request(song: impl Into<String>) -> Self {
        Self::Request { song: song.into() }
    }

    /// Tag used on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Confirm => "confirm",
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }

    /// Encode to datagram bytes
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decode a datagram
    pub fn decode(packet: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(packet).map_err(|_| ProtocolError::InvalidUtf8)?;
        let text = text.trim_end_matches(['\0', '\n', '\r']);
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let (tag, payload) = match text.split_once(':') {
            Some((tag, payload)) => (tag, Some(payload)),
            None => (text, None),
        };

        match tag {
            "request" => match payload {
                Some(song) if !song.is_empty() => Ok(Self::request(song)),
                _ => Err(ProtocolError::MissingPayload("request")),
            },
            "confirm" => Ok(Self::Confirm),
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request { song } => write!(f, "request:{}", song),
            other => f.write_str(other.tag()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(HandshakeMessage::request("song1.mp3").encode(), b"request:song1.mp3");
        assert_eq!(HandshakeMessage::Confirm.encode(), b"confirm");
        assert_eq!(HandshakeMessage::Reject.to_string(), "reject");
    }

    #[test]
    fn test_decode_request_keeps_colons_in_song() {
        let msg = HandshakeMessage::decode(b"request:live: part 2.mp3").unwrap();
        assert_eq!(msg, HandshakeMessage::request("live: part 2.mp3"));
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let mut packet = b"accept".to_vec();
        packet.extend_from_slice(&[0; 8]);
        assert_eq!(HandshakeMessage::decode(&packet).unwrap(), HandshakeMessage::Accept);
    }

    #[test]
    fn test_decode_faults() {
        assert_eq!(HandshakeMessage::decode(b""), Err(ProtocolError::Empty));
        assert_eq!(
            HandshakeMessage::decode(b"request"),
            Err(ProtocolError::MissingPayload("request"))
        );
        assert_eq!(
            HandshakeMessage::decode(b"hello:x"),
            Err(ProtocolError::UnknownTag("hello".into()))
        );
        assert_eq!(HandshakeMessage::decode(&[0xff, 0xfe]), Err(ProtocolError::InvalidUtf8));
    }
}
