//! Per-session handshake state machine
//!
//! Pure state: every inbound packet maps to a list of [`HandshakeAction`]s
//! that the packet loop carries out. Nothing here touches a socket.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::protocol::HandshakeMessage;

/// A peer's part in the current session. Transitions only move forward
/// until [`OverlayState::reset`] ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No directive for this session yet
    Idle,
    /// Receiving frames, not (yet) forwarding them
    Listener,
    /// Confirmed by an upstream seeder; forwards what it receives
    RelaySeeder,
    /// Holds the song file locally
    SourceSeeder,
}

impl Role {
    pub fn is_seeder(self) -> bool {
        matches!(self, Role::RelaySeeder | Role::SourceSeeder)
    }
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send `message` to `to`'s handshake port `copies` times
    Reply {
        to: IpAddr,
        message: HandshakeMessage,
        copies: usize,
    },
    /// This peer was confirmed as a relay: solicit its own downstream for `song`
    StartRelaying { song: String },
}

/// A peer's place in the current session's relay chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEdges {
    pub role: Role,
    pub upstream: Option<IpAddr>,
    pub downstream: Vec<IpAddr>,
}

/// Overlay edges and handshake bookkeeping for one session
#[derive(Debug)]
pub struct OverlayState {
    role: Role,
    song: Option<String>,
    upstream: Option<IpAddr>,
    downstream: Vec<IpAddr>,
    /// Candidate -> has it answered our `request`
    responded: HashMap<IpAddr, bool>,
    listening: bool,
    max_fanout: usize,
    redundant_sends: usize,
}

impl OverlayState {
    pub fn new(max_fanout: usize, redundant_sends: usize) -> Self {
        Self {
            role: Role::Idle,
            song: None,
            upstream: None,
            downstream: Vec::new(),
            responded: HashMap::new(),
            listening: false,
            max_fanout,
            redundant_sends: redundant_sends.max(1),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn song(&self) -> Option<&str> {
        self.song.as_deref()
    }

    /// The seeder that confirmed this peer as its relay
    pub fn upstream(&self) -> Option<IpAddr> {
        self.upstream
    }

    pub fn downstream(&self) -> &[IpAddr] {
        &self.downstream
    }

    /// Current role and edges
    pub fn edges(&self) -> OverlayEdges {
        OverlayEdges {
            role: self.role,
            upstream: self.upstream,
            downstream: self.downstream.clone(),
        }
    }

    /// Handle a `seed` directive. Returns false if already seeding.
    pub fn begin_source(&mut self, song: &str) -> bool {
        if self.role.is_seeder() {
            return false;
        }
        self.role = Role::SourceSeeder;
        self.song = Some(song.to_string());
        true
    }

    /// Handle a `listen-for-mp3` directive. Returns false if already listening.
    pub fn begin_listening(&mut self) -> bool {
        if self.listening {
            return false;
        }
        self.listening = true;
        if self.role == Role::Idle {
            self.role = Role::Listener;
        }
        true
    }

    /// Start a solicitation round: every candidate is unanswered
    pub fn begin_solicitation(&mut self, candidates: &[IpAddr]) {
        self.responded.clear();
        for candidate in candidates {
            self.responded.insert(*candidate, false);
        }
    }

    /// Whether `candidate` has answered. Unknown candidates count as answered
    /// so a stale retry loop cannot spin after a reset.
    pub fn has_responded(&self, candidate: IpAddr) -> bool {
        self.responded.get(&candidate).copied().unwrap_or(true)
    }

    pub fn all_responded(&self) -> bool {
        self.responded.values().all(|answered| *answered)
    }

    /// Process one inbound handshake packet from `from`
    pub fn on_handshake(
        &mut self,
        message: HandshakeMessage,
        from: IpAddr,
        has_song_locally: impl Fn(&str) -> bool,
    ) -> Vec<HandshakeAction> {
        match message {
            HandshakeMessage::Request { song } => {
                if self.role.is_seeder() || has_song_locally(&song) {
                    return vec![self.reply(from, HandshakeMessage::Reject, 1)];
                }
                if self.song.is_none() {
                    self.song = Some(song);
                }
                vec![self.reply(from, HandshakeMessage::Accept, 1)]
            }

            HandshakeMessage::Confirm => {
                if self.role.is_seeder() {
                    // Stale or duplicate confirm: we already have our upstream
                    return vec![self.reply(from, HandshakeMessage::Reject, self.redundant_sends)];
                }
                let Some(song) = self.song.clone() else {
                    tracing::warn!("Confirm from {} before any request; ignoring", from);
                    return Vec::new();
                };
                self.role = Role::RelaySeeder;
                self.upstream = Some(from);
                vec![HandshakeAction::StartRelaying { song }]
            }

            HandshakeMessage::Accept => {
                if !self.role.is_seeder() {
                    tracing::warn!("Accept from {} while not seeding; ignoring", from);
                    return Vec::new();
                }

                let selected = self.downstream.contains(&from);
                let has_room = self.downstream.len() < self.max_fanout;
                self.responded.insert(from, true);

                if selected || !has_room {
                    // Already reserved (duplicate accept) or fan-out full: the
                    // candidate times out unselected
                    return Vec::new();
                }

                self.downstream.push(from);
                tracing::info!("Reserved {} as downstream relay", from);
                vec![self.reply(from, HandshakeMessage::Confirm, self.redundant_sends)]
            }

            HandshakeMessage::Reject => {
                self.responded.insert(from, true);
                Vec::new()
            }
        }
    }

    /// End the session: clear edges and return to idle
    pub fn reset(&mut self) {
        self.role = Role::Idle;
        self.song = None;
        self.upstream = None;
        self.downstream.clear();
        self.responded.clear();
        self.listening = false;
    }

    fn reply(&self, to: IpAddr, message: HandshakeMessage, copies: usize) -> HandshakeAction {
        HandshakeAction::Reply {
            to,
            message,
            copies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn no_songs(_: &str) -> bool {
        false
    }

    #[test]
    fn test_source_and_listener_wire_one_edge() {
        let source_ip = ip(1);
        let listener_ip = ip(2);
        let mut source = OverlayState::new(1, 5);
        let mut listener = OverlayState::new(1, 5);

        assert!(source.begin_source("song1.mp3"));
        assert!(listener.begin_listening());
        source.begin_solicitation(&[listener_ip]);
        assert!(!source.has_responded(listener_ip));

        let actions = listener.on_handshake(HandshakeMessage::request("song1.mp3"), source_ip, no_songs);
        assert_eq!(
            actions,
            vec![HandshakeAction::Reply {
                to: source_ip,
                message: HandshakeMessage::Accept,
                copies: 1
            }]
        );

        let actions = source.on_handshake(HandshakeMessage::Accept, listener_ip, no_songs);
        assert_eq!(
            actions,
            vec![HandshakeAction::Reply {
                to: listener_ip,
                message: HandshakeMessage::Confirm,
                copies: 5
            }]
        );
        assert!(source.all_responded());

        let actions = listener.on_handshake(HandshakeMessage::Confirm, source_ip, no_songs);
        assert_eq!(
            actions,
            vec![HandshakeAction::StartRelaying {
                song: "song1.mp3".into()
            }]
        );

        assert_eq!(listener.upstream(), Some(source_ip));
        assert_eq!(listener.role(), Role::RelaySeeder);
        assert_eq!(source.downstream(), &[listener_ip]);
        assert_eq!(
            source.edges(),
            OverlayEdges {
                role: Role::SourceSeeder,
                upstream: None,
                downstream: vec![listener_ip],
            }
        );
    }

    #[test]
    fn test_seeder_rejects_confirm_five_times_and_keeps_edges() {
        let mut seeder = OverlayState::new(1, 5);
        seeder.begin_source("songX.mp3");
        seeder.begin_solicitation(&[ip(7)]);
        seeder.on_handshake(HandshakeMessage::Accept, ip(7), no_songs);
        assert_eq!(seeder.downstream(), &[ip(7)]);

        let actions = seeder.on_handshake(HandshakeMessage::Confirm, ip(9), no_songs);
        assert_eq!(
            actions,
            vec![HandshakeAction::Reply {
                to: ip(9),
                message: HandshakeMessage::Reject,
                copies: 5
            }]
        );
        assert_eq!(seeder.downstream(), &[ip(7)]);
        assert_eq!(seeder.role(), Role::SourceSeeder);
    }

    #[test]
    fn test_full_fanout_marks_responded_without_reserving() {
        let mut seeder = OverlayState::new(1, 5);
        seeder.begin_source("s.mp3");
        seeder.begin_solicitation(&[ip(2), ip(3)]);

        assert_eq!(seeder.on_handshake(HandshakeMessage::Accept, ip(2), no_songs).len(), 1);
        assert!(seeder.on_handshake(HandshakeMessage::Accept, ip(3), no_songs).is_empty());

        assert_eq!(seeder.downstream(), &[ip(2)]);
        assert!(seeder.has_responded(ip(3)));
        assert!(seeder.all_responded());
    }

    #[test]
    fn test_duplicate_accept_is_not_reserved_twice() {
        let mut seeder = OverlayState::new(2, 5);
        seeder.begin_source("s.mp3");
        seeder.on_handshake(HandshakeMessage::Accept, ip(2), no_songs);
        assert!(seeder.on_handshake(HandshakeMessage::Accept, ip(2), no_songs).is_empty());
        assert_eq!(seeder.downstream(), &[ip(2)]);
    }

    #[test]
    fn test_reject_marks_candidate_answered() {
        let mut seeder = OverlayState::new(1, 5);
        seeder.begin_source("s.mp3");
        seeder.begin_solicitation(&[ip(4)]);
        seeder.on_handshake(HandshakeMessage::Reject, ip(4), no_songs);
        assert!(seeder.has_responded(ip(4)));
        assert!(seeder.downstream().is_empty());
    }

    #[test]
    fn test_request_rejected_when_song_is_local_or_already_seeding() {
        let mut holder = OverlayState::new(1, 5);
        let actions = holder.on_handshake(HandshakeMessage::request("a.mp3"), ip(1), |s| s == "a.mp3");
        assert!(matches!(
            actions.as_slice(),
            [HandshakeAction::Reply { message: HandshakeMessage::Reject, .. }]
        ));
        assert_eq!(holder.song(), None);

        let mut seeder = OverlayState::new(1, 5);
        seeder.begin_source("b.mp3");
        let actions = seeder.on_handshake(HandshakeMessage::request("b.mp3"), ip(1), no_songs);
        assert!(matches!(
            actions.as_slice(),
            [HandshakeAction::Reply { message: HandshakeMessage::Reject, copies: 1, .. }]
        ));
    }

    #[test]
    fn test_first_requested_song_is_kept() {
        let mut peer = OverlayState::new(1, 5);
        peer.on_handshake(HandshakeMessage::request("first.mp3"), ip(1), no_songs);
        peer.on_handshake(HandshakeMessage::request("second.mp3"), ip(2), no_songs);
        assert_eq!(peer.song(), Some("first.mp3"));
    }

    #[test]
    fn test_roles_do_not_regress_within_a_session() {
        let mut peer = OverlayState::new(1, 5);
        peer.on_handshake(HandshakeMessage::request("a.mp3"), ip(1), no_songs);
        peer.on_handshake(HandshakeMessage::Confirm, ip(1), no_songs);
        assert_eq!(peer.role(), Role::RelaySeeder);

        // listen-for-mp3 arriving after the confirm keeps the seeder role
        assert!(peer.begin_listening());
        assert_eq!(peer.role(), Role::RelaySeeder);
        assert!(!peer.begin_listening());
        assert!(!peer.begin_source("a.mp3"));

        peer.reset();
        assert_eq!(peer.role(), Role::Idle);
        assert!(peer.downstream().is_empty());
        assert_eq!(peer.upstream(), None);
    }

    #[test]
    fn test_accept_while_not_seeding_is_ignored() {
        let mut peer = OverlayState::new(1, 5);
        assert!(peer.on_handshake(HandshakeMessage::Accept, ip(3), no_songs).is_empty());
        assert!(peer.downstream().is_empty());
    }
}
