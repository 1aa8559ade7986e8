//! Tracker tables
//!
//! Membership, the song queue and the playback counters. Every operation is
//! synchronous and returns the callback (if any) the server must make, so the
//! whole state can sit behind one lock.

use serde::Serialize;
use std::collections::VecDeque;

use crate::media::song_matches;
use crate::protocol::{PeerCall, TimePacket};

/// One member and the songs it advertised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub identity: String,
    pub songs: Vec<String>,
}

/// Read-only view for the status API
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub current_song: Option<String>,
    pub queue: Vec<String>,
    pub clients_playing: u64,
    pub done_responses: u64,
    pub peer_count: usize,
}

/// Authoritative tracker state
#[derive(Debug, Default)]
pub struct TrackerState {
    /// Members in join order; identities are unique
    peers: Vec<PeerRecord>,
    queue: VecDeque<String>,
    current_song: Option<String>,
    /// Peers in an active playing session
    clients_playing: u64,
    /// `done-playing` reports received this round
    done_responses: u64,
}

impl TrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, or replace the songs of an existing one.
    /// Returns true for a new member.
    pub fn join(&mut self, identity: &str, songs: Vec<String>) -> bool {
        match self.peers.iter_mut().find(|p| p.identity == identity) {
            Some(existing) => {
                existing.songs = songs;
                false
            }
            None => {
                self.peers.push(PeerRecord {
                    identity: identity.to_string(),
                    songs,
                });
                true
            }
        }
    }

    /// Remove a member. Returns true if it was present.
    pub fn leave(&mut self, identity: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.identity != identity);
        self.peers.len() != before
    }

    /// Every advertised song once, in order of first encounter
    pub fn list_songs(&self) -> Vec<String> {
        let mut songs: Vec<String> = Vec::new();
        for song in self.peers.iter().flat_map(|p| &p.songs) {
            if !songs.contains(song) {
                songs.push(song.clone());
            }
        }
        songs
    }

    pub fn list_peers(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.identity.clone()).collect()
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    /// Enqueue `song` if some member advertises it. Returns true if queued.
    pub fn play(&mut self, song: &str) -> bool {
        let available = self
            .peers
            .iter()
            .flat_map(|p| &p.songs)
            .any(|advertised| song_matches(song, advertised));
        if available {
            self.queue.push_back(song.to_string());
        }
        available
    }

    /// Periodic poll from a member: promote the queue head if nothing is
    /// current, then tell the caller whether to seed or listen.
    pub fn ping(&mut self, identity: &str) -> Option<PeerCall> {
        if self.done_responses != 0 {
            return None;
        }

        if self.current_song.is_none() {
            if let Some(head) = self.queue.front() {
                tracing::info!("Now playing {}", head);
                self.current_song = Some(head.clone());
            }
        }

        let song = self.current_song.as_ref()?;
        let holds_song = self
            .peers
            .iter()
            .find(|p| p.identity == identity)
            .is_some_and(|p| p.songs.iter().any(|s| song_matches(song, s)));

        if holds_song {
            Some(PeerCall::Seed { song: song.clone() })
        } else {
            Some(PeerCall::ListenForMp3)
        }
    }

    /// A member buffered enough to play. It is told to start straight away;
    /// there is no barrier across members.
    pub fn ready_to_play(&mut self, start: TimePacket) -> PeerCall {
        self.clients_playing += 1;
        PeerCall::StartPlaying(start)
    }

    /// A member finished playing. Returns true when it was the last one and
    /// the round was closed.
    pub fn done_playing(&mut self, identity: &str) -> bool {
        if self.clients_playing == 0 {
            tracing::warn!("Ignoring done-playing from {}: nobody is playing", identity);
            return false;
        }

        self.clients_playing -= 1;
        self.done_responses += 1;
        if self.clients_playing > 0 {
            return false;
        }

        let finished = self.queue.pop_front();
        tracing::info!(
            "Round for {} finished after {} report(s)",
            finished.as_deref().unwrap_or("<none>"),
            self.done_responses
        );
        self.current_song = None;
        self.done_responses = 0;
        true
    }

    pub fn current_song(&self) -> Option<&str> {
        self.current_song.as_deref()
    }

    pub fn queue(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }

    pub fn clients_playing(&self) -> u64 {
        self.clients_playing
    }

    pub fn done_responses(&self) -> u64 {
        self.done_responses
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            current_song: self.current_song.clone(),
            queue: self.queue(),
            clients_playing: self.clients_playing,
            done_responses: self.done_responses,
            peer_count: self.peers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn songs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Debug, Clone)]
    enum Membership {
        Join(u8),
        Leave(u8),
    }

    fn membership_op() -> impl Strategy<Value = Membership> {
        prop_oneof![
            (0u8..8).prop_map(Membership::Join),
            (0u8..8).prop_map(Membership::Leave),
        ]
    }

    proptest! {
        #[test]
        fn prop_list_peers_matches_joined_set(ops in prop::collection::vec(membership_op(), 0..60)) {
            let mut state = TrackerState::new();
            let mut model = BTreeSet::new();

            for op in ops {
                match op {
                    Membership::Join(n) => {
                        let id = format!("10.0.0.{}:5000", n);
                        state.join(&id, Vec::new());
                        model.insert(id);
                    }
                    Membership::Leave(n) => {
                        let id = format!("10.0.0.{}:5000", n);
                        state.leave(&id);
                        model.remove(&id);
                    }
                }
            }

            let peers: BTreeSet<String> = state.list_peers().into_iter().collect();
            prop_assert_eq!(peers, model);
            prop_assert_eq!(state.list_peers().len(), state.peers().len());
        }

        #[test]
        fn prop_list_songs_is_first_encounter_union(
            advertised in prop::collection::vec(prop::collection::vec(0u8..10, 0..6), 0..8)
        ) {
            let mut state = TrackerState::new();
            let mut expected: Vec<String> = Vec::new();

            for (i, list) in advertised.iter().enumerate() {
                let list: Vec<String> = list.iter().map(|n| format!("s{}.mp3", n)).collect();
                for song in &list {
                    if !expected.contains(song) {
                        expected.push(song.clone());
                    }
                }
                state.join(&format!("10.0.1.{}:5000", i), list);
            }

            prop_assert_eq!(state.list_songs(), expected);
        }

        #[test]
        fn prop_play_of_unknown_song_keeps_queue(
            known in prop::collection::vec(0u8..5, 0..5),
            requested in 5u8..10
        ) {
            let mut state = TrackerState::new();
            state.join("10.0.0.1:5000", known.iter().map(|n| format!("s{}.mp3", n)).collect());
            let before = state.queue();

            let bare = format!("s{}", requested);
            let with_ext = format!("s{}.mp3", requested);
            prop_assert!(!state.play(&bare));
            prop_assert!(!state.play(&with_ext));
            prop_assert_eq!(state.queue(), before);
        }

        #[test]
        fn prop_round_resets_only_after_every_done(playing in 1usize..12, order in any::<u64>()) {
            let mut state = TrackerState::new();
            state.join("10.0.0.1:5000", songs(&["a.mp3"]));
            state.play("a.mp3");
            state.ping("10.0.0.1:5000");

            let mut ids: Vec<String> = (0..playing).map(|i| format!("10.0.2.{}:5000", i)).collect();
            for _ in &ids {
                state.ready_to_play(TimePacket::default());
            }
            // Deterministic shuffle driven by `order`
            let len = ids.len();
            ids.rotate_left((order as usize) % len);

            for (i, id) in ids.iter().enumerate() {
                let closed = state.done_playing(id);
                let last = i + 1 == playing;
                prop_assert_eq!(closed, last);
                if last {
                    prop_assert_eq!(state.current_song(), None);
                    prop_assert_eq!(state.done_responses(), 0);
                } else {
                    prop_assert_eq!(state.current_song(), Some("a.mp3"));
                    prop_assert_eq!(state.done_responses(), i as u64 + 1);
                }
            }
            prop_assert!(state.queue().is_empty());
        }
    }

    #[test]
    fn test_join_is_an_upsert() {
        let mut state = TrackerState::new();
        assert!(state.join("a", songs(&["x.mp3"])));
        assert!(!state.join("a", songs(&["y.mp3"])));
        assert_eq!(state.list_peers(), vec!["a".to_string()]);
        assert_eq!(state.list_songs(), songs(&["y.mp3"]));

        assert!(state.leave("a"));
        assert!(!state.leave("a"));
    }

    #[test]
    fn test_source_seeds_and_others_listen() {
        let mut state = TrackerState::new();
        state.join("A", songs(&["song1.mp3"]));
        state.join("B", Vec::new());

        assert!(state.play("song1"));
        assert_eq!(state.queue(), songs(&["song1"]));
        assert_eq!(state.current_song(), None);

        assert_eq!(state.ping("A"), Some(PeerCall::Seed { song: "song1".into() }));
        assert_eq!(state.current_song(), Some("song1"));
        assert_eq!(state.ping("B"), Some(PeerCall::ListenForMp3));
    }

    #[test]
    fn test_ping_without_a_song_is_a_no_op() {
        let mut state = TrackerState::new();
        state.join("A", songs(&["song1.mp3"]));
        assert_eq!(state.ping("A"), None);
        assert_eq!(state.current_song(), None);
    }

    #[test]
    fn test_ping_is_silent_while_round_winds_down() {
        let mut state = TrackerState::new();
        state.join("A", songs(&["a.mp3"]));
        state.join("B", Vec::new());
        state.play("a.mp3");
        state.ping("A");
        state.ready_to_play(TimePacket::default());
        state.ready_to_play(TimePacket::default());

        assert!(!state.done_playing("A"));
        assert_eq!(state.ping("B"), None);

        assert!(state.done_playing("B"));
        assert_eq!(state.ping("B"), None);
    }

    #[test]
    fn test_next_song_is_promoted_after_round() {
        let mut state = TrackerState::new();
        state.join("A", songs(&["a.mp3", "b.mp3"]));
        state.play("a.mp3");
        state.play("b.mp3");

        state.ping("A");
        state.ready_to_play(TimePacket::default());
        assert!(state.done_playing("A"));

        assert_eq!(state.ping("A"), Some(PeerCall::Seed { song: "b.mp3".into() }));
    }

    #[test]
    fn test_stray_done_is_ignored() {
        let mut state = TrackerState::new();
        state.join("A", songs(&["a.mp3"]));
        state.play("a.mp3");
        state.ping("A");

        assert!(!state.done_playing("A"));
        assert_eq!(state.clients_playing(), 0);
        assert_eq!(state.current_song(), Some("a.mp3"));
        assert_eq!(state.queue(), songs(&["a.mp3"]));
    }

    #[test]
    fn test_ready_to_play_passes_schedule_through() {
        let mut state = TrackerState::new();
        let at = TimePacket::after(std::time::Duration::from_millis(250));
        assert_eq!(state.ready_to_play(at.clone()), PeerCall::StartPlaying(at));
        assert_eq!(state.snapshot().clients_playing, 1);
    }
}
