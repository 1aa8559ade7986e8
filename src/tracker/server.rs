//! Tracker control server
//!
//! Accepts peer control connections and answers their calls. Each call runs
//! on its own task; all of them mutate the one [`TrackerState`] under a lock
//! that is never held across an await.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::error::NetworkError;
use crate::network::rpc::{spawn_tcp, Incoming, IncomingCalls, PeerClient, TrackerSide};
use crate::protocol::{PeerCall, TimePacket, TrackerCall, TrackerReply};
use crate::tracker::state::TrackerState;

/// Tracker state shared by every connection
pub type SharedTrackerState = Arc<Mutex<TrackerState>>;

/// Apply one call to the tables. Returns the reply and the callback to make
/// to the calling peer, if any.
pub fn dispatch(
    state: &mut TrackerState,
    call: TrackerCall,
    start_delay: Option<Duration>,
) -> (TrackerReply, Option<PeerCall>) {
    match call {
        TrackerCall::Join { identity, songs } => {
            if state.join(&identity, songs) {
                tracing::info!("Accepted a new client: {}", identity);
            } else {
                tracing::info!("Client {} re-joined", identity);
            }
            (TrackerReply::Ack, None)
        }
        TrackerCall::Leave { identity } => {
            if state.leave(&identity) {
                tracing::info!("Removing client {}", identity);
            }
            (TrackerReply::Ack, None)
        }
        TrackerCall::ListSongs => (TrackerReply::Songs(state.list_songs()), None),
        TrackerCall::ListPeers => (TrackerReply::Peers(state.list_peers()), None),
        TrackerCall::Play { song } => {
            if state.play(&song) {
                tracing::info!("Enqueued {}", song);
            } else {
                tracing::debug!("Ignoring play of unknown song {}", song);
            }
            (TrackerReply::Ack, None)
        }
        TrackerCall::Ping { identity } => (TrackerReply::Ack, state.ping(&identity)),
        TrackerCall::ReadyToPlay { identity } => {
            let start = match start_delay {
                Some(delay) => TimePacket::after(delay),
                None => TimePacket::default(),
            };
            tracing::info!("{} is ready to play", identity);
            (TrackerReply::Ack, Some(state.ready_to_play(start)))
        }
        TrackerCall::DonePlaying { identity } => {
            state.done_playing(&identity);
            (TrackerReply::Ack, None)
        }
    }
}

/// Tracker listening for peer control connections
pub struct TrackerServer {
    listener: TcpListener,
    state: SharedTrackerState,
    start_delay: Option<Duration>,
}

impl TrackerServer {
    /// Bind the control listener
    pub async fn bind(addr: SocketAddr, config: &TrackerConfig) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(TrackerState::new())),
            start_delay: config.start_delay_ms.map(Duration::from_millis),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn state(&self) -> SharedTrackerState {
        self.state.clone()
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                r = self.listener.accept() => r,
                _ = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!("Control connection from {}", addr);
                    let (client, calls) = spawn_tcp::<TrackerSide>(stream);
                    tokio::spawn(serve_connection(
                        client,
                        calls,
                        self.state.clone(),
                        self.start_delay,
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            }
        }
        tracing::info!("Tracker stopped");
    }
}

async fn serve_connection(
    client: PeerClient,
    mut calls: IncomingCalls<TrackerSide>,
    state: SharedTrackerState,
    start_delay: Option<Duration>,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            incoming = calls.recv() => incoming,
            _ = shutdown.cancelled() => None,
        };
        let Some(incoming) = incoming else { break };

        tokio::spawn(handle_call(
            client.clone(),
            incoming,
            state.clone(),
            start_delay,
        ));
    }

    client.close();
    tracing::debug!(
        "Control connection from {} closed",
        client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "<unknown>".into())
    );
}

async fn handle_call(
    client: PeerClient,
    incoming: Incoming<TrackerSide>,
    state: SharedTrackerState,
    start_delay: Option<Duration>,
) {
    let Incoming { call, responder } = incoming;
    let name = call.name();
    let (reply, callback) = dispatch(&mut state.lock(), call, start_delay);

    // The directive reaches the peer before its call returns
    if let Some(callback) = callback {
        let callback_name = callback.name();
        if let Err(e) = client.call(callback).await {
            tracing::warn!("{} callback after {} failed: {}", callback_name, name, e);
        }
    }
    responder.respond(Ok(reply));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_ping_yields_directive() {
        let mut state = TrackerState::new();
        dispatch(
            &mut state,
            TrackerCall::Join {
                identity: "A".into(),
                songs: vec!["song1.mp3".into()],
            },
            None,
        );
        dispatch(&mut state, TrackerCall::Play { song: "song1".into() }, None);

        let (reply, callback) = dispatch(&mut state, TrackerCall::Ping { identity: "A".into() }, None);
        assert_eq!(reply, TrackerReply::Ack);
        assert_eq!(callback, Some(PeerCall::Seed { song: "song1".into() }));
    }

    #[test]
    fn test_dispatch_schedules_start_when_configured() {
        let mut state = TrackerState::new();
        let (_, callback) = dispatch(
            &mut state,
            TrackerCall::ReadyToPlay { identity: "A".into() },
            Some(Duration::from_secs(30)),
        );
        match callback {
            Some(PeerCall::StartPlaying(at)) => assert!(at.wait_time().is_some()),
            other => panic!("unexpected callback {:?}", other),
        }

        let (_, callback) = dispatch(&mut state, TrackerCall::ReadyToPlay { identity: "B".into() }, None);
        assert_eq!(callback, Some(PeerCall::StartPlaying(TimePacket::default())));
        assert_eq!(state.clients_playing(), 2);
    }

    #[test]
    fn test_dispatch_lists() {
        let mut state = TrackerState::new();
        dispatch(
            &mut state,
            TrackerCall::Join {
                identity: "A".into(),
                songs: vec!["x.mp3".into()],
            },
            None,
        );
        assert_eq!(
            dispatch(&mut state, TrackerCall::ListSongs, None).0,
            TrackerReply::Songs(vec!["x.mp3".into()])
        );
        assert_eq!(
            dispatch(&mut state, TrackerCall::ListPeers, None).0,
            TrackerReply::Peers(vec!["A".into()])
        );
    }
}
