//! Peer node: tracker membership and the peer's long-running loops
//!
//! Joining binds the handshake and frame ports and spawns four loops that
//! last until `leave`:
//! - the handshake packet loop on the handshake port,
//! - the relay loop, soliciting downstream peers once confirmed as a relay,
//! - the callback loop, answering `seed`/`listen-for-mp3`/`start-playing`,
//! - the ping loop, polling the tracker for directives.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::media::{PlaybackSink, SongCatalog};
use crate::network::rpc::{IncomingCalls, PeerSide, TrackerClient};
use crate::network::udp::{create_sender, create_socket};
use crate::overlay::{HandshakeLoop, OverlayEdges};
use crate::protocol::PeerReply;
use crate::relay::{create_shared_buffer, SharedSongBuffer};

use super::context::{PeerContext, SharedSink};

struct Membership {
    ctx: Arc<PeerContext>,
    tasks: Vec<JoinHandle<()>>,
}

/// A peer process's handle onto the overlay
pub struct PeerNode {
    config: Arc<AppConfig>,
    local_ip: IpAddr,
    catalog: SongCatalog,
    /// Allocated once and reused by every session
    buffer: SharedSongBuffer,
    sink: SharedSink,
    membership: Option<Membership>,
}

impl PeerNode {
    pub fn new(config: AppConfig, local_ip: IpAddr, sink: Box<dyn PlaybackSink>) -> Self {
        let catalog = SongCatalog::new(config.peer.songs_dir.clone());
        let buffer = create_shared_buffer(config.relay.buffer_capacity);
        Self {
            config: Arc::new(config),
            local_ip,
            catalog,
            buffer,
            sink: Arc::new(Mutex::new(sink)),
            membership: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.membership.is_some()
    }

    /// `ip:port` this peer registered under
    pub fn identity(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.ctx.identity())
    }

    /// This peer's role and relay edges in the current session
    pub fn edges(&self) -> Option<OverlayEdges> {
        self.membership.as_ref().map(|m| m.ctx.overlay.lock().edges())
    }

    pub fn catalog(&self) -> &SongCatalog {
        &self.catalog
    }

    /// Connect to a tracker and register. Leaves the current tracker first.
    pub async fn join(&mut self, tracker_addr: &str) -> Result<()> {
        if self.is_joined() {
            self.leave().await;
        }

        let (tracker, calls) = TrackerClient::connect(tracker_addr).await?;
        let control_port = tracker
            .local_addr()
            .map(|addr| addr.port())
            .ok_or_else(|| Error::Config("control connection has no local address".into()))?;
        let identity = SocketAddr::new(self.local_ip, control_port).to_string();

        let network = &self.config.network;
        let (handshake_socket, frame_socket, frame_sender) = match self.bind_sockets() {
            Ok((handshake, frames, sender)) => {
                (Arc::new(handshake), Arc::new(frames), Arc::new(sender))
            }
            Err(e) => {
                tracker.close();
                return Err(e);
            }
        };

        let ctx = Arc::new(PeerContext::new(
            self.config.clone(),
            identity.clone(),
            self.local_ip,
            tracker.clone(),
            self.catalog.clone(),
            self.buffer.clone(),
            self.sink.clone(),
            frame_sender,
            frame_socket,
        ));

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let handshake = HandshakeLoop::new(
            handshake_socket,
            ctx.overlay.clone(),
            network.handshake_port,
            self.config.overlay.redundant_send_gap(),
            network.max_datagram_size,
        );
        let holder = ctx.clone();

        let tasks = vec![
            tokio::spawn(handshake.run(
                move |song: &str| holder.has_song(song),
                relay_tx,
                ctx.shutdown.clone(),
            )),
            tokio::spawn(relay_loop(ctx.clone(), relay_rx)),
            tokio::spawn(callback_loop(ctx.clone(), calls)),
            tokio::spawn(ping_loop(ctx.clone())),
        ];

        let songs = ctx.local_songs.clone();
        let membership = Membership {
            ctx: ctx.clone(),
            tasks,
        };

        if let Err(e) = tracker.join(&identity, songs.clone()).await {
            shutdown_membership(membership).await;
            return Err(e.into());
        }

        tracing::info!("Joined tracker {} as {} with {} song(s)", tracker_addr, identity, songs.len());
        self.membership = Some(membership);
        Ok(())
    }

    /// Leave the tracker and tear everything down. A no-op when not joined.
    pub async fn leave(&mut self) {
        let Some(membership) = self.membership.take() else {
            return;
        };
        let ctx = membership.ctx.clone();

        ctx.sink.lock().stop();
        if let Err(e) = ctx.tracker.leave(&ctx.identity).await {
            tracing::warn!("leave failed: {}", e);
        }

        let grace = self.config.peer.leave_grace();
        tracing::info!("Leaving the tracker in {:?}", grace);
        tokio::time::sleep(grace).await;

        shutdown_membership(membership).await;
        tracing::info!("Left the tracker");
    }

    pub async fn list_songs(&self) -> Result<Vec<String>> {
        Ok(self.tracker()?.list_songs().await?)
    }

    pub async fn list_peers(&self) -> Result<Vec<String>> {
        Ok(self.tracker()?.list_peers().await?)
    }

    /// Ask the tracker to enqueue `song`
    pub async fn play(&self, song: &str) -> Result<()> {
        Ok(self.tracker()?.play(song).await?)
    }

    /// Handshake port, frame port and the outbound frame socket
    fn bind_sockets(&self) -> Result<(UdpSocket, UdpSocket, UdpSocket)> {
        let network = &self.config.network;
        let handshake = create_socket(
            SocketAddr::new(self.local_ip, network.handshake_port),
            network.socket_buffer_size,
        )?;
        let frames = create_socket(
            SocketAddr::new(self.local_ip, network.frame_port),
            network.socket_buffer_size,
        )?;
        let sender = create_sender(self.local_ip, network.socket_buffer_size)?;
        Ok((handshake, frames, sender))
    }

    fn tracker(&self) -> Result<&TrackerClient> {
        self.membership
            .as_ref()
            .map(|m| &m.ctx.tracker)
            .ok_or(Error::NotConnected)
    }
}

async fn shutdown_membership(membership: Membership) {
    let ctx = membership.ctx;
    ctx.shutdown.cancel();
    ctx.stop_session().await;
    ctx.overlay.lock().reset();
    ctx.tracker.close();

    for task in membership.tasks {
        if let Err(e) = task.await {
            tracing::warn!("Peer task failed: {}", e);
        }
    }
}

async fn relay_loop(ctx: Arc<PeerContext>, mut songs: mpsc::UnboundedReceiver<String>) {
    loop {
        let song = tokio::select! {
            song = songs.recv() => song,
            _ = ctx.shutdown.cancelled() => None,
        };
        let Some(song) = song else { break };
        ctx.start_relaying(song);
    }
}

async fn callback_loop(ctx: Arc<PeerContext>, mut calls: IncomingCalls<PeerSide>) {
    loop {
        let incoming = tokio::select! {
            incoming = calls.recv() => incoming,
            _ = ctx.shutdown.cancelled() => None,
        };
        let Some(incoming) = incoming else { break };

        tracing::debug!("Tracker called {}", incoming.call.name());
        ctx.on_callback(incoming.call);
        incoming.responder.respond(Ok(PeerReply::Ack));
    }
}

async fn ping_loop(ctx: Arc<PeerContext>) {
    let interval = ctx.config.peer.ping_interval();
    loop {
        if let Err(e) = ctx.tracker.ping(&ctx.identity).await {
            if ctx.tracker.is_closed() {
                if !ctx.shutdown.is_cancelled() {
                    tracing::warn!("Lost connection to the tracker: {}", e);
                }
                break;
            }
            tracing::debug!("ping failed: {}", e);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = ctx.shutdown.cancelled() => break,
        }
    }
}
