//! Per-membership peer state and the tracker callback handlers
//!
//! A [`PeerContext`] lives from `join` to `leave`. Within it, each playback
//! session (seed or listen, then play) runs as a set of tasks sharing one
//! cancellation token; ending the session cancels and awaits them before the
//! buffer and overlay edges are reset.

use parking_lot::Mutex;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::media::{song_matches, Mp3Frames, PlaybackSink, SongCatalog};
use crate::network::rpc::TrackerClient;
use crate::overlay::{candidates, OverlayState, Solicitation};
use crate::protocol::{PeerCall, TimePacket};
use crate::relay::{relay_received, relay_source, RelayEngine, SharedSongBuffer};

/// Playback output shared by the session and `leave`
pub type SharedSink = Arc<Mutex<Box<dyn PlaybackSink>>>;

/// Tasks of the current playback session
struct SessionTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SessionTasks {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            handles: Vec::new(),
        }
    }
}

/// Everything a joined peer's tasks share
pub struct PeerContext {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) identity: String,
    pub(crate) local_ip: IpAddr,
    pub(crate) tracker: TrackerClient,
    pub(crate) catalog: SongCatalog,
    /// Songs advertised at join
    pub(crate) local_songs: Vec<String>,
    pub(crate) overlay: Arc<Mutex<OverlayState>>,
    pub(crate) buffer: SharedSongBuffer,
    pub(crate) sink: SharedSink,
    /// Outbound socket for forwarded frames
    pub(crate) frame_sender: Arc<UdpSocket>,
    /// Bound on the frame port for the whole membership, so frames that
    /// arrive before the listener session starts are queued, not lost
    pub(crate) frame_socket: Arc<UdpSocket>,
    /// Fires on leave
    pub(crate) shutdown: CancellationToken,
    session: Mutex<SessionTasks>,
}

impl PeerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<AppConfig>,
        identity: String,
        local_ip: IpAddr,
        tracker: TrackerClient,
        catalog: SongCatalog,
        buffer: SharedSongBuffer,
        sink: SharedSink,
        frame_sender: Arc<UdpSocket>,
        frame_socket: Arc<UdpSocket>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let overlay = OverlayState::new(config.overlay.max_fanout, config.overlay.redundant_sends);
        let local_songs = catalog.songs();

        Self {
            identity,
            local_ip,
            tracker,
            catalog,
            local_songs,
            overlay: Arc::new(Mutex::new(overlay)),
            buffer,
            sink,
            frame_sender,
            frame_socket,
            session: Mutex::new(SessionTasks::new(&shutdown)),
            shutdown,
            config,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this peer advertised `song`
    pub fn has_song(&self, song: &str) -> bool {
        self.local_songs.iter().any(|s| song_matches(song, s))
    }

    /// Handle a tracker callback. Long-running work is spawned so the call
    /// can be acknowledged at once.
    pub fn on_callback(self: &Arc<Self>, call: PeerCall) {
        match call {
            PeerCall::Seed { song } => {
                if !self.overlay.lock().begin_source(&song) {
                    return;
                }
                tracing::info!("Seeding {}", song);
                let ctx = self.clone();
                self.spawn_session(move |token| async move {
                    if let Err(e) = ctx.seed(song, &token).await {
                        tracing::error!("Seeding failed: {}", e);
                    }
                });
            }
            PeerCall::ListenForMp3 => self.start_listening(),
            PeerCall::StartPlaying(at) => {
                let ctx = self.clone();
                tokio::spawn(async move { ctx.play(at).await });
            }
        }
    }

    /// Run the frame loop for this session, once
    fn start_listening(self: &Arc<Self>) {
        if !self.overlay.lock().begin_listening() {
            return;
        }
        tracing::info!("Listening for frames");
        let ctx = self.clone();
        self.spawn_session(move |token| async move {
            if let Err(e) = ctx.listen(&token).await {
                tracing::error!("Frame loop failed: {}", e);
            }
        });
    }

    /// This peer was confirmed as a relay for `song`: its upstream is about
    /// to send, so make sure frames are being read, then find its own
    /// downstream
    pub fn start_relaying(self: &Arc<Self>, song: String) {
        self.start_listening();
        let ctx = self.clone();
        self.spawn_session(move |token| async move {
            if let Err(e) = ctx.solicit(song, &token).await {
                tracing::warn!("Relay solicitation failed: {}", e);
            }
        });
    }

    fn spawn_session<F, Fut>(&self, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut session = self.session.lock();
        let handle = tokio::spawn(make(session.token.clone()));
        session.handles.push(handle);
    }

    /// Cancel and await the session's tasks, then rewind the buffer and
    /// discard frames still queued on the frame port
    pub(crate) async fn stop_session(&self) {
        let ended = {
            let mut session = self.session.lock();
            std::mem::replace(&mut *session, SessionTasks::new(&self.shutdown))
        };
        ended.token.cancel();
        for handle in ended.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Session task failed: {}", e);
            }
        }
        self.buffer.reset();

        let mut scratch = vec![0u8; self.config.network.max_datagram_size];
        let mut stale = 0;
        while self.frame_socket.try_recv_from(&mut scratch).is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!("Discarded {} stale frames", stale);
        }
    }

    /// Solicit every other member for `song`
    async fn solicit(&self, song: String, token: &CancellationToken) -> Result<()> {
        let members = self.tracker.list_peers().await?;
        let targets = candidates(&members, self.local_ip);

        let solicitation = Solicitation {
            song,
            port: self.config.network.handshake_port,
            local_ip: self.local_ip,
            interval: self.config.overlay.solicit_interval(),
            socket_buffer_size: self.config.network.socket_buffer_size,
        };
        solicitation.run(self.overlay.clone(), &targets, token).await?;
        Ok(())
    }

    /// Source-seeder session: wire the downstream edges, then stream the
    /// local file through the relay engine
    async fn seed(self: &Arc<Self>, song: String, token: &CancellationToken) -> Result<()> {
        let path = self
            .catalog
            .resolve(&song)
            .ok_or_else(|| Error::SongNotFound(song.clone()))?;
        let frames = Mp3Frames::open(&path).await?;

        self.solicit(song, token).await?;
        if token.is_cancelled() {
            return Ok(());
        }

        let mut engine = self.relay_engine();
        let result = relay_source(
            &mut engine,
            frames,
            || self.downstream_targets(),
            || self.signal_ready(),
            token,
        )
        .await;

        self.finish_relay(&mut engine, result)
    }

    /// Listener session: buffer frames from the upstream relay and forward
    /// them to this peer's own downstream, once it has one
    async fn listen(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let mut engine = self.relay_engine();
        let result = relay_received(
            &mut engine,
            &self.frame_socket,
            self.config.network.max_datagram_size,
            self.config.relay.end_of_stream_idle(),
            || self.downstream_targets(),
            || self.signal_ready(),
            token,
        )
        .await;

        self.finish_relay(&mut engine, result)
    }

    fn finish_relay(
        self: &Arc<Self>,
        engine: &mut RelayEngine,
        result: std::result::Result<(), crate::error::BufferError>,
    ) -> Result<()> {
        if let Err(e) = result {
            // The session stops relaying; whatever was buffered still plays
            // so the round can close
            if engine.finish() {
                self.signal_ready();
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn relay_engine(&self) -> RelayEngine {
        RelayEngine::new(
            self.frame_sender.clone(),
            self.buffer.clone(),
            self.config.relay.watermark_frames,
            self.config.relay.pacing(),
        )
    }

    fn downstream_targets(&self) -> Vec<SocketAddr> {
        let port = self.config.network.frame_port;
        self.overlay
            .lock()
            .downstream()
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect()
    }

    fn signal_ready(self: &Arc<Self>) {
        tracing::info!("Prebuffer reached, ready to play");
        let ctx = self.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.tracker.ready_to_play(&ctx.identity).await {
                tracing::warn!("ready-to-play failed: {}", e);
            }
        });
    }

    /// Play the song as it arrives, then end the session and report
    /// completion. Playback runs until the buffer is complete and read out.
    async fn play(&self, at: TimePacket) {
        if let Some(wait) = at.wait_time() {
            tracing::debug!("Starting playback in {:?}", wait);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }

        let song = self.buffer.stream();
        tracing::info!("Playing with {} bytes buffered", self.buffer.lock().len());
        let started = {
            let mut sink = self.sink.lock();
            sink.load(song).and_then(|_| sink.play())
        };

        match started {
            Ok(()) => {
                let poll = self.config.peer.playback_poll();
                loop {
                    let playing = self.sink.lock().is_playing();
                    if !playing {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
            Err(e) => tracing::error!("Playback failed: {}", e),
        }

        self.sink.lock().free();
        self.stop_session().await;

        if !self.shutdown.is_cancelled() {
            if let Err(e) = self.tracker.done_playing(&self.identity).await {
                tracing::warn!("done-playing failed: {}", e);
            }
        }
        self.overlay.lock().reset();
        tracing::info!("Playback session finished");
    }
}
