//! Bidirectional remote-call channel
//!
//! One stream carries calls in both directions: either end may issue a call
//! and await its typed reply while answering calls from the other end. Frames
//! are length-delimited `bincode` [`ControlMessage`]s.
//!
//! Each end is described by a [`Role`]. [`PeerSide`] issues [`TrackerCall`]s
//! and answers [`PeerCall`]s; [`TrackerSide`] is the mirror image. Incoming
//! calls are delivered as [`Incoming`] values on an mpsc queue so the owner
//! decides how to schedule them.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{NetworkError, RpcError};
use crate::protocol::{ControlMessage, PeerCall, PeerReply, TrackerCall, TrackerReply};

/// Which end of the control connection this is
pub trait Role: Send + Sync + Sized + 'static {
    type OutCall: Send + 'static;
    type OutReply: Send + 'static;
    type InCall: Send + 'static;
    type InReply: Send + 'static;

    fn request(id: u64, call: Self::OutCall) -> ControlMessage;
    fn response(id: u64, reply: Result<Self::InReply, String>) -> ControlMessage;
    fn classify(msg: ControlMessage) -> Inbound<Self>;
}

/// A decoded frame, as seen from one role
pub enum Inbound<R: Role> {
    Request { id: u64, call: R::InCall },
    Response { id: u64, reply: Result<R::OutReply, String> },
    /// A frame only the other end should ever receive
    Misdirected(&'static str),
}

/// The peer's end: calls the tracker, answers tracker callbacks
pub struct PeerSide;

/// The tracker's end: answers peer calls, calls back into the peer
pub struct TrackerSide;

impl Role for PeerSide {
    type OutCall = TrackerCall;
    type OutReply = TrackerReply;
    type InCall = PeerCall;
    type InReply = PeerReply;

    fn request(id: u64, call: TrackerCall) -> ControlMessage {
        ControlMessage::TrackerRequest { id, call }
    }

    fn response(id: u64, reply: Result<PeerReply, String>) -> ControlMessage {
        ControlMessage::PeerResponse { id, reply }
    }

    fn classify(msg: ControlMessage) -> Inbound<Self> {
        match msg {
            ControlMessage::PeerRequest { id, call } => Inbound::Request { id, call },
            ControlMessage::TrackerResponse { id, reply } => Inbound::Response { id, reply },
            ControlMessage::TrackerRequest { .. } => Inbound::Misdirected("tracker request"),
            ControlMessage::PeerResponse { .. } => Inbound::Misdirected("peer response"),
        }
    }
}

impl Role for TrackerSide {
    type OutCall = PeerCall;
    type OutReply = PeerReply;
    type InCall = TrackerCall;
    type InReply = TrackerReply;

    fn request(id: u64, call: PeerCall) -> ControlMessage {
        ControlMessage::PeerRequest { id, call }
    }

    fn response(id: u64, reply: Result<TrackerReply, String>) -> ControlMessage {
        ControlMessage::TrackerResponse { id, reply }
    }

    fn classify(msg: ControlMessage) -> Inbound<Self> {
        match msg {
            ControlMessage::TrackerRequest { id, call } => Inbound::Request { id, call },
            ControlMessage::PeerResponse { id, reply } => Inbound::Response { id, reply },
            ControlMessage::PeerRequest { .. } => Inbound::Misdirected("peer request"),
            ControlMessage::TrackerResponse { .. } => Inbound::Misdirected("tracker response"),
        }
    }
}

/// The peer's capability handle onto the tracker
pub type TrackerClient = RpcChannel<PeerSide>;

/// The tracker's capability handle onto one peer
pub type PeerClient = RpcChannel<TrackerSide>;

type PendingReply<R> = oneshot::Sender<Result<<R as Role>::OutReply, String>>;

struct Shared<R: Role> {
    outbound: mpsc::UnboundedSender<ControlMessage>,
    pending: DashMap<u64, PendingReply<R>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// Handle for issuing calls over a control connection. Cheap to clone.
pub struct RpcChannel<R: Role> {
    shared: Arc<Shared<R>>,
}

impl<R: Role> Clone for RpcChannel<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A call received from the other end
pub struct Incoming<R: Role> {
    pub call: R::InCall,
    pub responder: Responder<R>,
}

/// Answers one incoming call. Dropping it unanswered replies with an error
/// so the caller is never left waiting.
pub struct Responder<R: Role> {
    id: u64,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    answered: bool,
    _role: std::marker::PhantomData<R>,
}

impl<R: Role> Responder<R> {
    pub fn respond(mut self, reply: Result<R::InReply, String>) {
        self.answered = true;
        let _ = self.outbound.send(R::response(self.id, reply));
    }
}

impl<R: Role> Drop for Responder<R> {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self
                .outbound
                .send(R::response(self.id, Err("call dropped without a reply".into())));
        }
    }
}

/// Receiver of calls made by the other end
pub type IncomingCalls<R> = mpsc::UnboundedReceiver<Incoming<R>>;

/// Run a control channel over a connected TCP stream
pub fn spawn_tcp<R: Role>(stream: TcpStream) -> (RpcChannel<R>, IncomingCalls<R>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }
    let local_addr = stream.local_addr().ok();
    let peer_addr = stream.peer_addr().ok();
    spawn_with_addrs(stream, local_addr, peer_addr)
}

/// Run a control channel over any byte stream
pub fn spawn<R, S>(stream: S) -> (RpcChannel<R>, IncomingCalls<R>)
where
    R: Role,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    spawn_with_addrs(stream, None, None)
}

fn spawn_with_addrs<R, S>(
    stream: S,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
) -> (RpcChannel<R>, IncomingCalls<R>)
where
    R: Role,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = Framed::new(stream, LengthDelimitedCodec::new()).split::<Bytes>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming<R>>();

    let shared = Arc::new(Shared {
        outbound: out_tx,
        pending: DashMap::new(),
        next_id: AtomicU64::new(0),
        closed: CancellationToken::new(),
        local_addr,
        peer_addr,
    });

    // Writer: serializes every outgoing frame onto the stream
    let writer_closed = shared.closed.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = out_rx.recv() => msg,
                _ = writer_closed.cancelled() => None,
            };
            let Some(msg) = msg else { break };

            match msg.encode() {
                Ok(bytes) => {
                    if let Err(e) = sink.send(Bytes::from(bytes)).await {
                        tracing::warn!("Control channel write failed: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::warn!("Dropping unencodable control frame: {}", e),
            }
        }
        let _ = sink.close().await;
        writer_closed.cancel();
    });

    // Reader: routes replies to waiting callers and calls to the owner
    let reader = shared.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = reader.closed.cancelled() => None,
            };
            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    tracing::warn!("Control channel read failed: {}", e);
                    break;
                }
                None => break,
            };

            let msg = match ControlMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("Dropping control frame: {}", e);
                    continue;
                }
            };

            match R::classify(msg) {
                Inbound::Request { id, call } => {
                    let incoming = Incoming {
                        call,
                        responder: Responder {
                            id,
                            outbound: reader.outbound.clone(),
                            answered: false,
                            _role: std::marker::PhantomData,
                        },
                    };
                    if in_tx.send(incoming).is_err() {
                        tracing::debug!("No handler for incoming call {}", id);
                    }
                }
                Inbound::Response { id, reply } => match reader.pending.remove(&id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(reply);
                    }
                    None => tracing::warn!("Reply to unknown call {}", id),
                },
                Inbound::Misdirected(kind) => {
                    tracing::warn!("Ignoring misdirected {} on control channel", kind)
                }
            }
        }

        reader.closed.cancel();
        reader.pending.clear();
    });

    (RpcChannel { shared }, in_rx)
}

impl<R: Role> RpcChannel<R> {
    /// Issue a call and wait for its reply
    pub async fn call(&self, call: R::OutCall) -> Result<R::OutReply, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        if self.shared.outbound.send(R::request(id, call)).is_err() {
            self.shared.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        tokio::select! {
            biased;
            reply = rx => match reply {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(msg)) => Err(RpcError::Remote(msg)),
                Err(_) => Err(RpcError::Closed),
            },
            _ = self.shared.closed.cancelled() => {
                self.shared.pending.remove(&id);
                Err(RpcError::Closed)
            }
        }
    }

    /// Shut the connection down; pending and future calls fail with `Closed`
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection has ended
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }
}

impl RpcChannel<PeerSide> {
    /// Connect to a tracker
    pub async fn connect(addr: &str) -> Result<(Self, IncomingCalls<PeerSide>), NetworkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        Ok(spawn_tcp(stream))
    }

    async fn expect_ack(&self, call: TrackerCall) -> Result<(), RpcError> {
        let name = call.name();
        match self.call(call).await? {
            TrackerReply::Ack => Ok(()),
            _ => Err(RpcError::UnexpectedReply(name)),
        }
    }

    pub async fn join(&self, identity: &str, songs: Vec<String>) -> Result<(), RpcError> {
        self.expect_ack(TrackerCall::Join {
            identity: identity.to_string(),
            songs,
        })
        .await
    }

    pub async fn leave(&self, identity: &str) -> Result<(), RpcError> {
        self.expect_ack(TrackerCall::Leave {
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn list_songs(&self) -> Result<Vec<String>, RpcError> {
        match self.call(TrackerCall::ListSongs).await? {
            TrackerReply::Songs(songs) => Ok(songs),
            _ => Err(RpcError::UnexpectedReply("list-songs")),
        }
    }

    pub async fn list_peers(&self) -> Result<Vec<String>, RpcError> {
        match self.call(TrackerCall::ListPeers).await? {
            TrackerReply::Peers(peers) => Ok(peers),
            _ => Err(RpcError::UnexpectedReply("list-peers")),
        }
    }

    pub async fn play(&self, song: &str) -> Result<(), RpcError> {
        self.expect_ack(TrackerCall::Play {
            song: song.to_string(),
        })
        .await
    }

    pub async fn ping(&self, identity: &str) -> Result<(), RpcError> {
        self.expect_ack(TrackerCall::Ping {
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn ready_to_play(&self, identity: &str) -> Result<(), RpcError> {
        self.expect_ack(TrackerCall::ReadyToPlay {
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn done_playing(&self, identity: &str) -> Result<(), RpcError> {
        self.expect_ack(TrackerCall::DonePlaying {
            identity: identity.to_string(),
        })
        .await
    }
}
