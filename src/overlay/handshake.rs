//! Handshake packet loop
//!
//! Reads packets from the handshake socket, feeds them through the shared
//! [`OverlayState`] and carries out the resulting actions.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::overlay::state::{HandshakeAction, OverlayState};
use crate::protocol::HandshakeMessage;

/// Send `copies` of `message` to `target`, `gap` apart, in the background.
///
/// Individual send failures are dropped; the copies are the retry.
pub fn send_redundant(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    message: HandshakeMessage,
    copies: usize,
    gap: Duration,
) {
    tokio::spawn(async move {
        let packet = message.encode();
        for i in 0..copies {
            if let Err(e) = socket.send_to(&packet, target).await {
                tracing::debug!("Dropped {} to {}: {}", message.tag(), target, e);
            }
            if i + 1 < copies {
                tokio::time::sleep(gap).await;
            }
        }
    });
}

/// Inbound half of the overlay handshake
pub struct HandshakeLoop {
    socket: Arc<UdpSocket>,
    overlay: Arc<Mutex<OverlayState>>,
    /// Port replies are sent to on the remote peer
    reply_port: u16,
    redundant_gap: Duration,
    max_datagram_size: usize,
}

impl HandshakeLoop {
    pub fn new(
        socket: Arc<UdpSocket>,
        overlay: Arc<Mutex<OverlayState>>,
        reply_port: u16,
        redundant_gap: Duration,
        max_datagram_size: usize,
    ) -> Self {
        Self {
            socket,
            overlay,
            reply_port,
            redundant_gap,
            max_datagram_size,
        }
    }

    /// Run until `shutdown` fires or the socket fails.
    ///
    /// Songs this peer must relay are announced on `relay_tx`.
    pub async fn run<F>(
        self,
        has_song_locally: F,
        relay_tx: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) where
        F: Fn(&str) -> bool + Send,
    {
        let mut buf = vec![0u8; self.max_datagram_size];

        loop {
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buf) => r,
                _ = shutdown.cancelled() => break,
            };

            let (n, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Handshake socket closed: {}", e);
                    break;
                }
            };

            let message = match HandshakeMessage::decode(&buf[..n]) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("Ignoring handshake packet from {}: {}", from, e);
                    continue;
                }
            };

            tracing::debug!("Handshake {} from {}", message, from);
            let actions = self
                .overlay
                .lock()
                .on_handshake(message, from.ip(), &has_song_locally);

            for action in actions {
                self.apply(action, &relay_tx);
            }
        }

        tracing::debug!("Handshake loop stopped");
    }

    fn apply(&self, action: HandshakeAction, relay_tx: &mpsc::UnboundedSender<String>) {
        match action {
            HandshakeAction::Reply {
                to,
                message,
                copies,
            } => {
                let target = self.reply_addr(to);
                send_redundant(self.socket.clone(), target, message, copies, self.redundant_gap);
            }
            HandshakeAction::StartRelaying { song } => {
                tracing::info!("Confirmed as relay for {}", song);
                let _ = relay_tx.send(song);
            }
        }
    }

    fn reply_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.reply_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::create_socket;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn recv_message(socket: &UdpSocket) -> HandshakeMessage {
        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        HandshakeMessage::decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_request_then_confirm_over_loopback() {
        let remote = create_socket(SocketAddr::new(LOOPBACK, 0), 64 * 1024).unwrap();
        let remote_port = remote.local_addr().unwrap().port();

        let socket = Arc::new(create_socket(SocketAddr::new(LOOPBACK, 0), 64 * 1024).unwrap());
        let engine_addr = socket.local_addr().unwrap();
        let overlay = Arc::new(Mutex::new(OverlayState::new(1, 5)));
        overlay.lock().begin_listening();

        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let engine = HandshakeLoop::new(socket, overlay.clone(), remote_port, Duration::ZERO, 2048);
        let task = tokio::spawn(engine.run(|_: &str| false, relay_tx, shutdown.clone()));

        remote.send_to(b"request:tune.mp3", engine_addr).await.unwrap();
        assert_eq!(recv_message(&remote).await, HandshakeMessage::Accept);

        remote.send_to(b"confirm", engine_addr).await.unwrap();
        let song = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(song, "tune.mp3");
        assert_eq!(overlay.lock().upstream(), Some(LOOPBACK));

        // A second confirm is stale: five rejects come back
        remote.send_to(b"confirm", engine_addr).await.unwrap();
        for _ in 0..5 {
            assert_eq!(recv_message(&remote).await, HandshakeMessage::Reject);
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
