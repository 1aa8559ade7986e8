//! Solicitation: a seeding peer asks every other member to be fed.
//!
//! One retry task per candidate re-sends `request:<song>` until the
//! candidate's entry in the response map flips to answered. The caller is
//! blocked until every candidate has answered.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::NetworkError;
use crate::network::udp::create_sender;
use crate::overlay::state::OverlayState;
use crate::protocol::HandshakeMessage;

/// Distinct member hosts other than `own_ip`, in membership order.
///
/// Identities are `ip:port` strings; unparsable ones are skipped.
pub fn candidates(identities: &[String], own_ip: IpAddr) -> Vec<IpAddr> {
    let mut hosts = Vec::new();
    for identity in identities {
        let ip = match identity.parse::<SocketAddr>() {
            Ok(addr) => addr.ip(),
            Err(_) => match identity.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => {
                    tracing::warn!("Skipping malformed peer identity {:?}", identity);
                    continue;
                }
            },
        };
        if ip != own_ip && !hosts.contains(&ip) {
            hosts.push(ip);
        }
    }
    hosts
}

/// Solicitation settings
#[derive(Debug, Clone)]
pub struct Solicitation {
    pub song: String,
    /// Handshake port on the candidates
    pub port: u16,
    pub local_ip: IpAddr,
    pub interval: Duration,
    pub socket_buffer_size: usize,
}

impl Solicitation {
    /// Solicit every candidate; returns once all have answered.
    ///
    /// There is no timeout: an unresponsive candidate blocks until
    /// `shutdown` fires.
    pub async fn run(
        &self,
        overlay: Arc<Mutex<OverlayState>>,
        candidates: &[IpAddr],
        shutdown: &CancellationToken,
    ) -> Result<(), NetworkError> {
        overlay.lock().begin_solicitation(candidates);
        tracing::info!("Soliciting {} peer(s) for {}", candidates.len(), self.song);

        let packet = HandshakeMessage::request(self.song.as_str()).encode();
        let mut tasks = JoinSet::new();

        for &candidate in candidates {
            let socket = create_sender(self.local_ip, self.socket_buffer_size)?;
            let target = SocketAddr::new(candidate, self.port);
            let overlay = overlay.clone();
            let packet = packet.clone();
            let interval = self.interval;
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                loop {
                    let answered = overlay.lock().has_responded(candidate);
                    if answered {
                        break;
                    }
                    if let Err(e) = socket.send_to(&packet, target).await {
                        tracing::debug!("Request to {} failed: {}", target, e);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Solicitation task failed: {}", e);
            }
        }

        tracing::info!("Solicitation for {} complete", self.song);
        Ok(())
    }
}
