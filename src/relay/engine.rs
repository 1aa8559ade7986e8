//! Relay/buffer engine
//!
//! Moves one song's frames, in order, from their origin (the local decoder
//! for a source-seeder, the upstream relay for everyone else) into the local
//! [`SongBuffer`](crate::relay::SongBuffer) and on to each downstream relay.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::BufferError;
use crate::relay::buffer::SharedSongBuffer;

/// Locks a listening peer onto the first relay it hears from
#[derive(Debug, Default)]
pub struct UpstreamFilter {
    upstream: Option<IpAddr>,
}

impl UpstreamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame from `from` belongs to this session's stream
    pub fn admit(&mut self, from: IpAddr) -> bool {
        match self.upstream {
            Some(upstream) => upstream == from,
            None => {
                tracing::info!("Receiving stream from {}", from);
                self.upstream = Some(from);
                true
            }
        }
    }

    pub fn upstream(&self) -> Option<IpAddr> {
        self.upstream
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub frames_buffered: u64,
    pub bytes_buffered: u64,
    pub frames_forwarded: u64,
    pub send_failures: u64,
}

/// Per-session relay state
pub struct RelayEngine {
    socket: Arc<UdpSocket>,
    buffer: SharedSongBuffer,
    watermark: usize,
    pacing: Duration,
    /// Next frame index owed to each downstream relay
    cursors: HashMap<SocketAddr, usize>,
    signalled: bool,
    stats: RelayStats,
}

impl RelayEngine {
    /// `socket` is used only for sending to downstream relays
    pub fn new(
        socket: Arc<UdpSocket>,
        buffer: SharedSongBuffer,
        watermark: usize,
        pacing: Duration,
    ) -> Self {
        Self {
            socket,
            buffer,
            watermark: watermark.max(1),
            pacing,
            cursors: HashMap::new(),
            signalled: false,
            stats: RelayStats::default(),
        }
    }

    /// Buffer one frame and forward it to `targets`.
    ///
    /// A target seen for the first time is first sent every frame it missed.
    /// Returns true exactly once per session, when the frame count reaches
    /// the watermark.
    pub async fn handle_frame(
        &mut self,
        frame: &[u8],
        targets: &[SocketAddr],
    ) -> Result<bool, BufferError> {
        let count = self.buffer.append(frame)?;
        self.stats.frames_buffered += 1;
        self.stats.bytes_buffered += frame.len() as u64;

        self.forward_pending(targets).await;

        if !self.signalled && count >= self.watermark {
            self.signalled = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Send each target every buffered frame it has not been sent yet
    pub async fn forward_pending(&mut self, targets: &[SocketAddr]) {
        for &target in targets {
            let mut cursor = self.cursors.get(&target).copied().unwrap_or(0);
            loop {
                let frame = self.buffer.lock().frame(cursor).map(<[u8]>::to_vec);
                let Some(frame) = frame else { break };
                self.send(&frame, target).await;
                cursor += 1;
            }
            self.cursors.insert(target, cursor);
        }
    }

    /// The origin is exhausted. Returns true if the watermark was never
    /// reached but some frames were buffered, so readiness is still signalled.
    pub fn finish(&mut self) -> bool {
        if self.signalled || self.buffer.lock().frame_count() == 0 {
            return false;
        }
        self.signalled = true;
        true
    }

    /// No more frames this session: feed late downstream relays what they
    /// missed and let playback run to the end of the buffer
    pub async fn end_stream(&mut self, targets: &[SocketAddr]) {
        self.forward_pending(targets).await;
        self.buffer.complete();
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    async fn send(&mut self, frame: &[u8], target: SocketAddr) {
        match self.socket.send_to(frame, target).await {
            Ok(_) => self.stats.frames_forwarded += 1,
            Err(e) => {
                self.stats.send_failures += 1;
                tracing::debug!("Dropped frame to {}: {}", target, e);
            }
        }
        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
    }
}

/// Relay frames produced locally (source-seeder).
///
/// Stops when `frames` is exhausted or `shutdown` fires; either way the
/// stream is marked complete.
pub async fn relay_source<I, T, R>(
    engine: &mut RelayEngine,
    frames: I,
    mut targets: T,
    mut on_ready: R,
    shutdown: &CancellationToken,
) -> Result<(), BufferError>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
    T: FnMut() -> Vec<SocketAddr>,
    R: FnMut(),
{
    let mut result = Ok(());
    for frame in frames {
        if shutdown.is_cancelled() {
            break;
        }
        let downstream = targets();
        match engine.handle_frame(frame.as_ref(), &downstream).await {
            Ok(true) => on_ready(),
            Ok(false) => {}
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    if result.is_ok() && !shutdown.is_cancelled() {
        if engine.finish() {
            on_ready();
        }
        engine.end_stream(&targets()).await;
        tracing::info!(
            "Source exhausted after {} frames ({} bytes)",
            engine.stats().frames_buffered,
            engine.stats().bytes_buffered
        );
    } else {
        engine.end_stream(&[]).await;
    }
    result
}

/// Relay frames arriving on `socket` from the upstream relay.
///
/// Frames from any host other than the first one heard are discarded. The
/// song ends once the upstream relay has been silent for `idle`; the loop
/// also stops when `shutdown` fires or the socket fails.
pub async fn relay_received<T, R>(
    engine: &mut RelayEngine,
    socket: &UdpSocket,
    max_datagram_size: usize,
    idle: Duration,
    mut targets: T,
    mut on_ready: R,
    shutdown: &CancellationToken,
) -> Result<(), BufferError>
where
    T: FnMut() -> Vec<SocketAddr>,
    R: FnMut(),
{
    let mut filter = UpstreamFilter::new();
    let mut buf = vec![0u8; max_datagram_size];
    let mut result = Ok(());
    let mut drained = false;

    loop {
        let streaming = filter.upstream().is_some();
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
            _ = tokio::time::sleep(idle), if streaming => {
                drained = true;
                break;
            }
        };

        let (n, from) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Frame socket closed: {}", e);
                break;
            }
        };

        if !filter.admit(from.ip()) {
            tracing::debug!("Discarding frame from stale relay {}", from);
            continue;
        }

        let downstream = targets();
        match engine.handle_frame(&buf[..n], &downstream).await {
            Ok(true) => on_ready(),
            Ok(false) => {}
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    if drained {
        tracing::info!(
            "Upstream silent for {:?}, song complete after {} frames",
            idle,
            engine.stats().frames_buffered
        );
        engine.end_stream(&targets()).await;
    } else {
        engine.end_stream(&[]).await;
    }
    tracing::debug!("Frame loop stopped after {} frames", engine.stats().frames_buffered);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::{create_sender, create_socket};
    use crate::relay::buffer::create_shared_buffer;
    use std::io::Read;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn engine(buffer: SharedSongBuffer, watermark: usize) -> RelayEngine {
        let socket = Arc::new(create_sender(LOOPBACK, 256 * 1024).unwrap());
        RelayEngine::new(socket, buffer, watermark, Duration::ZERO)
    }

    async fn recv_frame(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    proptest! {
        #[test]
        fn prop_buffer_preserves_frame_order(
            frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let buffer = create_shared_buffer(64 * 1024);
                let mut relay = engine(buffer.clone(), 300);
                for frame in &frames {
                    relay.handle_frame(frame, &[]).await.unwrap();
                }

                let buffer = buffer.lock();
                assert_eq!(buffer.frame_count(), frames.len());
                for (i, frame) in frames.iter().enumerate() {
                    assert_eq!(buffer.frame(i).unwrap(), frame.as_slice());
                }
                assert_eq!(buffer.contents(), frames.concat().as_slice());
            });
        }
    }

    #[tokio::test]
    async fn test_watermark_fires_once() {
        let mut relay = engine(create_shared_buffer(1024), 3);
        let mut fired = Vec::new();
        for i in 0..6u8 {
            fired.push(relay.handle_frame(&[i], &[]).await.unwrap());
        }
        assert_eq!(fired, vec![false, false, true, false, false, false]);
        assert!(!relay.finish());
    }

    #[tokio::test]
    async fn test_short_source_still_signals_ready() {
        let mut relay = engine(create_shared_buffer(1024), 300);
        let mut ready = 0;
        relay_source(
            &mut relay,
            vec![vec![1u8; 10], vec![2u8; 10]],
            Vec::new,
            || ready += 1,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ready, 1);
        assert!(relay.buffer.lock().is_complete());
    }

    #[tokio::test]
    async fn test_overflow_fails_the_session() {
        let mut relay = engine(create_shared_buffer(15), 300);
        let result = relay_source(
            &mut relay,
            vec![vec![0u8; 10], vec![0u8; 10]],
            Vec::new,
            || {},
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result, Err(BufferError::Overflow { needed: 20, capacity: 15 }));
    }

    #[tokio::test]
    async fn test_late_downstream_catches_up_in_order() {
        let downstream = create_socket(SocketAddr::new(LOOPBACK, 0), 256 * 1024).unwrap();
        let target = downstream.local_addr().unwrap();
        let mut relay = engine(create_shared_buffer(1024), 300);

        for i in 0..3u8 {
            relay.handle_frame(&[i; 4], &[]).await.unwrap();
        }
        for i in 3..5u8 {
            relay.handle_frame(&[i; 4], &[target]).await.unwrap();
        }

        for i in 0..5u8 {
            assert_eq!(recv_frame(&downstream).await, vec![i; 4]);
        }
        assert_eq!(relay.stats().frames_forwarded, 5);
    }

    #[tokio::test]
    async fn test_received_frames_are_buffered_and_forwarded() {
        let inbound = create_socket(SocketAddr::new(LOOPBACK, 0), 256 * 1024).unwrap();
        let inbound_addr = inbound.local_addr().unwrap();
        let downstream = create_socket(SocketAddr::new(LOOPBACK, 0), 256 * 1024).unwrap();
        let target = downstream.local_addr().unwrap();
        let upstream = create_sender(LOOPBACK, 256 * 1024).unwrap();

        let buffer = create_shared_buffer(1024);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let buffer = buffer.clone();
            let shutdown = shutdown.clone();
            async move {
                let mut relay = engine(buffer, 2);
                let mut ready = 0;
                relay_received(
                    &mut relay,
                    &inbound,
                    2048,
                    Duration::from_secs(30),
                    || vec![target],
                    || ready += 1,
                    &shutdown,
                )
                .await
                .unwrap();
                ready
            }
        });

        for i in 0..4u8 {
            upstream.send_to(&[i; 8], inbound_addr).await.unwrap();
            assert_eq!(recv_frame(&downstream).await, vec![i; 8]);
        }

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), 1);
        assert_eq!(buffer.lock().frame_count(), 4);
        assert!(buffer.lock().is_complete());
    }

    #[tokio::test]
    async fn test_upstream_silence_completes_the_song() {
        let inbound = create_socket(SocketAddr::new(LOOPBACK, 0), 256 * 1024).unwrap();
        let inbound_addr = inbound.local_addr().unwrap();
        let upstream = create_sender(LOOPBACK, 256 * 1024).unwrap();
        let buffer = create_shared_buffer(1024);
        let mut stream = buffer.stream();

        let task = tokio::spawn({
            let buffer = buffer.clone();
            async move {
                let mut relay = engine(buffer, 300);
                relay_received(
                    &mut relay,
                    &inbound,
                    2048,
                    Duration::from_millis(100),
                    Vec::new,
                    || {},
                    &CancellationToken::new(),
                )
                .await
            }
        });

        for i in 0..3u8 {
            upstream.send_to(&[i; 8], inbound_addr).await.unwrap();
        }

        // Returns on its own once the upstream goes quiet
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let song = tokio::task::spawn_blocking(move || {
            let mut song = Vec::new();
            stream.read_to_end(&mut song).unwrap();
            song
        })
        .await
        .unwrap();
        assert_eq!(song, [[0u8; 8], [1u8; 8], [2u8; 8]].concat());
    }

    #[tokio::test]
    async fn test_end_of_stream_feeds_late_downstream() {
        let downstream = create_socket(SocketAddr::new(LOOPBACK, 0), 256 * 1024).unwrap();
        let target = downstream.local_addr().unwrap();
        let mut relay = engine(create_shared_buffer(1024), 300);

        for i in 0..3u8 {
            relay.handle_frame(&[i; 4], &[]).await.unwrap();
        }
        relay.end_stream(&[target]).await;

        for i in 0..3u8 {
            assert_eq!(recv_frame(&downstream).await, vec![i; 4]);
        }
        assert!(relay.buffer.lock().is_complete());
    }

    #[tokio::test]
    async fn test_cancelled_source_still_ends_the_stream() {
        let buffer = create_shared_buffer(1024);
        let mut relay = engine(buffer.clone(), 300);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        relay_source(&mut relay, vec![vec![1u8; 4]], Vec::new, || {}, &shutdown)
            .await
            .unwrap();
        assert_eq!(buffer.lock().frame_count(), 0);
        assert!(buffer.lock().is_complete());
    }

    #[test]
    fn test_upstream_filter_locks_first_sender() {
        let mut filter = UpstreamFilter::new();
        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let stale: IpAddr = "10.0.0.9".parse().unwrap();

        assert!(filter.admit(first));
        assert!(!filter.admit(stale));
        assert!(filter.admit(first));
        assert_eq!(filter.upstream(), Some(first));
    }
}
