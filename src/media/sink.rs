//! Playback sink
//!
//! Plays the current song from a [`SongStream`] while it is still being
//! relayed in. The `rodio` output stream is not `Send`, so [`RodioSink`]
//! keeps it on a dedicated thread and drives it over a command channel.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::AudioError;
use crate::relay::SongStream;

/// Output for the current song
pub trait PlaybackSink: Send {
    /// Hand over the song; replaces anything previously loaded
    fn load(&mut self, song: SongStream) -> Result<(), AudioError>;

    /// Start playing what was loaded
    fn play(&mut self) -> Result<(), AudioError>;

    /// Still producing sound
    fn is_playing(&self) -> bool;

    /// Halt playback early
    fn stop(&mut self);

    /// Release the loaded song
    fn free(&mut self);
}

/// Sink without an output device. Consumes the song as fast as it arrives,
/// so playback lasts until the stream ends.
#[derive(Default)]
pub struct SilentSink {
    loaded: Option<SongStream>,
    playing: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    plays: u64,
}

impl SilentSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `play` calls that started
    pub fn plays(&self) -> u64 {
        self.plays
    }
}

impl PlaybackSink for SilentSink {
    fn load(&mut self, song: SongStream) -> Result<(), AudioError> {
        self.loaded = Some(song);
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        let song = self.loaded.take().ok_or(AudioError::NothingLoaded)?;

        let stopped = Arc::new(AtomicBool::new(false));
        self.stopped = stopped.clone();
        self.playing.store(true, Ordering::SeqCst);

        let playing = self.playing.clone();
        let spawned = thread::Builder::new()
            .name("silent-playback".into())
            .spawn(move || {
                let played = drain(song, &stopped);
                tracing::debug!("Silent sink played {} bytes", played);
                playing.store(false, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            self.playing.store(false, Ordering::SeqCst);
            return Err(AudioError::DeviceUnavailable(e.to_string()));
        }

        self.plays += 1;
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn free(&mut self) {
        self.loaded = None;
    }
}

/// Read `song` to its end or until `stopped`; returns the bytes read
fn drain(mut song: SongStream, stopped: &AtomicBool) -> usize {
    let mut chunk = [0u8; 4096];
    let mut total = 0;
    while !stopped.load(Ordering::SeqCst) {
        match song.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Silent playback ended early: {}", e);
                break;
            }
        }
    }
    total
}

/// The default sink for this build: the sound card when available, silence
/// otherwise
pub fn default_sink() -> Box<dyn PlaybackSink> {
    #[cfg(feature = "playback")]
    {
        match RodioSink::new() {
            Ok(sink) => return Box::new(sink),
            Err(e) => tracing::warn!("Audio output unavailable, playing silently: {}", e),
        }
    }
    Box::new(SilentSink::new())
}

#[cfg(feature = "playback")]
pub use self::rodio_sink::RodioSink;

#[cfg(feature = "playback")]
mod rodio_sink {
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
    use rodio::{Decoder, OutputStream, Sink};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::PlaybackSink;
    use crate::error::AudioError;
    use crate::relay::SongStream;

    /// How often the output thread checks whether the song ran out
    const POLL_INTERVAL: Duration = Duration::from_millis(5);

    type Reply = Sender<Result<(), AudioError>>;

    enum SinkCommand {
        Load(SongStream, Reply),
        Play(Reply),
        Stop,
        Free,
        Shutdown,
    }

    /// Sound card output through `rodio`
    pub struct RodioSink {
        commands: Sender<SinkCommand>,
        playing: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
    }

    impl RodioSink {
        /// Open the default output device
        pub fn new() -> Result<Self, AudioError> {
            let (commands, command_rx) = bounded::<SinkCommand>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
            let playing = Arc::new(AtomicBool::new(false));

            let thread_playing = playing.clone();
            let handle = thread::Builder::new()
                .name("playback".into())
                .spawn(move || output_thread(command_rx, thread_playing, ready_tx))
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

            ready_rx.recv().map_err(|_| AudioError::ThreadStopped)??;

            Ok(Self {
                commands,
                playing,
                thread_handle: Some(handle),
            })
        }

        fn request(&self, make: impl FnOnce(Reply) -> SinkCommand) -> Result<(), AudioError> {
            let (tx, rx) = bounded(1);
            self.commands
                .send(make(tx))
                .map_err(|_| AudioError::ThreadStopped)?;
            rx.recv().map_err(|_| AudioError::ThreadStopped)?
        }
    }

    impl PlaybackSink for RodioSink {
        fn load(&mut self, song: SongStream) -> Result<(), AudioError> {
            self.request(|reply| SinkCommand::Load(song, reply))
        }

        fn play(&mut self) -> Result<(), AudioError> {
            self.request(SinkCommand::Play)
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        fn stop(&mut self) {
            let _ = self.commands.send(SinkCommand::Stop);
        }

        fn free(&mut self) {
            let _ = self.commands.send(SinkCommand::Free);
        }
    }

    impl Drop for RodioSink {
        fn drop(&mut self) {
            let _ = self.commands.send(SinkCommand::Shutdown);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn output_thread(
        commands: Receiver<SinkCommand>,
        playing: Arc<AtomicBool>,
        ready: Sender<Result<(), AudioError>>,
    ) {
        let (_stream, handle) = match OutputStream::try_default() {
            Ok(output) => output,
            Err(e) => {
                let _ = ready.send(Err(AudioError::DeviceUnavailable(e.to_string())));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let mut loaded: Option<Decoder<SongStream>> = None;
        let mut sink: Option<Sink> = None;

        loop {
            match commands.recv_timeout(POLL_INTERVAL) {
                Ok(SinkCommand::Load(song, reply)) => {
                    let result = Decoder::new(song)
                        .map(|source| loaded = Some(source))
                        .map_err(|e| AudioError::DecodeFailed(e.to_string()));
                    let _ = reply.send(result);
                }
                Ok(SinkCommand::Play(reply)) => {
                    let result = match loaded.take() {
                        None => Err(AudioError::NothingLoaded),
                        Some(source) => match Sink::try_new(&handle) {
                            Ok(new_sink) => {
                                new_sink.append(source);
                                playing.store(true, Ordering::SeqCst);
                                sink = Some(new_sink);
                                Ok(())
                            }
                            Err(e) => Err(AudioError::DeviceUnavailable(e.to_string())),
                        },
                    };
                    let _ = reply.send(result);
                }
                Ok(SinkCommand::Stop) => {
                    if let Some(sink) = &sink {
                        sink.stop();
                    }
                    playing.store(false, Ordering::SeqCst);
                }
                Ok(SinkCommand::Free) => {
                    sink = None;
                    loaded = None;
                    playing.store(false, Ordering::SeqCst);
                }
                Ok(SinkCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if sink.as_ref().is_some_and(Sink::empty) {
                playing.store(false, Ordering::SeqCst);
            }
        }

        playing.store(false, Ordering::SeqCst);
        tracing::debug!("Playback thread stopped");
    }
}
