//! Local audio buffer
//!
//! A fixed-capacity arena holding the frames of the current song back to
//! back. The write cursor only moves forward within a session and is reset at
//! teardown; the allocation is kept for the next session.
//!
//! Playback does not wait for the whole song: a [`SongStream`] reads the
//! buffer while the relay is still appending to it, blocking at the write
//! cursor until more frames arrive or the stream is marked complete.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::Arc;

use crate::error::BufferError;

/// Song buffer with frame boundaries
pub struct SongBuffer {
    data: Vec<u8>,
    capacity: usize,
    /// Byte range of each frame, in arrival order
    frames: Vec<Range<usize>>,
    /// No more frames will be appended this session
    complete: bool,
    /// Bumped by every reset
    session: u64,
}

impl SongBuffer {
    /// Create a buffer able to hold `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            frames: Vec::new(),
            complete: false,
            session: 0,
        }
    }

    /// Append a frame at the write cursor.
    ///
    /// Returns the new frame count. A frame that does not fit is refused and
    /// leaves the buffer untouched.
    pub fn append(&mut self, frame: &[u8]) -> Result<usize, BufferError> {
        let start = self.data.len();
        let end = start + frame.len();
        if end > self.capacity {
            return Err(BufferError::Overflow {
                needed: end,
                capacity: self.capacity,
            });
        }

        self.data.extend_from_slice(frame);
        self.frames.push(start..end);
        Ok(self.frames.len())
    }

    /// The `index`th frame received this session
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        self.frames.get(index).map(|r| &self.data[r.clone()])
    }

    /// Everything written so far
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Write cursor position in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the origin of this session's frames is exhausted
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Rewind the cursor and frame counter; keeps the allocation
    pub fn reset(&mut self) {
        self.data.clear();
        self.frames.clear();
        self.complete = false;
        self.session += 1;
    }
}

struct Shared {
    buffer: Mutex<SongBuffer>,
    /// Signalled on every append, completion and reset
    changed: Condvar,
}

/// Buffer shared between the relay and playback
#[derive(Clone)]
pub struct SharedSongBuffer {
    shared: Arc<Shared>,
}

impl SharedSongBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(SongBuffer::new(capacity)),
                changed: Condvar::new(),
            }),
        }
    }

    /// Direct access for reads. Writers go through the methods below so
    /// that waiting streams are woken.
    pub fn lock(&self) -> MutexGuard<'_, SongBuffer> {
        self.shared.buffer.lock()
    }

    /// Append a frame and wake streams waiting at the write cursor
    pub fn append(&self, frame: &[u8]) -> Result<usize, BufferError> {
        let count = self.shared.buffer.lock().append(frame)?;
        self.shared.changed.notify_all();
        Ok(count)
    }

    /// Mark the song as fully received; streams end at the write cursor
    pub fn complete(&self) {
        self.shared.buffer.lock().complete = true;
        self.shared.changed.notify_all();
    }

    /// Rewind for the next session. Streams opened before the reset end.
    pub fn reset(&self) {
        self.shared.buffer.lock().reset();
        self.shared.changed.notify_all();
    }

    /// A reader over this session's song, starting at the first byte
    pub fn stream(&self) -> SongStream {
        let session = self.lock().session;
        SongStream {
            buffer: self.clone(),
            session,
            position: 0,
        }
    }
}

/// Create a new shared song buffer
pub fn create_shared_buffer(capacity: usize) -> SharedSongBuffer {
    SharedSongBuffer::new(capacity)
}

/// Blocking reader over a song that may still be arriving.
///
/// Reads past the write cursor wait for more frames. End of file is reported
/// once the buffer is complete and fully read, or after the buffer is reset.
pub struct SongStream {
    buffer: SharedSongBuffer,
    session: u64,
    position: usize,
}

impl SongStream {
    /// Bytes handed out so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Wait until the song is complete and return its length, or `None`
    /// if the buffer was reset first
    fn wait_complete(&self) -> Option<usize> {
        let mut buffer = self.buffer.shared.buffer.lock();
        loop {
            if buffer.session != self.session {
                return None;
            }
            if buffer.complete {
                return Some(buffer.len());
            }
            self.buffer.shared.changed.wait(&mut buffer);
        }
    }
}

impl Read for SongStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut buffer = self.buffer.shared.buffer.lock();
        loop {
            if buffer.session != self.session {
                return Ok(0);
            }

            let available = buffer.len().saturating_sub(self.position);
            if available > 0 {
                let n = available.min(out.len());
                out[..n].copy_from_slice(&buffer.contents()[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }

            if buffer.complete {
                return Ok(0);
            }
            self.buffer.shared.changed.wait(&mut buffer);
        }
    }
}

impl Seek for SongStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(offset) => {
                let target = usize::try_from(offset).map_err(|_| invalid_seek())?;
                self.position = target;
                return Ok(offset);
            }
            SeekFrom::Current(offset) => (self.position, offset),
            SeekFrom::End(offset) => (self.wait_complete().unwrap_or(self.position), offset),
        };

        let target = i64::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(offset))
            .filter(|target| *target >= 0)
            .ok_or_else(invalid_seek)?;
        self.position = usize::try_from(target).map_err(|_| invalid_seek())?;
        Ok(self.position as u64)
    }
}

fn invalid_seek() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "seek outside the song")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_append_tracks_frames() {
        let mut buffer = SongBuffer::new(16);
        assert_eq!(buffer.append(b"abc").unwrap(), 1);
        assert_eq!(buffer.append(b"de").unwrap(), 2);

        assert_eq!(buffer.contents(), b"abcde");
        assert_eq!(buffer.frame(1), Some(&b"de"[..]));
        assert_eq!(buffer.frame(2), None);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_overflow_is_refused_without_corruption() {
        let mut buffer = SongBuffer::new(4);
        buffer.append(b"abc").unwrap();

        let err = buffer.append(b"de").unwrap_err();
        assert_eq!(err, BufferError::Overflow { needed: 5, capacity: 4 });
        assert_eq!(buffer.contents(), b"abc");
        assert_eq!(buffer.frame_count(), 1);
    }

    #[test]
    fn test_reset_rewinds_for_next_session() {
        let mut buffer = SongBuffer::new(8);
        buffer.append(b"12345678").unwrap();
        assert_eq!(buffer.len(), buffer.capacity());

        buffer.reset();
        assert!(buffer.is_empty());
        assert!(!buffer.is_complete());
        assert_eq!(buffer.frame_count(), 0);
        assert_eq!(buffer.append(b"xy").unwrap(), 1);
        assert_eq!(buffer.contents(), b"xy");
    }

    #[test]
    fn test_stream_follows_writer_until_complete() {
        let shared = create_shared_buffer(1024);
        shared.append(b"head").unwrap();
        let mut stream = shared.stream();

        let writer = thread::spawn({
            let shared = shared.clone();
            move || {
                for chunk in [&b"-one"[..], b"-two", b"-three"] {
                    thread::sleep(Duration::from_millis(10));
                    shared.append(chunk).unwrap();
                }
                shared.complete();
            }
        });

        let mut song = Vec::new();
        stream.read_to_end(&mut song).unwrap();
        writer.join().unwrap();

        assert_eq!(song, b"head-one-two-three");
        assert_eq!(stream.position(), song.len());
    }

    #[test]
    fn test_reset_ends_a_waiting_stream() {
        let shared = create_shared_buffer(64);
        shared.append(b"partial").unwrap();
        let mut stream = shared.stream();

        let reader = thread::spawn(move || {
            let mut song = Vec::new();
            stream.read_to_end(&mut song).map(|_| song)
        });

        thread::sleep(Duration::from_millis(20));
        shared.reset();
        assert_eq!(reader.join().unwrap().unwrap(), b"partial");

        // The next session's frames are not visible to the old stream
        shared.append(b"next").unwrap();
        assert_eq!(shared.lock().contents(), b"next");
    }

    #[test]
    fn test_stream_seeks_within_the_song() {
        let shared = create_shared_buffer(64);
        shared.append(b"0123456789").unwrap();
        shared.complete();

        let mut stream = shared.stream();
        let mut byte = [0u8; 1];

        assert_eq!(stream.seek(SeekFrom::Start(4)).unwrap(), 4);
        stream.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"4");

        assert_eq!(stream.seek(SeekFrom::End(-1)).unwrap(), 9);
        stream.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"9");

        assert_eq!(stream.seek(SeekFrom::Current(-3)).unwrap(), 7);
        assert!(stream.seek(SeekFrom::Current(-8)).is_err());
    }
}
