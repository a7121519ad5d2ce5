//! OS pipes, shared output buffers and the tee workers between them.

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::FromRawFd;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CHUNK_SIZE: usize = 8192;
const CHANNEL_DEPTH: usize = 16;

/// Create a close-on-exec pipe, returning `(read, write)` ends.
pub fn os_pipe() -> io::Result<(File, File)> {
    // Both ends get CLOEXEC atomically so a concurrent spawn cannot inherit them
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let read = unsafe { File::from_raw_fd(read) };
    let write = unsafe { File::from_raw_fd(write) };
    Ok((read, write))
}

#[derive(Debug, Default)]
struct BufState {
    bytes: Vec<u8>,
    total: usize,
    closed: bool,
}

/// Byte buffer filled by one producer and read by any number of waiters.
///
/// A non-retaining buffer only counts bytes, which is enough to know
/// whether a stage produced output.
#[derive(Debug)]
pub struct StreamBuffer {
    state: Mutex<BufState>,
    cond: Condvar,
    retain: bool,
}

impl StreamBuffer {
    pub fn new() -> Arc<Self> {
        Self::with_retention(true)
    }

    pub fn with_retention(retain: bool) -> Arc<Self> {
        Arc::new(StreamBuffer {
            state: Mutex::new(BufState::default()),
            cond: Condvar::new(),
            retain,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, chunk: &[u8]) {
        let mut state = self.lock();
        if self.retain {
            state.bytes.extend_from_slice(chunk);
        }
        state.total += chunk.len();
        self.cond.notify_all();
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Total bytes seen, retained or not.
    pub fn total(&self) -> usize {
        self.lock().total
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Bytes after `pos`, waiting up to `timeout` for some to arrive.
    ///
    /// Returns the new bytes and whether the buffer is closed.
    pub fn read_from(&self, pos: usize, timeout: Duration) -> (Vec<u8>, bool) {
        let mut state = self.lock();
        if state.bytes.len() <= pos && !state.closed {
            state = self
                .cond
                .wait_timeout(state, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        let start = pos.min(state.bytes.len());
        (state.bytes[start..].to_vec(), state.closed)
    }
}

/// `Write` adapter feeding a [`StreamBuffer`], optionally echoing live.
pub struct BufferWriter {
    buffer: Arc<StreamBuffer>,
    live: Option<Box<dyn Write + Send>>,
    close_on_drop: bool,
}

impl BufferWriter {
    pub fn new(buffer: Arc<StreamBuffer>, live: Option<Box<dyn Write + Send>>, close_on_drop: bool) -> Self {
        BufferWriter {
            buffer,
            live,
            close_on_drop,
        }
    }
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(live) = self.live.as_mut() {
            // The terminal going away must not break capture
            let _ = live.write_all(buf).and_then(|_| live.flush());
        }
        self.buffer.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.buffer.close();
        }
    }
}

/// Reader and fan-out workers for one captured stream.
#[derive(Debug)]
pub struct TeeHandle {
    reader: JoinHandle<()>,
    fanout: JoinHandle<()>,
}

impl TeeHandle {
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.fanout.is_finished()
    }

    pub fn join(self) {
        let _ = self.reader.join();
        let _ = self.fanout.join();
    }
}

/// Drain `source` continuously, sending each chunk to `live` (if any) and
/// to `buffer`.
///
/// A reader worker pulls chunks into a bounded channel and a fan-out worker
/// delivers them, so a slow terminal never stalls the child's pipe for
/// longer than the channel depth.
pub fn spawn_tee(
    label: &str,
    mut source: File,
    live: Option<Box<dyn Write + Send>>,
    buffer: Arc<StreamBuffer>,
    close_on_eof: bool,
) -> io::Result<TeeHandle> {
    let (tx, rx) = sync_channel::<Vec<u8>>(CHANNEL_DEPTH);
    let reader = thread::Builder::new()
        .name(format!("{}-reader", label))
        .spawn(move || {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!("tee read failed: {}", e);
                        break;
                    }
                }
            }
        })?;
    let fanout = thread::Builder::new()
        .name(format!("{}-tee", label))
        .spawn(move || {
            let mut writer = BufferWriter::new(buffer, live, close_on_eof);
            for chunk in rx {
                let _ = writer.write_all(&chunk);
            }
        })?;
    Ok(TeeHandle { reader, fanout })
}

/// Write `bytes` into `sink` on a worker, closing it afterwards.
pub fn spawn_feeder(bytes: Vec<u8>, mut sink: File) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("feeder".to_string())
        .spawn(move || {
            if let Err(e) = sink.write_all(&bytes) {
                tracing::debug!("feeder write stopped: {}", e);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_round_trip() {
        let (mut r, mut w) = os_pipe().unwrap();
        w.write_all(b"hello").unwrap();
        drop(w);
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        use std::os::fd::AsRawFd;
        let (r, w) = os_pipe().unwrap();
        for fd in [r.as_raw_fd(), w.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[test]
    fn test_tee_fills_buffer_and_closes() {
        let (r, mut w) = os_pipe().unwrap();
        let buffer = StreamBuffer::new();
        let tee = spawn_tee("test", r, None, Arc::clone(&buffer), true).unwrap();
        w.write_all(b"abc\ndef\n").unwrap();
        drop(w);
        tee.join();
        assert!(buffer.is_closed());
        assert_eq!(buffer.contents(), b"abc\ndef\n");
    }

    #[test]
    fn test_tee_does_not_block_on_large_output() {
        let (r, mut w) = os_pipe().unwrap();
        let buffer = StreamBuffer::new();
        let tee = spawn_tee("big", r, None, Arc::clone(&buffer), true).unwrap();
        let data = vec![b'x'; 1 << 20];
        w.write_all(&data).unwrap();
        drop(w);
        tee.join();
        assert_eq!(buffer.total(), 1 << 20);
    }

    #[test]
    fn test_counting_buffer_discards_bytes() {
        let buffer = StreamBuffer::with_retention(false);
        buffer.push(b"xyz");
        assert_eq!(buffer.total(), 3);
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_read_from_times_out_without_data() {
        let buffer = StreamBuffer::new();
        let (bytes, closed) = buffer.read_from(0, Duration::from_millis(5));
        assert!(bytes.is_empty());
        assert!(!closed);
    }
}
