//! The buffered socket file: read/write buffering, unread pushback, and a
//! read cap.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a single socket read.
const READ_CHUNK: usize = 8 * 1024;

/// How many bytes a `read`/`readline`/`discard_to_read_limit` call may still
/// pull off the wire before signalling EOF.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadLimit {
    Unlimited,
    Remaining(usize),
}

impl ReadLimit {
    fn cap(self, requested: Option<usize>) -> Option<usize> {
        match (self, requested) {
            (ReadLimit::Unlimited, r) => r,
            (ReadLimit::Remaining(cap), None) => Some(cap),
            (ReadLimit::Remaining(cap), Some(r)) => Some(cap.min(r)),
        }
    }

    fn consume(&mut self, n: usize) {
        if let ReadLimit::Remaining(ref mut cap) = self {
            *cap = cap.saturating_sub(n);
        }
    }

    fn remaining(self) -> usize {
        match self {
            ReadLimit::Unlimited => usize::MAX,
            ReadLimit::Remaining(n) => n,
        }
    }
}

/// Either every `write` flushes immediately (`Unbuffered`), or writes
/// accumulate in the write buffer until an explicit `flush` (`Unbounded`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Unbuffered,
    Unbounded,
}

/// A buffered wrapper around a socket, providing the read/write buffering,
/// `unread` pushback, and read-cap semantics the worker and response writer
/// depend on. One instance per connection, owned for its whole lifetime.
pub struct BufferedIo<T> {
    io: T,
    read_buf: VecDeque<Bytes>,
    read_limit: ReadLimit,
    write_buf: Vec<u8>,
    write_mode: WriteMode,
}

impl<T> BufferedIo<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> BufferedIo<T> {
        BufferedIo {
            io,
            read_buf: VecDeque::new(),
            read_limit: ReadLimit::Unlimited,
            write_buf: Vec::new(),
            write_mode: WriteMode::Unbuffered,
        }
    }

    pub fn read_limit(&self) -> ReadLimit {
        self.read_limit
    }

    pub fn set_read_limit(&mut self, limit: ReadLimit) {
        self.read_limit = limit;
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Switching from `Unbounded` to `Unbuffered` forces a flush of
    /// whatever is already queued.
    pub async fn set_write_mode(&mut self, mode: WriteMode) -> io::Result<()> {
        let was_unbounded = self.write_mode == WriteMode::Unbounded;
        self.write_mode = mode;
        if mode == WriteMode::Unbuffered && was_unbounded && !self.write_buf.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn write_buffer_len(&self) -> usize {
        self.write_buf.len()
    }

    pub fn read_buffer_len(&self) -> usize {
        self.read_buf.iter().map(Bytes::len).sum()
    }

    /// Queues (or, if unbuffered, immediately sends) `data`.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.write_mode {
            WriteMode::Unbounded => {
                self.write_buf.extend_from_slice(data);
                Ok(())
            }
            WriteMode::Unbuffered => self.io.write_all(data).await,
        }
    }

    /// Sends and clears the write buffer. A no-op if it's empty.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.write_buf);
        self.io.write_all(&data).await
    }

    pub fn discard_write_buffer(&mut self) {
        self.write_buf.clear();
    }

    /// Prepends `data` to the read buffer, to be replayed before any new
    /// socket read.
    pub fn unread(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.read_buf.push_front(data);
        }
    }

    /// A single non-blocking-style read: if the read buffer already holds
    /// bytes (from a prior `unread`), returns up to `max` of those without
    /// touching the socket; otherwise issues exactly one socket read and
    /// returns whatever arrived, however short — never loops to fill `max`.
    /// Used while accumulating the header block, where the fill-to-`n`
    /// behavior of [`read`](Self::read) would stall until `max` bytes
    /// showed up, which a client waiting on a response after a short
    /// request never sends.
    pub async fn read_once(&mut self, max: usize) -> io::Result<Bytes> {
        if let Some(chunk) = self.read_buf.front_mut() {
            let take = max.min(chunk.len());
            let out = chunk.slice(..take);
            if take == chunk.len() {
                self.read_buf.pop_front();
            } else {
                *chunk = chunk.slice(take..);
            }
            return Ok(out);
        }
        let mut buf = vec![0u8; max];
        let got = self.io.read(&mut buf).await?;
        buf.truncate(got);
        Ok(Bytes::from(buf))
    }

    /// Returns up to `n` bytes (or, if `n` is `None`, until EOF), draining
    /// the read buffer first and then pulling from the socket in 8 KiB
    /// chunks, respecting the read cap.
    pub async fn read(&mut self, n: Option<usize>) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        let mut remaining = n;

        while let Some(chunk) = self.read_buf.front_mut() {
            if let Some(0) = remaining {
                break;
            }
            let take = match remaining {
                Some(r) => r.min(chunk.len()),
                None => chunk.len(),
            };
            out.extend_from_slice(&chunk[..take]);
            if take == chunk.len() {
                self.read_buf.pop_front();
            } else {
                *chunk = chunk.slice(take..);
            }
            if let Some(ref mut r) = remaining {
                *r -= take;
            }
        }

        let capped = self.read_limit.cap(remaining);
        let mut budget = match capped {
            Some(0) => return Ok(out.freeze()),
            Some(b) => b,
            None => usize::MAX,
        };

        loop {
            if budget == 0 {
                break;
            }
            let want = budget.min(READ_CHUNK);
            let mut buf = vec![0u8; want];
            let got = self.io.read(&mut buf).await?;
            if got == 0 {
                break; // EOF
            }
            self.read_limit.consume(got);
            out.extend_from_slice(&buf[..got]);
            if capped.is_some() {
                budget -= got;
            }
            // n < 0 (capped == None and no read_limit) means "until EOF":
            // keep looping until the socket returns zero bytes.
        }

        Ok(out.freeze())
    }

    /// Returns bytes up to and including the next `\n`, or everything up to
    /// EOF if no `\n` arrives.
    pub async fn read_line(&mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        loop {
            if let Some(chunk) = self.read_buf.front_mut() {
                if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                    out.extend_from_slice(&chunk[..=pos]);
                    if pos + 1 == chunk.len() {
                        self.read_buf.pop_front();
                    } else {
                        *chunk = chunk.slice(pos + 1..);
                    }
                    return Ok(out.freeze());
                } else {
                    out.extend_from_slice(chunk);
                    self.read_buf.pop_front();
                    continue;
                }
            }

            let want = self.read_limit.remaining().min(READ_CHUNK);
            if want == 0 {
                return Ok(out.freeze());
            }
            let mut buf = vec![0u8; want];
            let got = self.io.read(&mut buf).await?;
            if got == 0 {
                return Ok(out.freeze()); // EOF
            }
            self.read_limit.consume(got);
            if let Some(pos) = buf[..got].iter().position(|&b| b == b'\n') {
                out.extend_from_slice(&buf[..=pos]);
                if pos + 1 < got {
                    self.read_buf
                        .push_back(Bytes::copy_from_slice(&buf[pos + 1..got]));
                }
                return Ok(out.freeze());
            }
            out.extend_from_slice(&buf[..got]);
        }
    }

    /// Drops the read buffer and drains the socket until the read cap
    /// reaches zero. Errors if the peer closes before that.
    pub async fn discard_to_read_limit(&mut self) -> io::Result<()> {
        self.read_buf.clear();
        loop {
            let remaining = self.read_limit.remaining();
            if remaining == 0 {
                return Ok(());
            }
            let want = remaining.min(32 * 1024);
            let mut buf = vec![0u8; want];
            let got = self.io.read(&mut buf).await?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before declared body was fully read",
                ));
            }
            self.read_limit.consume(got);
        }
    }
}
