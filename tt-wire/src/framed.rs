//! Buffered, deadline-bounded framing over an async byte stream.
//!
//! Mirrors the `TTSOCK` wrapper of the original: a fixed-size read buffer, an
//! end-of-stream flag, and a per-operation deadline applied uniformly to
//! reads and writes. `prefetched_bytes` lets a dispatcher tell whether a
//! pipelined request is already sitting in the buffer before it decides
//! whether to `await` more I/O.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use snafu::ensure;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{EosSnafu, FrameTooLargeSnafu, LineTooLongSnafu, WireError};

/// Initial and steady-state capacity of the read buffer.
pub const READ_BUF_CAP: usize = 64 * 1024;
/// Hard cap on how far `read_line` will grow its buffer looking for a `\n`.
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// A framed, deadline-bounded wrapper around any async duplex stream.
pub struct FramedIo<S> {
    stream: S,
    buf: BytesMut,
    eos: bool,
    deadline: Option<Duration>,
}

impl<S> FramedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream` with no deadline configured.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_BUF_CAP),
            eos: false,
            deadline: None,
        }
    }

    /// Sets the per-operation deadline applied to every subsequent read/write.
    pub fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.deadline = deadline;
    }

    /// Whether end-of-stream (peer close, or a prior I/O error) was observed.
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Number of bytes already sitting in the read buffer, i.e. bytes that
    /// can be consumed without another `await` on the socket. A dispatcher
    /// uses this to detect that a client pipelined more than one request in
    /// a single TCP segment.
    pub fn prefetched_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Returns the wrapped stream, discarding any buffered-but-unconsumed
    /// bytes. Callers that still have `prefetched_bytes()` buffered should
    /// drain them first.
    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn fill_at_least(&mut self, want: usize) -> Result<(), WireError> {
        while self.buf.len() < want {
            if self.eos {
                return EosSnafu.fail();
            }
            self.buf.reserve(READ_BUF_CAP.max(want - self.buf.len()));
            let fut = self.stream.read_buf(&mut self.buf);
            let n = match self.deadline {
                Some(d) => timeout(d, fut).await.map_err(|_| {
                    self.eos = true;
                    WireError::Deadline
                })??,
                None => fut.await?,
            };
            if n == 0 {
                self.eos = true;
                return EosSnafu.fail();
            }
        }
        Ok(())
    }

    /// Reads exactly `n` bytes, blocking (asynchronously) until satisfied or
    /// the deadline elapses.
    pub async fn read_exact(&mut self, n: usize) -> Result<BytesMut, WireError> {
        self.fill_at_least(n).await?;
        Ok(self.buf.split_to(n))
    }

    /// Reads a single byte.
    pub async fn read_byte(&mut self) -> Result<u8, WireError> {
        self.fill_at_least(1).await?;
        Ok(self.buf.get_u8())
    }

    /// Pushes a single byte back onto the front of the read buffer, so the
    /// next `read_byte`/`read_line` sees it again. Used by protocol dispatch
    /// to peek the first byte of a request before deciding which protocol it
    /// belongs to.
    pub fn push_back(&mut self, byte: u8) {
        let mut prefixed = BytesMut::with_capacity(self.buf.len() + 1);
        prefixed.put_u8(byte);
        prefixed.unsplit(std::mem::take(&mut self.buf));
        self.buf = prefixed;
    }

    /// Reads one CR/LF-terminated line. The trailing `\r` (if any) and the
    /// `\n` are stripped; embedded NUL bytes are dropped from the result.
    /// Grows its scan window up to [`MAX_LINE_LEN`] before giving up.
    pub async fn read_line(&mut self) -> Result<BytesMut, WireError> {
        let mut scanned = 0usize;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let nl = scanned + pos;
                let mut line = self.buf.split_to(nl);
                self.buf.advance(1); // drop the '\n' itself
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                line.retain(|&b| b != 0);
                return Ok(line);
            }
            scanned = self.buf.len();
            ensure!(scanned < MAX_LINE_LEN, LineTooLongSnafu);
            if self.eos {
                return EosSnafu.fail();
            }
            self.buf.reserve(READ_BUF_CAP);
            let fut = self.stream.read_buf(&mut self.buf);
            let n = match self.deadline {
                Some(d) => timeout(d, fut).await.map_err(|_| WireError::Deadline)??,
                None => fut.await?,
            };
            if n == 0 {
                self.eos = true;
                return EosSnafu.fail();
            }
        }
    }

    /// Reads a big-endian `u16`.
    pub async fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.read_exact(2).await?;
        Ok(u16::from_be_bytes(b[..2].try_into().unwrap()))
    }

    /// Reads a big-endian `u32`.
    pub async fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.read_exact(4).await?;
        Ok(u32::from_be_bytes(b[..4].try_into().unwrap()))
    }

    /// Reads a big-endian `u64`.
    pub async fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.read_exact(8).await?;
        Ok(u64::from_be_bytes(b[..8].try_into().unwrap()))
    }

    /// Reads a big-endian `i64`.
    pub async fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.read_exact(8).await?;
        Ok(i64::from_be_bytes(b[..8].try_into().unwrap()))
    }

    /// Reads a big-endian `u32` length prefix followed by that many bytes,
    /// rejecting a declared length over `max` before attempting to read it
    /// — the shared shape binary command args, update-log payload fields,
    /// and record key/value bytes all use.
    pub async fn read_length_prefixed(&mut self, max: usize) -> Result<BytesMut, WireError> {
        let len = self.read_u32().await? as usize;
        ensure!(len <= max, FrameTooLargeSnafu { len, max });
        self.read_exact(len).await
    }

    /// Writes `buf` in full, retrying partial writes, bounded by the
    /// configured deadline.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), WireError> {
        let fut = self.stream.write_all(buf);
        match self.deadline {
            Some(d) => timeout(d, fut).await.map_err(|_| WireError::Deadline)??,
            None => fut.await?,
        }
        Ok(())
    }

    /// Flushes any internally buffered writes (the underlying stream may
    /// itself be wrapped in a `BufWriter`; this is a pass-through).
    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_line_strips_cr_and_nuls() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"he\0llo\r\nworld\n").await.unwrap();
        drop(client);
        let mut framed = FramedIo::new(server);
        let line = framed.read_line().await.unwrap();
        assert_eq!(&line[..], b"hello");
        let line2 = framed.read_line().await.unwrap();
        assert_eq!(&line2[..], b"world");
    }

    #[tokio::test]
    async fn push_back_is_seen_again() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"Xrest").await.unwrap();
        drop(client);
        let mut framed = FramedIo::new(server);
        let b = framed.read_byte().await.unwrap();
        assert_eq!(b, b'X');
        framed.push_back(b);
        let again = framed.read_byte().await.unwrap();
        assert_eq!(again, b'X');
        let rest = framed.read_exact(4).await.unwrap();
        assert_eq!(&rest[..], b"rest");
    }

    #[tokio::test]
    async fn prefetched_bytes_reflects_pipelining() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"abcdef").await.unwrap();
        drop(client);
        let mut framed = FramedIo::new(server);
        let _ = framed.read_exact(2).await.unwrap();
        assert!(framed.prefetched_bytes() >= 4);
    }

    #[tokio::test]
    async fn read_length_prefixed_rejects_oversized_declared_length() {
        let (mut client, server) = duplex(1024);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        drop(client);
        let mut framed = FramedIo::new(server);
        let err = framed.read_length_prefixed(10).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { len: 100, max: 10 }));
    }

    #[tokio::test]
    async fn read_length_prefixed_within_cap_returns_the_bytes() {
        let (mut client, server) = duplex(1024);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let mut framed = FramedIo::new(server);
        let bytes = framed.read_length_prefixed(10).await.unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn big_endian_round_trip() {
        let (mut client, server) = duplex(1024);
        client.write_all(&7u16.to_be_bytes()).await.unwrap();
        client.write_all(&42u32.to_be_bytes()).await.unwrap();
        client.write_all(&9_000_000_000u64.to_be_bytes()).await.unwrap();
        drop(client);
        let mut framed = FramedIo::new(server);
        assert_eq!(framed.read_u16().await.unwrap(), 7);
        assert_eq!(framed.read_u32().await.unwrap(), 42);
        assert_eq!(framed.read_u64().await.unwrap(), 9_000_000_000);
    }
}
