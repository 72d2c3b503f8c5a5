//! Buffered parsing over a raw byte stream.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::filter::{Pipe, Piped};
use crate::io::AsyncRead;

/// Scan/length/peek operations over an [`AsyncRead`].
///
/// Over-reads (bytes past a delimiter or length) stay in an internal
/// pending buffer and are served first by every later operation. Every
/// protocol parser in the workspace is built from these calls.
#[derive(Debug)]
pub struct AsyncReader<R> {
    input: R,
    pending: BytesMut,
}

impl<R: AsyncRead> AsyncReader<R> {
    pub fn new(input: R) -> Self {
        AsyncReader {
            input,
            pending: BytesMut::new(),
        }
    }

    /// Bytes read from the input but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.input
    }

    /// Give back the input, dropping anything still buffered.
    pub fn into_inner(self) -> R {
        self.input
    }

    /// One read of the input into the pending buffer. Same return
    /// convention as [`AsyncRead::read`], counting already buffered bytes.
    pub async fn read_buffer(&mut self) -> Result<bool> {
        let more = self.input.read(&mut self.pending).await?;
        Ok(more || !self.pending.is_empty())
    }

    /// Deliver buffered bytes if there are any, otherwise read the input
    /// directly into `buf`.
    pub async fn read(&mut self, buf: &mut BytesMut) -> Result<bool> {
        if self.read_pending(buf) {
            return Ok(true);
        }
        self.input.read(buf).await
    }

    /// Move buffered bytes into `buf` without touching the input. Returns
    /// whether anything was moved.
    pub fn read_pending(&mut self, buf: &mut BytesMut) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        buf.unsplit(self.pending.split());
        true
    }

    /// Deliver exactly `length` bytes. At end of stream, delivers what was
    /// collected and returns `Ok(false)`.
    pub async fn read_length(&mut self, buf: &mut BytesMut, length: usize) -> Result<bool> {
        while self.pending.len() < length {
            if !self.input.read(&mut self.pending).await? {
                self.read_pending(buf);
                return Ok(false);
            }
        }
        buf.unsplit(self.pending.split_to(length));
        Ok(true)
    }

    /// Deliver everything up to and including `delimiter`. At end of stream
    /// without a match, delivers what was collected and returns `Ok(false)`.
    pub async fn read_scan(&mut self, buf: &mut BytesMut, delimiter: &[u8]) -> Result<bool> {
        let mut searched = 0;
        loop {
            if let Some(end) = find(&self.pending, delimiter, searched) {
                buf.unsplit(self.pending.split_to(end));
                return Ok(true);
            }
            searched = self.pending.len().saturating_sub(delimiter.len().saturating_sub(1));
            if !self.input.read(&mut self.pending).await? {
                self.read_pending(buf);
                return Ok(false);
            }
        }
    }

    /// One step of a streaming scan. Reads once; returns `Some(true)` when
    /// the delimiter was delivered, `Some(false)` at end of stream (all
    /// collected bytes delivered), or `None` after delivering the prefix
    /// that cannot be part of a delimiter, to be called again.
    pub async fn read_scan_chunk(&mut self, buf: &mut BytesMut, delimiter: &[u8]) -> Result<Option<bool>> {
        if let Some(end) = find(&self.pending, delimiter, 0) {
            buf.unsplit(self.pending.split_to(end));
            return Ok(Some(true));
        }
        let more = self.input.read(&mut self.pending).await?;
        if let Some(end) = find(&self.pending, delimiter, 0) {
            buf.unsplit(self.pending.split_to(end));
            return Ok(Some(true));
        }
        if !more {
            self.read_pending(buf);
            return Ok(Some(false));
        }
        let safe = self.pending.len().saturating_sub(delimiter.len().saturating_sub(1));
        buf.unsplit(self.pending.split_to(safe));
        Ok(None)
    }

    /// [`read_scan`](Self::read_scan) for a string delimiter, returning the
    /// scanned text including the delimiter.
    pub async fn read_scan_string(&mut self, delimiter: &str) -> Result<String> {
        let mut buf = BytesMut::new();
        self.read_scan(&mut buf, delimiter.as_bytes()).await?;
        utf8(buf.freeze())
    }

    /// A line without its `\n` or `\r\n` terminator. The final line of a
    /// stream may be unterminated; at end of stream this returns "".
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = self.read_scan_string("\n").await?;
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(line)
    }

    /// Deliver at most `max` bytes, reading the input once only if nothing
    /// is buffered.
    pub async fn read_chunk(&mut self, buf: &mut BytesMut, max: usize) -> Result<bool> {
        if self.pending.is_empty() && !self.input.read(&mut self.pending).await? {
            return Ok(false);
        }
        let n = max.min(self.pending.len());
        buf.unsplit(self.pending.split_to(n));
        Ok(true)
    }

    async fn fill(&mut self, length: usize) -> Result<()> {
        while self.pending.len() < length {
            if !self.input.read(&mut self.pending).await? {
                break;
            }
        }
        Ok(())
    }

    /// Up to `length` bytes; fewer only at end of stream.
    pub async fn read_bytes(&mut self, length: usize) -> Result<Bytes> {
        self.fill(length).await?;
        let n = length.min(self.pending.len());
        Ok(self.pending.split_to(n).freeze())
    }

    pub async fn read_string(&mut self, length: usize) -> Result<String> {
        let bytes = self.read_bytes(length).await?;
        utf8(bytes)
    }

    /// Like [`read_bytes`](Self::read_bytes) but leaves the bytes buffered.
    pub async fn peek_bytes(&mut self, length: usize) -> Result<Bytes> {
        self.fill(length).await?;
        let n = length.min(self.pending.len());
        Ok(Bytes::copy_from_slice(&self.pending[..n]))
    }

    pub async fn peek_string(&mut self, length: usize) -> Result<String> {
        let bytes = self.peek_bytes(length).await?;
        utf8(bytes)
    }

    /// Discard `length` bytes. Returns `Ok(false)` if the stream ended first.
    pub async fn skip(&mut self, mut length: usize) -> Result<bool> {
        while length > 0 {
            if self.pending.is_empty() && !self.input.read(&mut self.pending).await? {
                return Ok(false);
            }
            let n = length.min(self.pending.len());
            self.pending.advance(n);
            length -= n;
        }
        Ok(true)
    }

    async fn ensure(&mut self, length: usize, what: &'static str) -> Result<()> {
        self.fill(length).await?;
        if self.pending.len() < length {
            return Err(Error::UnexpectedEof(what));
        }
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8").await?;
        Ok(self.pending.get_u8())
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2, "u16").await?;
        Ok(self.pending.get_u16())
    }

    pub async fn read_u16_le(&mut self) -> Result<u16> {
        self.ensure(2, "u16").await?;
        Ok(self.pending.get_u16_le())
    }

    pub async fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4, "u32").await?;
        Ok(self.pending.get_u32())
    }

    pub async fn read_u32_le(&mut self) -> Result<u32> {
        self.ensure(4, "u32").await?;
        Ok(self.pending.get_u32_le())
    }

    pub async fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8, "u64").await?;
        Ok(self.pending.get_u64())
    }

    pub async fn read_u64_le(&mut self) -> Result<u64> {
        self.ensure(8, "u64").await?;
        Ok(self.pending.get_u64_le())
    }

    /// Stream this reader through `pipe`.
    pub fn pipe<P: Pipe>(self, pipe: P) -> Piped<R, P> {
        Piped::new(self, pipe)
    }
}

fn utf8(bytes: Bytes) -> Result<String> {
    String::from_utf8(bytes.into()).map_err(|_| Error::Protocol("invalid UTF-8".into()))
}

/// End offset (exclusive) of the first `needle` in `haystack` at or after `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(haystack.len()));
    }
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i + needle.len())
}
