//! Stream filters: a [`Pipe`] turns an [`AsyncReader`] into a new stream.

use std::future::Future;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::io::AsyncRead;
use crate::reader::AsyncReader;

const CRLF: &[u8] = b"\r\n";

/// A filter step: pull what it needs from `reader`, append its output to
/// `out`. Follows the [`AsyncRead`] return convention for the filtered
/// stream and must keep returning `Ok(false)` once it has ended.
pub trait Pipe: Send {
    fn step<R>(&mut self, reader: &mut AsyncReader<R>, out: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send
    where
        R: AsyncRead + Send + Sync;
}

/// The filtered stream produced by [`AsyncReader::pipe`].
///
/// Reads are exclusive: a read issued while another is in progress fails
/// with [`Error::DoubleRead`].
pub struct Piped<R, P> {
    inner: Mutex<Option<(AsyncReader<R>, P)>>,
}

impl<R, P> Piped<R, P> {
    pub(crate) fn new(reader: AsyncReader<R>, pipe: P) -> Self {
        Piped {
            inner: Mutex::new(Some((reader, pipe))),
        }
    }

    /// Recover the reader and the filter. `None` only if a read future was
    /// leaked instead of dropped.
    pub fn into_inner(self) -> Option<(AsyncReader<R>, P)> {
        self.inner.into_inner()
    }
}

/// Holds the reader while a step runs and puts it back on drop, so a
/// cancelled read leaves the stream usable.
struct Borrowed<'a, T> {
    home: &'a Mutex<Option<T>>,
    value: Option<T>,
}

impl<T> Drop for Borrowed<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            *self.home.lock() = Some(value);
        }
    }
}

impl<R, P> AsyncRead for Piped<R, P>
where
    R: AsyncRead + Send + Sync,
    P: Pipe,
{
    async fn read(&self, buf: &mut BytesMut) -> Result<bool> {
        let taken = self.inner.lock().take();
        let mut borrowed = Borrowed {
            home: &self.inner,
            value: Some(taken.ok_or(Error::DoubleRead)?),
        };
        let Some((reader, pipe)) = borrowed.value.as_mut() else {
            return Err(Error::DoubleRead);
        };
        pipe.step(reader, buf).await
    }
}

/// Passes through exactly `length` bytes, then ends. Fails with
/// [`Error::UnexpectedEof`] if the input ends early.
#[derive(Debug, Clone)]
pub struct ContentLengthPipe {
    remaining: u64,
}

impl ContentLengthPipe {
    pub fn new(length: u64) -> Self {
        ContentLengthPipe { remaining: length }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Pipe for ContentLengthPipe {
    async fn step<R>(&mut self, reader: &mut AsyncReader<R>, out: &mut BytesMut) -> Result<bool>
    where
        R: AsyncRead + Send + Sync,
    {
        if self.remaining == 0 {
            return Ok(false);
        }
        let before = out.len();
        let max = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        if !reader.read_chunk(out, max).await? {
            return Err(Error::UnexpectedEof("content-length body"));
        }
        self.remaining -= (out.len() - before) as u64;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(usize),
    Done,
}

/// Decodes `Transfer-Encoding: chunked`. Chunk data is streamed rather
/// than collected, so arbitrarily large chunks pass through in pieces.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: Chunk,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder { state: Chunk::Size }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let line = std::str::from_utf8(line).map_err(|_| Error::Protocol("chunk size is not UTF-8".into()))?;
    // Chunk extensions follow a ';' and are ignored.
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).map_err(|_| Error::Protocol(format!("invalid chunk size {size:?}")))
}

impl Pipe for ChunkedDecoder {
    async fn step<R>(&mut self, reader: &mut AsyncReader<R>, out: &mut BytesMut) -> Result<bool>
    where
        R: AsyncRead + Send + Sync,
    {
        let mut scratch = BytesMut::new();
        loop {
            match self.state {
                Chunk::Done => return Ok(false),
                Chunk::Size => {
                    if !reader.read_scan(&mut scratch, CRLF).await? {
                        return Err(Error::UnexpectedEof("chunk size"));
                    }
                    let size = parse_chunk_size(&scratch[..scratch.len() - CRLF.len()])?;
                    scratch.clear();
                    if size == 0 {
                        if !reader.read_scan(&mut scratch, CRLF).await? {
                            return Err(Error::UnexpectedEof("chunked trailer"));
                        }
                        self.state = Chunk::Done;
                        return Ok(false);
                    }
                    self.state = Chunk::Data(size);
                }
                Chunk::Data(remaining) => {
                    let before = out.len();
                    if !reader.read_chunk(out, remaining).await? {
                        return Err(Error::UnexpectedEof("chunk data"));
                    }
                    let left = remaining - (out.len() - before);
                    if left == 0 {
                        if !reader.read_scan(&mut scratch, CRLF).await? {
                            return Err(Error::UnexpectedEof("chunk terminator"));
                        }
                        self.state = Chunk::Size;
                    } else {
                        self.state = Chunk::Data(left);
                    }
                    return Ok(true);
                }
            }
        }
    }
}

/// Encodes a stream as `Transfer-Encoding: chunked`, one chunk per read of
/// the input, finishing with the zero-length chunk.
#[derive(Debug, Default)]
pub struct ChunkedEncoder {
    sent_last: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pipe for ChunkedEncoder {
    async fn step<R>(&mut self, reader: &mut AsyncReader<R>, out: &mut BytesMut) -> Result<bool>
    where
        R: AsyncRead + Send + Sync,
    {
        if self.sent_last {
            return Ok(false);
        }
        let mut data = BytesMut::new();
        if !reader.read(&mut data).await? {
            self.sent_last = true;
            out.extend_from_slice(b"0\r\n\r\n");
            return Ok(true);
        }
        // An empty read is fine; an empty chunk would end the stream.
        if data.is_empty() {
            return Ok(true);
        }
        out.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
        out.extend_from_slice(&data);
        out.extend_from_slice(CRLF);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BytesReader, read_to_end};
    use crate::{Config, EventLoop, pipe_socket_pair, timeout};
    use std::time::Duration;

    fn block_on<F: Future>(f: F) -> F::Output {
        EventLoop::new(Config::default()).unwrap().block_on(f)
    }

    #[test]
    fn content_length_stops_at_length() {
        block_on(async {
            let reader = AsyncReader::new(BytesReader::new("hello world"));
            let body = reader.pipe(ContentLengthPipe::new(5));
            assert_eq!(&read_to_end(&body).await.unwrap()[..], b"hello");
            let (mut reader, pipe) = body.into_inner().unwrap();
            assert_eq!(pipe.remaining(), 0);
            assert_eq!(reader.read_string(100).await.unwrap(), " world");
        });
    }

    #[test]
    fn content_length_detects_truncation() {
        block_on(async {
            let body = AsyncReader::new(BytesReader::new("short")).pipe(ContentLengthPipe::new(10));
            assert!(matches!(read_to_end(&body).await, Err(Error::UnexpectedEof(_))));
        });
    }

    #[test]
    fn chunked_decodes_wire_format() {
        block_on(async {
            let wire = "f\r\npayload to send\r\n3;ext=1\r\n!!!\r\n0\r\n\r\nnext";
            let body = AsyncReader::new(BytesReader::new(wire)).pipe(ChunkedDecoder::new());
            assert_eq!(&read_to_end(&body).await.unwrap()[..], b"payload to send!!!");
            let (mut reader, _) = body.into_inner().unwrap();
            assert_eq!(reader.read_string(4).await.unwrap(), "next");
        });
    }

    #[test]
    fn chunked_encode_then_decode() {
        block_on(async {
            let source = crate::io::chain(BytesReader::new("hello "), BytesReader::new(vec![b'x'; 300]));
            let encoded = read_to_end(&AsyncReader::new(source).pipe(ChunkedEncoder::new()))
                .await
                .unwrap();
            assert!(encoded.starts_with(b"6\r\nhello \r\n12C\r\n"));
            assert!(encoded.ends_with(b"\r\n0\r\n\r\n"));

            let decoded = AsyncReader::new(BytesReader::new(encoded.freeze())).pipe(ChunkedDecoder::new());
            let body = read_to_end(&decoded).await.unwrap();
            assert_eq!(body.len(), 306);
        });
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        block_on(async {
            let body = AsyncReader::new(BytesReader::new("a\r\nshort")).pipe(ChunkedDecoder::new());
            assert!(matches!(read_to_end(&body).await, Err(Error::UnexpectedEof("chunk data"))));
        });
    }

    #[test]
    fn cancelled_read_leaves_filter_recoverable() {
        let mut el = EventLoop::new(Config::default()).unwrap();
        let handle = el.handle();
        let (socket, _peer) = pipe_socket_pair();
        let body = AsyncReader::new(socket).pipe(ContentLengthPipe::new(5));
        let mut buf = BytesMut::new();
        let result = el.block_on(timeout(&handle, Duration::from_millis(10), body.read(&mut buf)));
        assert!(matches!(result, Err(Error::Timeout)));
        let (_, pipe) = body.into_inner().unwrap();
        assert_eq!(pipe.remaining(), 5);
    }
}
