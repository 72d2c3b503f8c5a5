//! Byte-stream contracts and helpers.
//!
//! A read fills a growable buffer and reports whether more may follow:
//! `Ok(true)` means "more may come later", even when nothing was delivered
//! this call; `Ok(false)` means end of stream with nothing delivered. A
//! write drains its whole buffer before returning, or fails.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::Result;

/// Pull side of a byte stream.
pub trait AsyncRead {
    /// Append available bytes to `buf`. See the module docs for the return
    /// convention.
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send;
}

/// Push side of a byte stream.
pub trait AsyncWrite {
    /// Write all of `buf`, leaving it empty on success.
    fn write(&self, buf: &mut BytesMut) -> impl Future<Output = Result<()>> + Send;
}

/// A duplex stream that must be closed to release its resources.
pub trait AsyncSocket: AsyncRead + AsyncWrite {
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<T: AsyncRead + Send + Sync> AsyncRead for Arc<T> {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        (**self).read(buf)
    }
}

impl<T: AsyncWrite + Send + Sync> AsyncWrite for Arc<T> {
    fn write(&self, buf: &mut BytesMut) -> impl Future<Output = Result<()>> + Send {
        (**self).write(buf)
    }
}

impl<T: AsyncSocket + Send + Sync> AsyncSocket for Arc<T> {
    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).close()
    }
}

/// Read and discard everything until end of stream.
pub async fn drain<R: AsyncRead + ?Sized>(read: &R) -> Result<()> {
    let mut scratch = BytesMut::new();
    while read.read(&mut scratch).await? {
        scratch.clear();
    }
    Ok(())
}

/// Copy `read` into `write` until end of stream. Returns bytes copied.
pub async fn copy<R, W>(read: &R, write: &W) -> Result<u64>
where
    R: AsyncRead + ?Sized,
    W: AsyncWrite + ?Sized,
{
    let mut buf = BytesMut::new();
    let mut total = 0u64;
    loop {
        let more = read.read(&mut buf).await?;
        if !buf.is_empty() {
            total += buf.len() as u64;
            write.write(&mut buf).await?;
        }
        if !more {
            return Ok(total);
        }
    }
}

/// Collect a whole stream.
pub async fn read_to_end<R: AsyncRead + ?Sized>(read: &R) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    while read.read(&mut buf).await? {}
    Ok(buf)
}

/// An in-memory buffer exposed as a stream: one read delivers everything,
/// the next reports end of stream.
#[derive(Debug, Default)]
pub struct BytesReader {
    remaining: Mutex<Bytes>,
}

impl BytesReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        BytesReader {
            remaining: Mutex::new(data.into()),
        }
    }
}

impl AsyncRead for BytesReader {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        let data = std::mem::take(&mut *self.remaining.lock());
        async move {
            if data.is_empty() {
                return Ok(false);
            }
            buf.extend_from_slice(&data);
            Ok(true)
        }
    }
}

/// `first` until it ends, then `second`.
pub fn chain<A: AsyncRead, B: AsyncRead>(first: A, second: B) -> Chain<A, B> {
    Chain {
        first,
        second,
        first_done: AtomicBool::new(false),
    }
}

/// Stream returned by [`chain`].
#[derive(Debug)]
pub struct Chain<A, B> {
    first: A,
    second: B,
    first_done: AtomicBool,
}

impl<A, B> AsyncRead for Chain<A, B>
where
    A: AsyncRead + Sync,
    B: AsyncRead + Sync,
{
    async fn read(&self, buf: &mut BytesMut) -> Result<bool> {
        if !self.first_done.load(Ordering::Acquire) {
            if self.first.read(buf).await? {
                return Ok(true);
            }
            self.first_done.store(true, Ordering::Release);
        }
        self.second.read(buf).await
    }
}
