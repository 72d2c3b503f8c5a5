use std::future::Future;
use std::sync::{Arc, Weak};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use spindle::{AsyncRead, AsyncSocket, AsyncWrite, BlockingWritePipe, Deferred, NonBlockingWritePipe, WriteSink};
use spindle_h2::{ErrorCode, HeaderField, StreamState};
use tracing::{debug, trace};

use crate::connection::Shared;
use crate::error::HttpError;
use crate::metrics::{FLOW_CONTROL_STALLS, STREAMS_RESET};

/// Sends stream data as far as the flow-control windows allow.
pub(crate) struct StreamSink {
    conn: Weak<Shared>,
    stream_id: u32,
}

impl WriteSink for StreamSink {
    fn write_some(&self, buf: &mut BytesMut) -> spindle::Result<()> {
        let conn = self.conn.upgrade().ok_or(spindle::Error::Closed)?;
        let mut core = conn.core.lock();
        if let Some(reason) = core.closed_error() {
            return Err(reason.into());
        }
        let sent = core
            .h2
            .send_data(self.stream_id, buf, false)
            .map_err(HttpError::from)?;
        buf.advance(sent);
        if !buf.is_empty() {
            FLOW_CONTROL_STALLS.increment();
            trace!(stream_id = self.stream_id, remaining = buf.len(), "send window exhausted");
        }
        conn.flush(&mut core);
        Ok(())
    }
}

/// Per-stream state shared by the connection's reader and the
/// application's [`Http2Stream`].
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) headers: Deferred<Vec<HeaderField>>,
    pub(crate) trailers: Mutex<Option<Vec<HeaderField>>>,
    /// DATA received and not yet read.
    pub(crate) inbound: NonBlockingWritePipe,
    pub(crate) outbound: BlockingWritePipe<StreamSink>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, conn: Weak<Shared>, high_water_mark: usize) -> Self {
        Self {
            id,
            headers: Deferred::new(),
            trailers: Mutex::new(None),
            inbound: NonBlockingWritePipe::new(high_water_mark, || {}),
            outbound: BlockingWritePipe::new(StreamSink { conn, stream_id: id }),
        }
    }

    /// Hand `error` to whoever waits on the stream in either direction.
    pub(crate) fn fail(&self, error: HttpError) {
        self.headers.reject(error.clone().into());
        self.inbound.end_with(error.clone().into());
        self.outbound.close_with(error.into());
    }
}

/// One HTTP/2 stream: a request on the client, an exchange on the server.
///
/// Reading returns the peer's DATA in order and hands window credit back
/// as it goes; writing suspends while the send window is exhausted.
/// Dropping a stream that is still open resets it with `CANCEL`.
pub struct Http2Stream {
    conn: Arc<Shared>,
    inner: Arc<StreamShared>,
}

impl Http2Stream {
    pub(crate) fn new(conn: Arc<Shared>, inner: Arc<StreamShared>) -> Self {
        Self { conn, inner }
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.id
    }

    pub fn state(&self) -> StreamState {
        self.conn.core.lock().h2.stream_state(self.inner.id)
    }

    /// The peer's header block: the response on a client stream, the
    /// request on a server stream.
    pub async fn headers(&self) -> Result<Vec<HeaderField>, HttpError> {
        Ok(self.inner.headers.promise().wait().await?)
    }

    /// Trailers, once the peer has sent them.
    pub fn trailers(&self) -> Option<Vec<HeaderField>> {
        self.inner.trailers.lock().clone()
    }

    /// Send a header block: the response on a server stream, or trailers
    /// (with `end_stream`) on either side.
    pub fn send_headers(&self, headers: &[HeaderField], end_stream: bool) -> Result<(), HttpError> {
        let mut core = self.conn.core.lock();
        if let Some(reason) = core.closed_error() {
            return Err(reason);
        }
        core.h2.send_headers(self.inner.id, headers, end_stream)?;
        self.conn.flush(&mut core);
        if end_stream {
            self.inner.outbound.close();
        }
        core.reap(self.inner.id);
        Ok(())
    }

    /// Move received data into `buf`. Returns `Ok(false)` at the end of
    /// the peer's data.
    pub async fn read(&self, buf: &mut BytesMut) -> Result<bool, HttpError> {
        let before = buf.len();
        let more = self.inner.inbound.read(buf).await?;
        let consumed = buf.len() - before;
        if consumed > 0 {
            let mut core = self.conn.core.lock();
            core.h2.release_capacity(self.inner.id, consumed);
            self.conn.flush(&mut core);
        }
        Ok(more)
    }

    /// Send all of `buf`, suspending while the windows are exhausted.
    pub async fn write(&self, buf: &mut BytesMut) -> Result<(), HttpError> {
        Ok(self.inner.outbound.write(buf).await?)
    }

    /// Send END_STREAM. Data already written is not affected.
    pub fn end(&self) -> Result<(), HttpError> {
        let mut core = self.conn.core.lock();
        if let Some(reason) = core.closed_error() {
            return Err(reason);
        }
        core.h2.send_data(self.inner.id, &[], true)?;
        self.conn.flush(&mut core);
        self.inner.outbound.close();
        core.reap(self.inner.id);
        Ok(())
    }

    /// Abort the stream in both directions.
    pub fn reset(&self, code: ErrorCode) {
        let mut core = self.conn.core.lock();
        if core.streams.remove(&self.inner.id).is_none() {
            return;
        }
        core.h2.reset_stream(self.inner.id, code);
        self.conn.flush(&mut core);
        drop(core);
        STREAMS_RESET.increment();
        debug!(stream_id = self.inner.id, ?code, "stream reset locally");
        self.inner.fail(HttpError::StreamReset(code));
    }
}

impl Drop for Http2Stream {
    fn drop(&mut self) {
        if self.state() != StreamState::Closed {
            self.reset(ErrorCode::Cancel);
        }
    }
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Stream")
            .field("stream_id", &self.inner.id)
            .finish()
    }
}

impl AsyncRead for Http2Stream {
    async fn read(&self, buf: &mut BytesMut) -> spindle::Result<bool> {
        Ok(Http2Stream::read(self, buf).await?)
    }
}

impl AsyncWrite for Http2Stream {
    fn write(&self, buf: &mut BytesMut) -> impl Future<Output = spindle::Result<()>> + Send {
        self.inner.outbound.write(buf)
    }
}

impl AsyncSocket for Http2Stream {
    async fn close(&self) -> spindle::Result<()> {
        if self.state().can_send() {
            self.end()?;
        }
        Ok(())
    }
}
