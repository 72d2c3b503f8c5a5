//! Multiplexed HTTP/2 connection over any spindle socket.
//!
//! A connection owns the sans-IO `H2Connection` behind a mutex and two
//! tasks on the event loop:
//!
//! - the reader pulls whole frames off the socket with an `AsyncReader`,
//!   feeds them to the state machine and routes the resulting events to
//!   streams;
//! - the writer drains an outbound `NonBlockingWritePipe` that every
//!   state-machine mutation flushes its encoded frames into.
//!
//! Streams never touch the socket. Received DATA is pushed into a
//! per-stream `NonBlockingWritePipe`; window credit goes back to the peer
//! only as the application reads it. Outgoing data goes through a
//! per-stream `BlockingWritePipe` whose sink is the send window, so a
//! writer suspends until a WINDOW_UPDATE makes room.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spindle::{AsyncReader, AsyncSocket, AsyncWrite, Cooperator, Deferred, LoopHandle, NonBlockingWritePipe};
use spindle_h2::{
    ErrorCode, FRAME_HEADER_LEN, FrameHeader, H2Connection, H2Error, H2Event, HeaderField, PREFACE, Role,
};
use tracing::{debug, trace, warn};

use crate::config::Http2Config;
use crate::error::HttpError;
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED, STREAMS_OPENED, STREAMS_RESET};
use crate::stream::{Http2Stream, StreamShared};

/// Lifecycle of a connection.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// Waiting for the peer's SETTINGS.
    Handshaking,
    Active,
    /// Terminal; carries why the connection ended.
    Closed(HttpError),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Everything guarded by the connection lock.
pub(crate) struct Core {
    pub(crate) h2: H2Connection,
    pub(crate) state: ConnectionState,
    /// Streams the state machine still tracks, by id.
    pub(crate) streams: HashMap<u32, Arc<StreamShared>>,
    /// Peer-opened streams not yet handed out by `accept`.
    incoming: VecDeque<Arc<StreamShared>>,
    /// `last_stream_id` and code of the peer's GOAWAY.
    goaway: Option<(u32, ErrorCode)>,
    /// Outstanding pings, answered in order.
    pings: VecDeque<(Instant, Deferred<Duration>)>,
    next_ping: u64,
}

impl Core {
    /// Forget a stream once the state machine has closed it.
    pub(crate) fn reap(&mut self, stream_id: u32) {
        if self.h2.stream_state(stream_id) == spindle_h2::StreamState::Closed {
            self.streams.remove(&stream_id);
        }
    }

    /// Error for operations on a connection that can no longer carry
    /// streams.
    pub(crate) fn closed_error(&self) -> Option<HttpError> {
        match &self.state {
            ConnectionState::Closed(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

/// State shared between the connection handle, its streams and its
/// reader and writer tasks.
pub(crate) struct Shared {
    pub(crate) config: Http2Config,
    pub(crate) core: Mutex<Core>,
    /// Encoded frames waiting for the writer task.
    outbound: NonBlockingWritePipe,
    /// Parks `accept` until a stream arrives or the connection closes.
    incoming: Cooperator,
    ready: Deferred<()>,
    closed: Deferred<()>,
}

impl Shared {
    fn new(role: Role, config: Http2Config) -> Arc<Self> {
        let h2 = H2Connection::new(role, config.settings())
            .with_connection_window(config.connection_window_size)
            .with_update_ratio(config.window_update_ratio);
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                h2,
                state: ConnectionState::Handshaking,
                streams: HashMap::new(),
                incoming: VecDeque::new(),
                goaway: None,
                pings: VecDeque::new(),
                next_ping: 0,
            }),
            config,
            outbound: NonBlockingWritePipe::new(usize::MAX, || {}),
            incoming: Cooperator::new(),
            ready: Deferred::new(),
            closed: Deferred::new(),
        });
        CONNECTIONS_ACTIVE.increment();
        shared.flush(&mut shared.core.lock());
        shared
    }

    /// Move whatever the state machine has queued to the writer.
    pub(crate) fn flush(&self, core: &mut Core) {
        let pending = core.h2.take_pending_send();
        if !pending.is_empty() {
            // Fails only once the connection is closed; the bytes are moot.
            let _ = self.outbound.write(&pending);
        }
    }

    fn new_stream(self: &Arc<Self>, stream_id: u32) -> Arc<StreamShared> {
        STREAMS_OPENED.increment();
        Arc::new(StreamShared::new(
            stream_id,
            Arc::downgrade(self),
            self.config.stream_high_water_mark,
        ))
    }

    /// Handle one frame from the reader. Errors are fatal to the connection.
    fn on_frame(self: &Arc<Self>, header: &FrameHeader, payload: Bytes) -> Result<(), HttpError> {
        let mut core = self.core.lock();
        let result = core.h2.recv_frame(header, payload);
        self.dispatch(&mut core);
        if matches!(core.state, ConnectionState::Handshaking) && result.is_ok() {
            debug!("handshake complete");
            core.state = ConnectionState::Active;
            self.ready.resolve(());
        }
        self.flush(&mut core);
        result.map_err(HttpError::from)
    }

    /// Route every queued state-machine event to its stream.
    fn dispatch(self: &Arc<Self>, core: &mut Core) {
        while let Some(event) = core.h2.poll_event() {
            trace!(?event, "h2 event");
            match event {
                H2Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    let stream = match core.streams.get(&stream_id) {
                        Some(stream) => stream.clone(),
                        // Our own stream, already dropped by the application.
                        None if core.h2.role() == Role::Client => continue,
                        None => {
                            // A new request on the server side.
                            let stream = self.new_stream(stream_id);
                            core.streams.insert(stream_id, stream.clone());
                            core.incoming.push_back(stream.clone());
                            self.incoming.resume();
                            stream
                        }
                    };
                    stream.headers.resolve(headers);
                    if end_stream {
                        stream.inbound.end();
                    }
                    core.reap(stream_id);
                }
                H2Event::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    let Some(stream) = core.streams.get(&stream_id) else {
                        continue;
                    };
                    // The peer is bounded by the stream window, not the
                    // high-water mark.
                    if stream.inbound.write(&data).is_err() {
                        trace!(stream_id, "data after local end of stream");
                    }
                    if end_stream {
                        stream.inbound.end();
                    }
                    core.reap(stream_id);
                }
                H2Event::Trailers { stream_id, headers } => {
                    if let Some(stream) = core.streams.get(&stream_id) {
                        *stream.trailers.lock() = Some(headers);
                        stream.inbound.end();
                    }
                    core.reap(stream_id);
                }
                H2Event::StreamReset {
                    stream_id,
                    error_code,
                    local,
                } => {
                    let Some(stream) = core.streams.remove(&stream_id) else {
                        continue;
                    };
                    STREAMS_RESET.increment();
                    let error = match core.goaway {
                        Some((last_stream_id, code)) if !local && stream_id > last_stream_id => {
                            HttpError::GoAway { last_stream_id, code }
                        }
                        _ => HttpError::StreamReset(error_code),
                    };
                    debug!(stream_id, ?error_code, local, "stream reset");
                    stream.fail(error);
                }
                H2Event::SendCapacity { stream_id: 0 } => {
                    for stream in core.streams.values() {
                        stream.outbound.writable();
                    }
                }
                H2Event::SendCapacity { stream_id } => {
                    if let Some(stream) = core.streams.get(&stream_id) {
                        stream.outbound.writable();
                    }
                }
                H2Event::SettingsAcknowledged => trace!("settings acknowledged"),
                H2Event::PingAck { opaque_data } => {
                    if let Some((sent, deferred)) = core.pings.pop_front() {
                        deferred.resolve(sent.elapsed());
                    } else {
                        warn!(?opaque_data, "unsolicited PING ACK");
                    }
                }
                H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data,
                } => {
                    debug!(
                        last_stream_id,
                        ?error_code,
                        detail = %String::from_utf8_lossy(&debug_data),
                        "goaway received"
                    );
                    core.goaway = Some((last_stream_id, error_code));
                    if error_code != ErrorCode::NoError {
                        let error = HttpError::GoAway {
                            last_stream_id,
                            code: error_code,
                        };
                        for (_, stream) in core.streams.drain() {
                            stream.fail(error.clone());
                        }
                    }
                }
            }
        }
    }

    /// Enter the closed state: fail everything still pending and let the
    /// writer flush and close the socket. Idempotent.
    fn finish(&self, reason: HttpError) {
        let mut core = self.core.lock();
        if core.state.is_closed() {
            return;
        }
        debug!(reason = %reason, "connection closed");
        core.state = ConnectionState::Closed(reason.clone());
        for (_, stream) in core.streams.drain() {
            stream.fail(reason.clone());
        }
        core.incoming.clear();
        for (_, ping) in core.pings.drain(..) {
            ping.reject(reason.clone().into());
        }
        self.flush(&mut core);
        drop(core);

        self.outbound.end();
        self.incoming.resume();
        self.ready.reject(reason.into());
        self.closed.resolve(());
        CONNECTIONS_ACTIVE.decrement();
        CONNECTIONS_CLOSED.increment();
    }

    /// Why the connection ended, for a socket that is gone.
    fn eof_reason(&self) -> HttpError {
        match self.core.lock().goaway {
            Some((last_stream_id, code)) => HttpError::GoAway { last_stream_id, code },
            None => HttpError::ConnectionClosed(ErrorCode::NoError),
        }
    }
}

async fn read_loop<S>(shared: Arc<Shared>, socket: Arc<S>, role: Role)
where
    S: AsyncSocket + Send + Sync + 'static,
{
    let mut reader = AsyncReader::new(socket);
    let reason = match read_frames(&shared, &mut reader, role).await {
        Ok(()) => shared.eof_reason(),
        // A connection-scoped violation closes every stream with its code.
        Err(HttpError::H2(e)) if e.stream_id().is_none() => HttpError::ConnectionClosed(e.code()),
        Err(e) => e,
    };
    shared.finish(reason);
}

async fn read_frames<S>(shared: &Arc<Shared>, reader: &mut AsyncReader<Arc<S>>, role: Role) -> Result<(), HttpError>
where
    S: AsyncSocket + Send + Sync + 'static,
{
    if role == Role::Server {
        let preface = reader.read_bytes(PREFACE.len()).await?;
        let mut core = shared.core.lock();
        let result = core.h2.recv(&preface);
        shared.flush(&mut core);
        result?;
        if preface.len() < PREFACE.len() {
            return Err(HttpError::Protocol("connection closed during preface".into()));
        }
    }

    let max_frame_size = shared.config.max_frame_size;
    loop {
        let head = reader.read_bytes(FRAME_HEADER_LEN).await?;
        if head.is_empty() {
            return Ok(());
        }
        let header =
            FrameHeader::decode(&head).ok_or_else(|| HttpError::Protocol("truncated frame header".into()))?;
        // Refuse oversized frames before buffering them.
        if header.length > max_frame_size {
            shared.on_frame(&header, Bytes::new())?;
            return Err(H2Error::FrameSizeError.into());
        }
        let payload = reader.read_bytes(header.length as usize).await?;
        if payload.len() < header.length as usize {
            return Err(HttpError::Protocol("truncated frame payload".into()));
        }
        shared.on_frame(&header, payload)?;
    }
}

async fn write_loop<S>(shared: Arc<Shared>, socket: Arc<S>)
where
    S: AsyncSocket + Send + Sync + 'static,
{
    let mut buf = BytesMut::new();
    loop {
        match shared.outbound.read(&mut buf).await {
            Ok(more) => {
                if !buf.is_empty() {
                    if let Err(e) = socket.write(&mut buf).await {
                        warn!(error = %e, "socket write failed");
                        shared.finish(HttpError::from(e));
                        break;
                    }
                }
                if !more {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    if let Err(e) = socket.close().await {
        debug!(error = %e, "socket close failed");
    }
}

/// One HTTP/2 connection. Clients open streams with [`connect`]; servers
/// receive them from [`accept`].
///
/// Dropping the handle closes the connection with `NO_ERROR`.
///
/// [`connect`]: Http2Connection::connect
/// [`accept`]: Http2Connection::accept
pub struct Http2Connection {
    shared: Arc<Shared>,
}

impl Http2Connection {
    /// Start a client connection over `socket` and wait for the server's
    /// SETTINGS.
    pub async fn client<S>(handle: &LoopHandle, socket: S, config: Http2Config) -> Result<Self, HttpError>
    where
        S: AsyncSocket + Send + Sync + 'static,
    {
        Self::start(handle, socket, config, Role::Client).await
    }

    /// Start a server connection over `socket` and wait for the client's
    /// preface and SETTINGS.
    pub async fn server<S>(handle: &LoopHandle, socket: S, config: Http2Config) -> Result<Self, HttpError>
    where
        S: AsyncSocket + Send + Sync + 'static,
    {
        Self::start(handle, socket, config, Role::Server).await
    }

    async fn start<S>(handle: &LoopHandle, socket: S, config: Http2Config, role: Role) -> Result<Self, HttpError>
    where
        S: AsyncSocket + Send + Sync + 'static,
    {
        config.validate()?;
        let shared = Shared::new(role, config);

        let socket = Arc::new(socket);
        let spawned = handle
            .spawn(write_loop(shared.clone(), socket.clone()))
            .and_then(|_| handle.spawn(read_loop(shared.clone(), socket, role)));
        if let Err(e) = spawned {
            shared.finish(HttpError::Io(e.clone()));
            return Err(HttpError::Io(e));
        }

        let conn = Self { shared };
        conn.shared.ready.promise().wait().await?;
        debug!(?role, "http2 connection established");
        Ok(conn)
    }

    /// Open a stream with request `headers`. With `end_stream` the request
    /// has no body.
    pub fn connect(&self, headers: &[HeaderField], end_stream: bool) -> Result<Http2Stream, HttpError> {
        let mut core = self.shared.core.lock();
        if let Some(reason) = core.closed_error() {
            return Err(reason);
        }
        if let Some((last_stream_id, code)) = core.goaway {
            return Err(HttpError::GoAway { last_stream_id, code });
        }
        let stream_id = core.h2.open_stream(headers, end_stream)?;
        let stream = self.shared.new_stream(stream_id);
        core.streams.insert(stream_id, stream.clone());
        self.shared.flush(&mut core);
        debug!(stream_id, "stream opened");
        Ok(Http2Stream::new(self.shared.clone(), stream))
    }

    /// Next stream opened by the peer, or `None` once the connection is
    /// closed. Only one `accept` may wait at a time.
    pub async fn accept(&self) -> Option<Http2Stream> {
        loop {
            {
                let mut core = self.shared.core.lock();
                if let Some(stream) = core.incoming.pop_front() {
                    return Some(Http2Stream::new(self.shared.clone(), stream));
                }
                if core.state.is_closed() {
                    return None;
                }
            }
            self.shared.incoming.yield_now().await;
        }
    }

    /// Round-trip time of a PING.
    pub async fn ping(&self) -> Result<Duration, HttpError> {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        {
            let mut core = self.shared.core.lock();
            if let Some(reason) = core.closed_error() {
                return Err(reason);
            }
            let opaque_data = core.next_ping.to_be_bytes();
            core.next_ping += 1;
            core.h2.send_ping(opaque_data);
            core.pings.push_back((Instant::now(), deferred));
            self.shared.flush(&mut core);
        }
        Ok(promise.wait().await?)
    }

    /// Send GOAWAY with `code`, fail every open stream and close the
    /// socket once pending frames are written.
    pub fn close(&self, code: ErrorCode) {
        {
            let mut core = self.shared.core.lock();
            if core.state.is_closed() {
                return;
            }
            core.h2.send_goaway(code, b"");
        }
        self.shared.finish(HttpError::ConnectionClosed(code));
    }

    /// Wait until the connection is closed and return why.
    pub async fn wait_closed(&self) -> HttpError {
        // Resolved exactly once and never rejected.
        let _ = self.shared.closed.promise().wait().await;
        match self.state() {
            ConnectionState::Closed(reason) => reason,
            _ => HttpError::ConnectionClosed(ErrorCode::NoError),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state.clone()
    }

    /// `last_stream_id` of the peer's GOAWAY, if one arrived.
    pub fn goaway_received(&self) -> Option<u32> {
        self.shared.core.lock().goaway.map(|(last, _)| last)
    }

    /// Streams the connection is still tracking.
    pub fn active_streams(&self) -> usize {
        self.shared.core.lock().streams.len()
    }

    pub fn config(&self) -> &Http2Config {
        &self.shared.config
    }
}

impl Drop for Http2Connection {
    fn drop(&mut self) {
        self.close(ErrorCode::NoError);
    }
}

impl std::fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("state", &self.state())
            .finish()
    }
}
