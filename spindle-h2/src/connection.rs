//! HTTP/2 connection state machine for either endpoint.
//!
//! `H2Connection` is sans-IO: feed bytes in via `recv()` (or already parsed
//! frames via `handle_frame()`), pull bytes out via `take_pending_send()`,
//! and drain events with `poll_event()`.
//!
//! Errors confined to one stream never fail the connection: the stream is
//! reset, a `StreamReset { local: true }` event is queued and processing
//! continues. Connection errors queue a GOAWAY, close the connection and
//! are returned to the caller.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{ErrorCode, H2Error};
use crate::flowcontrol::{DEFAULT_WINDOW_SIZE, FlowControl, RecvWindow};
use crate::frame::{self, FLAG_END_STREAM, FRAME_DATA, Frame, FrameHeader};
use crate::hpack::{Decoder, Encoder, HeaderField};
use crate::settings::{MAX_WINDOW_SIZE, Setting, Settings};
use crate::stream::{H2Stream, StreamState};

/// Client connection preface (RFC 7540 Section 3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Upper bound on the HPACK table we keep for encoding, whatever the
/// peer allows.
const ENCODER_TABLE_LIMIT: u32 = 65_536;

/// Default window update ratio: acknowledge after half a window.
const DEFAULT_UPDATE_RATIO: u32 = 2;

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Events produced for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Event {
    /// First header block on a stream: a request (server) or response
    /// (client). On the server this is how new streams appear.
    Headers {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// Trailing header block; always ends the stream.
    Trailers {
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// The stream is gone. `local` is true when we reset it because the
    /// peer violated the protocol on it.
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
        local: bool,
    },
    /// Send window grew; 0 means the connection window.
    SendCapacity { stream_id: u32 },
    SettingsAcknowledged,
    PingAck { opaque_data: [u8; 8] },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Server only: the client magic has not been seen yet.
    AwaitingPreface,
    /// The peer's first SETTINGS frame has not arrived.
    Handshaking,
    Open,
    /// GOAWAY sent or received; existing streams may finish.
    Closing,
    Closed,
}

/// A header block split across HEADERS and CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

pub struct H2Connection {
    role: Role,
    state: ConnState,
    local_settings: Settings,
    remote_settings: Settings,

    /// Streams that are not closed yet.
    streams: HashMap<u32, H2Stream>,
    next_stream_id: u32,
    /// Highest stream id the peer has opened.
    max_remote_id: u32,

    conn_send: FlowControl,
    conn_recv: RecvWindow,
    update_ratio: u32,

    encoder: Encoder,
    decoder: Decoder,
    pending_block: Option<PendingBlock>,

    goaway_sent: bool,
    goaway_received: Option<u32>,

    recv_buf: BytesMut,
    send_buf: BytesMut,
    events: VecDeque<H2Event>,
}

impl H2Connection {
    /// Create a connection and queue its opening bytes: the client magic
    /// and SETTINGS for a client, SETTINGS alone for a server.
    pub fn new(role: Role, settings: Settings) -> Self {
        let mut send_buf = BytesMut::new();
        if role == Role::Client {
            send_buf.extend_from_slice(PREFACE);
        }
        Frame::Settings {
            ack: false,
            params: settings.to_params(),
        }
        .encode(&mut send_buf);

        let mut decoder = Decoder::new(settings.header_table_size as usize);
        decoder.set_max_header_list_size(settings.max_header_list_size.map(|n| n as usize));

        Self {
            role,
            state: match role {
                Role::Client => ConnState::Handshaking,
                Role::Server => ConnState::AwaitingPreface,
            },
            remote_settings: Settings::default(),
            streams: HashMap::new(),
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            max_remote_id: 0,
            conn_send: FlowControl::default(),
            conn_recv: RecvWindow::new(DEFAULT_WINDOW_SIZE, DEFAULT_UPDATE_RATIO),
            update_ratio: DEFAULT_UPDATE_RATIO,
            encoder: Encoder::new(4096),
            decoder,
            pending_block: None,
            goaway_sent: false,
            goaway_received: None,
            recv_buf: BytesMut::new(),
            send_buf,
            events: VecDeque::new(),
            local_settings: settings,
        }
    }

    /// Open the connection-level receive window to `size`, queueing the
    /// WINDOW_UPDATE that announces it.
    pub fn with_connection_window(mut self, size: u32) -> Self {
        if let Some(increment) = self.conn_recv.grow_to(size) {
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            }
            .encode(&mut self.send_buf);
        }
        self
    }

    /// Acknowledge received data once `1 / ratio` of a window is released.
    pub fn with_update_ratio(mut self, ratio: u32) -> Self {
        self.update_ratio = ratio.max(1);
        self.conn_recv.set_ratio(self.update_ratio);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// `last_stream_id` of a GOAWAY from the peer, if one arrived.
    pub fn goaway_received(&self) -> Option<u32> {
        self.goaway_received
    }

    pub fn stream_state(&self, stream_id: u32) -> StreamState {
        match self.streams.get(&stream_id) {
            Some(stream) => stream.state,
            None if self.is_idle(stream_id) => StreamState::Idle,
            None => StreamState::Closed,
        }
    }

    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    /// Take all bytes queued for the transport.
    pub fn take_pending_send(&mut self) -> Bytes {
        self.send_buf.split().freeze()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    // -- Sending --

    /// Open a new stream with its request headers. Client only: a server
    /// would need push, which is never enabled.
    pub fn open_stream(&mut self, headers: &[HeaderField], end_stream: bool) -> Result<u32, H2Error> {
        if self.role == Role::Server {
            return Err(H2Error::ProtocolError("server push is not supported".into()));
        }
        if self.goaway_received.is_some() || !matches!(self.state, ConnState::Open | ConnState::Handshaking) {
            return Err(H2Error::ConnectionError(ErrorCode::RefusedStream));
        }
        let stream_id = self.next_stream_id;
        if stream_id > MAX_WINDOW_SIZE {
            return Err(H2Error::ConnectionError(ErrorCode::RefusedStream));
        }
        if let Some(limit) = self.remote_settings.max_concurrent_streams {
            if self.streams.len() >= limit as usize {
                return Err(H2Error::StreamError(stream_id, ErrorCode::RefusedStream));
            }
        }
        self.next_stream_id += 2;

        let stream = H2Stream::new(
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
            self.update_ratio,
        );
        self.streams.insert(stream_id, stream);
        debug!(stream_id, "opening stream");
        self.send_headers(stream_id, headers, end_stream)?;
        Ok(stream_id)
    }

    /// Send a header block: the response on a server stream, or trailers
    /// (with `end_stream`) on any stream.
    pub fn send_headers(&mut self, stream_id: u32, headers: &[HeaderField], end_stream: bool) -> Result<(), H2Error> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::StreamError(stream_id, ErrorCode::StreamClosed))?;
        let state = stream.state.open();
        if !state.can_send() {
            return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
        }
        stream.state = if end_stream { state.end_local() } else { state };

        let mut block = BytesMut::new();
        self.encoder.encode(headers, &mut block);
        let max = self.remote_settings.max_frame_size as usize;
        let mut first = true;
        loop {
            let chunk = block.split_to(block.len().min(max)).freeze();
            let end_headers = block.is_empty();
            let frame = if first {
                Frame::Headers {
                    stream_id,
                    block: chunk,
                    end_stream,
                    end_headers,
                    priority: None,
                }
            } else {
                Frame::Continuation {
                    stream_id,
                    block: chunk,
                    end_headers,
                }
            };
            frame.encode(&mut self.send_buf);
            if end_headers {
                break;
            }
            first = false;
        }
        self.settle(stream_id);
        Ok(())
    }

    /// Queue as much of `data` as both send windows allow, split into
    /// frames of at most the peer's MAX_FRAME_SIZE. Returns the number of
    /// bytes accepted; END_STREAM is only sent if all of `data` fits.
    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<usize, H2Error> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::StreamError(stream_id, ErrorCode::StreamClosed))?;
        if !stream.state.can_send() {
            return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
        }

        let accepted = data.len().min(stream.send.available()).min(self.conn_send.available());
        let finish = end_stream && accepted == data.len();
        let max = self.remote_settings.max_frame_size as usize;

        let mut rest = &data[..accepted];
        loop {
            let chunk = &rest[..rest.len().min(max)];
            rest = &rest[chunk.len()..];
            let last = rest.is_empty();
            if chunk.is_empty() && !finish {
                break;
            }
            stream.send.consume(chunk.len() as u32)?;
            self.conn_send.consume(chunk.len() as u32)?;
            FrameHeader {
                length: chunk.len() as u32,
                frame_type: FRAME_DATA,
                flags: if last && finish { FLAG_END_STREAM } else { 0 },
                stream_id,
            }
            .encode(&mut self.send_buf);
            self.send_buf.extend_from_slice(chunk);
            if last {
                break;
            }
        }

        if finish {
            stream.state = stream.state.end_local();
            self.settle(stream_id);
        }
        trace!(stream_id, accepted, requested = data.len(), "queued data");
        Ok(accepted)
    }

    /// Bytes `send_data` would accept right now.
    pub fn send_capacity(&self, stream_id: u32) -> usize {
        match self.streams.get(&stream_id) {
            Some(stream) if stream.state.can_send() => stream.send.available().min(self.conn_send.available()),
            _ => 0,
        }
    }

    /// Report `amount` received bytes as consumed by the application. A
    /// WINDOW_UPDATE is queued once enough has accumulated.
    pub fn release_capacity(&mut self, stream_id: u32, amount: usize) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.state.can_recv() {
            return;
        }
        let amount = u32::try_from(amount).unwrap_or(u32::MAX);
        if let Some(increment) = stream.recv.release(amount) {
            trace!(stream_id, increment, "stream window update");
            Frame::WindowUpdate { stream_id, increment }.encode(&mut self.send_buf);
        }
    }

    /// Abort a stream. Nothing is sent for streams that are already gone.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        if self.streams.remove(&stream_id).is_some() {
            debug!(stream_id, ?error_code, "resetting stream");
            Frame::RstStream { stream_id, error_code }.encode(&mut self.send_buf);
        }
    }

    pub fn send_ping(&mut self, opaque_data: [u8; 8]) {
        Frame::Ping {
            ack: false,
            opaque_data,
        }
        .encode(&mut self.send_buf);
    }

    /// Announce shutdown. Streams the peer opened up to now may finish;
    /// later ones are ignored.
    pub fn send_goaway(&mut self, error_code: ErrorCode, debug_data: &[u8]) {
        if self.goaway_sent {
            return;
        }
        debug!(last_stream_id = self.max_remote_id, ?error_code, "sending GOAWAY");
        Frame::GoAway {
            last_stream_id: self.max_remote_id,
            error_code,
            debug_data: Bytes::copy_from_slice(debug_data),
        }
        .encode(&mut self.send_buf);
        self.goaway_sent = true;
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    // -- Receiving --

    /// Feed bytes from the transport and process every complete frame.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.recv_buf.extend_from_slice(data);

        if self.state == ConnState::AwaitingPreface {
            let seen = self.recv_buf.len().min(PREFACE.len());
            if self.recv_buf[..seen] != PREFACE[..seen] {
                return self.fail(H2Error::ProtocolError("invalid connection preface".into()));
            }
            if seen < PREFACE.len() {
                return Ok(());
            }
            self.recv_buf.advance(PREFACE.len());
            self.state = ConnState::Handshaking;
        }

        while self.state != ConnState::Closed {
            match frame::decode_frame(&mut self.recv_buf, self.local_settings.max_frame_size) {
                Ok(Some(frame)) => self.handle_frame(frame)?,
                Ok(None) => break,
                Err(e) => self.fail(e)?,
            }
        }
        Ok(())
    }

    /// Process one frame whose header the caller has already parsed, for
    /// transports that read frame by frame. The size check uses the
    /// header, so an oversized frame can be refused before its payload
    /// is read.
    pub fn recv_frame(&mut self, header: &FrameHeader, payload: Bytes) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        if header.length > self.local_settings.max_frame_size {
            return self.fail(H2Error::FrameSizeError);
        }
        match Frame::decode(header, payload) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => self.fail(e),
        }
    }

    /// Process one received frame.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        match self.state {
            ConnState::Closed => return Ok(()),
            ConnState::AwaitingPreface => {
                return self.fail(H2Error::ProtocolError("frame before connection preface".into()));
            }
            ConnState::Handshaking if !matches!(frame, Frame::Settings { ack: false, .. }) => {
                return self.fail(H2Error::ProtocolError("first frame must be SETTINGS".into()));
            }
            _ => {}
        }
        let result = self.dispatch(frame);
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Route an error: stream errors reset the stream, anything else
    /// closes the connection.
    fn fail(&mut self, error: H2Error) -> Result<(), H2Error> {
        if let H2Error::StreamError(stream_id, error_code) = error {
            warn!(stream_id, ?error_code, "stream error");
            self.streams.remove(&stream_id);
            Frame::RstStream { stream_id, error_code }.encode(&mut self.send_buf);
            self.events.push_back(H2Event::StreamReset {
                stream_id,
                error_code,
                local: true,
            });
            return Ok(());
        }
        warn!(error = %error, "connection error");
        self.send_goaway(error.code(), error.to_string().as_bytes());
        self.state = ConnState::Closed;
        self.pending_block = None;
        Err(error)
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), H2Error> {
        trace!(?frame, "received frame");
        if let Some(pending) = &self.pending_block {
            let expected = pending.stream_id;
            if !matches!(frame, Frame::Continuation { stream_id, .. } if stream_id == expected) {
                return Err(H2Error::ProtocolError("expected CONTINUATION".into()));
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => self.events.push_back(H2Event::SettingsAcknowledged),
            Frame::Settings { ack: false, params } => self.apply_remote_settings(params)?,
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                ..
            } => {
                if end_headers {
                    self.finish_headers(stream_id, block, end_stream)?;
                } else {
                    self.pending_block = Some(PendingBlock {
                        stream_id,
                        block: BytesMut::from(&block[..]),
                        end_stream,
                    });
                }
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let Some(pending) = self.pending_block.as_mut() else {
                    return Err(H2Error::ProtocolError(format!("unexpected CONTINUATION on stream {stream_id}")));
                };
                pending.block.extend_from_slice(&block);
                if end_headers {
                    if let Some(done) = self.pending_block.take() {
                        self.finish_headers(done.stream_id, done.block.freeze(), done.end_stream)?;
                    }
                }
            }
            Frame::Data {
                stream_id,
                data,
                end_stream,
                padding,
            } => self.handle_data(stream_id, data, end_stream, padding)?,
            Frame::RstStream { stream_id, error_code } => {
                if self.streams.remove(&stream_id).is_some() {
                    debug!(stream_id, ?error_code, "stream reset by peer");
                    self.events.push_back(H2Event::StreamReset {
                        stream_id,
                        error_code,
                        local: false,
                    });
                } else if self.is_idle(stream_id) {
                    return Err(H2Error::ProtocolError(format!("RST_STREAM on idle stream {stream_id}")));
                }
            }
            Frame::Ping { ack: true, opaque_data } => self.events.push_back(H2Event::PingAck { opaque_data }),
            Frame::Ping { ack: false, opaque_data } => {
                Frame::Ping { ack: true, opaque_data }.encode(&mut self.send_buf);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => self.handle_goaway(last_stream_id, error_code, debug_data),
            Frame::WindowUpdate { stream_id, increment } => self.handle_window_update(stream_id, increment)?,
            Frame::PushPromise { .. } => {
                return Err(H2Error::ProtocolError("PUSH_PROMISE with push disabled".into()));
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn apply_remote_settings(&mut self, params: Vec<Setting>) -> Result<(), H2Error> {
        for setting in params {
            match setting {
                Setting::InitialWindowSize(size) => {
                    let delta = i64::from(size) - i64::from(self.remote_settings.initial_window_size);
                    for (&stream_id, stream) in self.streams.iter_mut() {
                        stream.send.adjust(delta)?;
                        if delta > 0 && stream.send.available() > 0 {
                            self.events.push_back(H2Event::SendCapacity { stream_id });
                        }
                    }
                }
                Setting::HeaderTableSize(size) => {
                    self.encoder.set_max_table_size(size.min(ENCODER_TABLE_LIMIT) as usize);
                }
                _ => {}
            }
            self.remote_settings.apply(setting);
        }
        Frame::Settings {
            ack: true,
            params: Vec::new(),
        }
        .encode(&mut self.send_buf);

        if self.state == ConnState::Handshaking {
            self.state = ConnState::Open;
        }
        debug!(settings = ?self.remote_settings, "applied peer settings");
        Ok(())
    }

    fn finish_headers(&mut self, stream_id: u32, block: Bytes, end_stream: bool) -> Result<(), H2Error> {
        // Decode even for streams we discard; the HPACK state is shared.
        let headers = self.decoder.decode(&block)?;

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.state.can_recv() {
                return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
            }
            let event = if stream.headers_received {
                if !end_stream {
                    return Err(H2Error::StreamError(stream_id, ErrorCode::ProtocolError));
                }
                H2Event::Trailers { stream_id, headers }
            } else {
                stream.headers_received = true;
                H2Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                }
            };
            stream.state = stream.state.open();
            if end_stream {
                stream.state = stream.state.end_remote();
            }
            self.events.push_back(event);
            self.settle(stream_id);
            return Ok(());
        }

        if self.is_local(stream_id) || stream_id <= self.max_remote_id {
            if self.is_idle(stream_id) {
                return Err(H2Error::ProtocolError(format!("HEADERS on idle stream {stream_id}")));
            }
            trace!(stream_id, "discarding headers for closed stream");
            return Ok(());
        }
        if self.role == Role::Client {
            return Err(H2Error::ProtocolError(format!("server opened stream {stream_id}")));
        }

        // A new request stream.
        self.max_remote_id = stream_id;
        if self.goaway_sent {
            trace!(stream_id, "ignoring stream opened after GOAWAY");
            return Ok(());
        }
        if let Some(limit) = self.local_settings.max_concurrent_streams {
            if self.streams.len() >= limit as usize {
                return Err(H2Error::StreamError(stream_id, ErrorCode::RefusedStream));
            }
        }
        let mut stream = H2Stream::new(
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
            self.update_ratio,
        );
        stream.headers_received = true;
        stream.state = StreamState::Open;
        if end_stream {
            stream.state = stream.state.end_remote();
        }
        self.streams.insert(stream_id, stream);
        debug!(stream_id, "peer opened stream");
        self.events.push_back(H2Event::Headers {
            stream_id,
            headers,
            end_stream,
        });
        Ok(())
    }

    fn handle_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool, padding: u32) -> Result<(), H2Error> {
        let flowed = data.len() as u32 + padding;

        // The connection window is replenished as soon as data arrives;
        // stream windows do the actual pacing.
        self.conn_recv.consume(flowed)?;
        if let Some(increment) = self.conn_recv.release(flowed) {
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            }
            .encode(&mut self.send_buf);
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            if self.is_idle(stream_id) {
                return Err(H2Error::StreamError(stream_id, ErrorCode::ProtocolError));
            }
            trace!(stream_id, len = flowed, "discarding data for closed stream");
            return Ok(());
        };
        if !stream.state.can_recv() {
            return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
        }
        stream
            .recv
            .consume(flowed)
            .map_err(|_| H2Error::StreamError(stream_id, ErrorCode::FlowControlError))?;

        if end_stream {
            stream.state = stream.state.end_remote();
        } else if let Some(increment) = stream.recv.release(padding) {
            // Padding is never seen by the application.
            Frame::WindowUpdate { stream_id, increment }.encode(&mut self.send_buf);
        }
        self.events.push_back(H2Event::Data {
            stream_id,
            data,
            end_stream,
        });
        self.settle(stream_id);
        Ok(())
    }

    fn handle_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        if stream_id == 0 {
            self.conn_send.increase(increment)?;
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream
                .send
                .increase(increment)
                .map_err(|_| H2Error::StreamError(stream_id, ErrorCode::FlowControlError))?;
        } else if self.is_idle(stream_id) {
            return Err(H2Error::ProtocolError(format!("WINDOW_UPDATE on idle stream {stream_id}")));
        } else {
            return Ok(());
        }
        self.events.push_back(H2Event::SendCapacity { stream_id });
        Ok(())
    }

    fn handle_goaway(&mut self, last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) {
        debug!(last_stream_id, ?error_code, "peer sent GOAWAY");
        self.goaway_received = Some(last_stream_id);
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
        self.events.push_back(H2Event::GoAway {
            last_stream_id,
            error_code,
            debug_data,
        });

        // Our streams above `last_stream_id` were never processed.
        let mut refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|&id| self.is_local(id) && id > last_stream_id)
            .collect();
        refused.sort_unstable();
        for stream_id in refused {
            self.streams.remove(&stream_id);
            self.events.push_back(H2Event::StreamReset {
                stream_id,
                error_code: ErrorCode::RefusedStream,
                local: false,
            });
        }
    }

    // -- Helpers --

    fn is_local(&self, stream_id: u32) -> bool {
        (stream_id % 2 == 1) == (self.role == Role::Client)
    }

    /// Ids beyond anything either side has used.
    fn is_idle(&self, stream_id: u32) -> bool {
        if self.is_local(stream_id) {
            stream_id >= self.next_stream_id
        } else {
            stream_id > self.max_remote_id
        }
    }

    /// Forget a stream once both sides are done with it.
    fn settle(&mut self, stream_id: u32) {
        if self.streams.get(&stream_id).is_some_and(|s| s.state == StreamState::Closed) {
            self.streams.remove(&stream_id);
            debug!(stream_id, "stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_HEADER_LEN;

    fn request() -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", "http"),
            HeaderField::new(":path", "/"),
            HeaderField::new(":authority", "example.com"),
        ]
    }

    /// Move queued bytes from `from` into `to`.
    fn pump(from: &mut H2Connection, to: &mut H2Connection) {
        let bytes = from.take_pending_send();
        to.recv(&bytes).unwrap();
    }

    fn connected() -> (H2Connection, H2Connection) {
        let mut client = H2Connection::new(Role::Client, Settings::client_default());
        let mut server = H2Connection::new(Role::Server, Settings::server_default());
        pump(&mut client, &mut server);
        pump(&mut server, &mut client);
        pump(&mut client, &mut server);
        while client.poll_event().is_some() {}
        while server.poll_event().is_some() {}
        (client, server)
    }

    #[test]
    fn client_opens_with_magic_then_settings() {
        let mut client = H2Connection::new(Role::Client, Settings::client_default());
        let sent = client.take_pending_send();
        assert!(sent.starts_with(PREFACE));
        let header = FrameHeader::decode(&sent[PREFACE.len()..]).unwrap();
        assert_eq!(header.frame_type, frame::FRAME_SETTINGS);
        assert_eq!(header.flags, 0);

        let mut server = H2Connection::new(Role::Server, Settings::server_default());
        assert!(!server.take_pending_send().starts_with(PREFACE));
    }

    #[test]
    fn handshake_applies_both_sides_settings() {
        let (client, server) = connected();
        assert_eq!(client.state, ConnState::Open);
        assert_eq!(server.state, ConnState::Open);
        assert_eq!(client.remote_settings().max_concurrent_streams, Some(256));
        assert!(!server.remote_settings().enable_push);
    }

    #[test]
    fn bad_preface_closes_the_server() {
        let mut server = H2Connection::new(Role::Server, Settings::server_default());
        let _ = server.take_pending_send();
        assert!(server.recv(b"PRI * HTTP/2.0\r\n").is_ok());
        assert!(server.recv(b"\r\nXX").is_err());
        assert!(server.is_closed());
    }

    #[test]
    fn first_frame_must_be_settings() {
        let mut client = H2Connection::new(Role::Client, Settings::client_default());
        let err = client.handle_frame(Frame::Ping {
            ack: false,
            opaque_data: [0; 8],
        });
        assert!(matches!(err, Err(H2Error::ProtocolError(_))));
        assert!(client.is_closed());
    }

    #[test]
    fn request_and_response_round_trip() {
        let (mut client, mut server) = connected();
        let id = client.open_stream(&request(), true).unwrap();
        assert_eq!(id, 1);
        assert_eq!(client.stream_state(id), StreamState::HalfClosedLocal);
        pump(&mut client, &mut server);

        match server.poll_event().unwrap() {
            H2Event::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                assert_eq!(stream_id, 1);
                assert_eq!(headers, request());
                assert!(end_stream);
            }
            other => panic!("expected headers, got {other:?}"),
        }

        server.send_headers(1, &[HeaderField::new(":status", "200")], false).unwrap();
        assert_eq!(server.send_data(1, b"Hello World", true).unwrap(), 11);
        assert_eq!(server.stream_state(1), StreamState::Closed);
        pump(&mut server, &mut client);

        assert!(matches!(client.poll_event(), Some(H2Event::Headers { end_stream: false, .. })));
        match client.poll_event().unwrap() {
            H2Event::Data { data, end_stream, .. } => {
                assert_eq!(&data[..], b"Hello World");
                assert!(end_stream);
            }
            other => panic!("expected data, got {other:?}"),
        }
        assert_eq!(client.stream_state(1), StreamState::Closed);
        assert_eq!(client.open_stream(&request(), true).unwrap(), 3);
    }

    #[test]
    fn large_header_blocks_use_continuation() {
        let (mut client, mut server) = connected();
        let mut headers = request();
        for i in 0..40 {
            headers.push(HeaderField::new(format!("x-filler-{i}"), vec![b'v'; 1000]));
        }
        client.open_stream(&headers, true).unwrap();
        let sent = client.take_pending_send();
        let first = FrameHeader::decode(&sent).unwrap();
        assert_eq!(first.frame_type, frame::FRAME_HEADERS);
        assert_eq!(first.flags & frame::FLAG_END_HEADERS, 0);

        server.recv(&sent).unwrap();
        match server.poll_event().unwrap() {
            H2Event::Headers { headers: got, .. } => assert_eq!(got, headers),
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn interleaving_a_header_block_is_fatal() {
        let (_, mut server) = connected();
        server
            .handle_frame(Frame::Headers {
                stream_id: 1,
                block: Bytes::from_static(&[0x82]),
                end_stream: false,
                end_headers: false,
                priority: None,
            })
            .unwrap();
        let err = server.handle_frame(Frame::Ping {
            ack: false,
            opaque_data: [0; 8],
        });
        assert!(err.is_err());
        assert!(server.is_closed());
        let mut sent = BytesMut::from(&server.take_pending_send()[..]);
        assert!(matches!(
            frame::decode_frame(&mut sent, 16_384).unwrap(),
            Some(Frame::GoAway {
                error_code: ErrorCode::ProtocolError,
                ..
            })
        ));
    }

    #[test]
    fn send_data_respects_windows() {
        let (mut client, mut server) = connected();
        let id = client.open_stream(&request(), false).unwrap();
        pump(&mut client, &mut server);

        let body = vec![7u8; 100_000];
        assert_eq!(client.send_capacity(id), 65_535);
        assert_eq!(client.send_data(id, &body, true).unwrap(), 65_535);
        assert_eq!(client.send_capacity(id), 0);
        assert_eq!(client.send_data(id, &body[65_535..], true).unwrap(), 0);
        assert_eq!(client.stream_state(id), StreamState::Open);

        // Frames never exceed the peer's maximum.
        let sent = client.take_pending_send();
        let mut buf = BytesMut::from(&sent[..]);
        let mut frames = 0;
        while let Some(frame) = frame::decode_frame(&mut buf, 16_384).unwrap() {
            assert!(matches!(frame, Frame::Data { end_stream: false, .. }));
            frames += 1;
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn data_on_idle_stream_is_reset() {
        let (_, mut server) = connected();
        server
            .handle_frame(Frame::Data {
                stream_id: 9,
                data: Bytes::from_static(b"x"),
                end_stream: false,
                padding: 0,
            })
            .unwrap();
        assert_eq!(
            server.poll_event(),
            Some(H2Event::StreamReset {
                stream_id: 9,
                error_code: ErrorCode::ProtocolError,
                local: true,
            })
        );
        assert!(!server.is_closed());
    }

    #[test]
    fn stream_overrun_resets_only_that_stream() {
        let (mut client, mut server) = connected();
        let a = client.open_stream(&request(), false).unwrap();
        let b = client.open_stream(&request(), false).unwrap();
        pump(&mut client, &mut server);
        while server.poll_event().is_some() {}

        // Bypass the client's own accounting to overrun stream `a`.
        let mut raw = BytesMut::new();
        for _ in 0..5 {
            Frame::Data {
                stream_id: a,
                data: Bytes::from(vec![0; 16_000]),
                end_stream: false,
                padding: 0,
            }
            .encode(&mut raw);
        }
        server.recv(&raw).unwrap();
        let resets: Vec<_> = std::iter::from_fn(|| server.poll_event())
            .filter(|e| matches!(e, H2Event::StreamReset { .. }))
            .collect();
        assert_eq!(
            resets,
            [H2Event::StreamReset {
                stream_id: a,
                error_code: ErrorCode::FlowControlError,
                local: true,
            }]
        );
        assert_eq!(server.stream_state(b), StreamState::Open);
        assert_eq!(server.stream_state(a), StreamState::Closed);
    }

    #[test]
    fn released_capacity_reopens_the_window() {
        let (mut client, mut server) = connected();
        let id = client.open_stream(&request(), false).unwrap();
        client.send_data(id, &[1; 65_535], false).unwrap();
        pump(&mut client, &mut server);
        let received: usize = std::iter::from_fn(|| server.poll_event())
            .map(|e| match e {
                H2Event::Data { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(received, 65_535);

        server.release_capacity(id, received);
        pump(&mut server, &mut client);
        assert!(std::iter::from_fn(|| client.poll_event()).any(|e| e == H2Event::SendCapacity { stream_id: id }));
        assert_eq!(client.send_capacity(id), 65_535);
    }

    #[test]
    fn goaway_refuses_unprocessed_streams() {
        let (mut client, mut server) = connected();
        let first = client.open_stream(&request(), true).unwrap();
        pump(&mut client, &mut server);
        let second = client.open_stream(&request(), true).unwrap();

        server.send_goaway(ErrorCode::NoError, b"");
        pump(&mut server, &mut client);
        assert!(matches!(client.poll_event(), Some(H2Event::GoAway { last_stream_id: 1, .. })));
        assert_eq!(
            client.poll_event(),
            Some(H2Event::StreamReset {
                stream_id: second,
                error_code: ErrorCode::RefusedStream,
                local: false,
            })
        );
        assert_eq!(client.stream_state(first), StreamState::HalfClosedLocal);
        assert!(client.open_stream(&request(), true).is_err());
    }

    #[test]
    fn ping_is_answered_and_acked() {
        let (mut client, mut server) = connected();
        client.send_ping(*b"12345678");
        pump(&mut client, &mut server);
        pump(&mut server, &mut client);
        assert_eq!(
            client.poll_event(),
            Some(H2Event::PingAck {
                opaque_data: *b"12345678"
            })
        );
    }

    #[test]
    fn push_promise_is_a_protocol_error() {
        let (mut client, _) = connected();
        let err = client.handle_frame(Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            block: Bytes::new(),
            end_headers: true,
        });
        assert!(matches!(err, Err(H2Error::ProtocolError(_))));
    }

    #[test]
    fn servers_cannot_open_streams() {
        let (_, mut server) = connected();
        assert!(server.open_stream(&request(), true).is_err());
    }

    #[test]
    fn larger_connection_window_is_announced() {
        let mut client =
            H2Connection::new(Role::Client, Settings::client_default()).with_connection_window(16 << 20);
        let sent = client.take_pending_send();
        let mut buf = BytesMut::from(&sent[PREFACE.len()..]);
        let _settings = frame::decode_frame(&mut buf, 16_384).unwrap().unwrap();
        assert_eq!(
            frame::decode_frame(&mut buf, 16_384).unwrap(),
            Some(Frame::WindowUpdate {
                stream_id: 0,
                increment: (16 << 20) - DEFAULT_WINDOW_SIZE,
            })
        );
    }

    #[test]
    fn frame_by_frame_receive() {
        let (mut client, mut server) = connected();
        let id = client.open_stream(&request(), true).unwrap();
        let bytes = client.take_pending_send();
        let header = FrameHeader::decode(&bytes).unwrap();
        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..]);
        server.recv_frame(&header, payload).unwrap();
        assert!(matches!(
            server.poll_event(),
            Some(H2Event::Headers { stream_id, end_stream: true, .. }) if stream_id == id
        ));

        let oversized = FrameHeader {
            length: 16_385,
            frame_type: FRAME_DATA,
            flags: 0,
            stream_id: id,
        };
        assert_eq!(
            server.recv_frame(&oversized, Bytes::new()),
            Err(H2Error::FrameSizeError)
        );
        assert!(server.is_closed());
    }
}
