//! Per-stream state tracking for HTTP/2 (RFC 7540 Section 5.1).

use crate::flowcontrol::{FlowControl, RecvWindow};

/// State of an HTTP/2 stream. Reserved states are absent because push
/// is never enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// Peer sent END_STREAM.
    HalfClosedRemote,
    /// Both sides ended, or RST_STREAM was sent or received.
    Closed,
}

impl StreamState {
    /// After a header block is sent or received on an idle stream.
    pub fn open(self) -> Self {
        match self {
            Self::Idle => Self::Open,
            other => other,
        }
    }

    /// After we send END_STREAM.
    pub fn end_local(self) -> Self {
        match self {
            Self::Idle | Self::Open => Self::HalfClosedLocal,
            Self::HalfClosedRemote => Self::Closed,
            other => other,
        }
    }

    /// After the peer sends END_STREAM.
    pub fn end_remote(self) -> Self {
        match self {
            Self::Idle | Self::Open => Self::HalfClosedRemote,
            Self::HalfClosedLocal => Self::Closed,
            other => other,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedRemote)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }
}

/// State and both flow-control windows of one stream.
#[derive(Debug)]
pub(crate) struct H2Stream {
    pub state: StreamState,
    pub send: FlowControl,
    pub recv: RecvWindow,
    /// A header block has been received; the next one is trailers.
    pub headers_received: bool,
}

impl H2Stream {
    pub fn new(send_window: u32, recv_window: u32, ratio: u32) -> Self {
        Self {
            state: StreamState::Idle,
            send: FlowControl::new(send_window),
            recv: RecvWindow::new(recv_window, ratio),
            headers_received: false,
        }
    }
}
