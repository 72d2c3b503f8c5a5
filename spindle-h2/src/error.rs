use thiserror::Error;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes map to `InternalError` (RFC 7540 Section 7).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> u32 {
        code as u32
    }
}

/// Errors produced by the HTTP/2 framing layer.
///
/// Everything except [`H2Error::StreamError`] is fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum H2Error {
    /// Received a frame that violates the protocol.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// HPACK header block could not be decoded.
    #[error("HPACK compression error")]
    CompressionError,
    /// Connection-level flow control violation.
    #[error("flow control error")]
    FlowControlError,
    /// Frame length is invalid for its type or exceeds the maximum.
    #[error("frame size error")]
    FrameSizeError,
    /// Connection-level error with an explicit code.
    #[error("connection error: {0:?}")]
    ConnectionError(ErrorCode),
    /// Error confined to one stream; the connection stays usable.
    #[error("stream {0} error: {1:?}")]
    StreamError(u32, ErrorCode),
}

impl H2Error {
    /// The error code to put on the wire (GOAWAY or RST_STREAM).
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ProtocolError(_) => ErrorCode::ProtocolError,
            Self::CompressionError => ErrorCode::CompressionError,
            Self::FlowControlError => ErrorCode::FlowControlError,
            Self::FrameSizeError => ErrorCode::FrameSizeError,
            Self::ConnectionError(code) | Self::StreamError(_, code) => *code,
        }
    }

    /// The affected stream, for stream-level errors.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Self::StreamError(id, _) => Some(*id),
            _ => None,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        self.stream_id().is_none()
    }
}
