use spindle_h2::{ErrorCode, H2Error};

/// Errors produced by HTTP/2 connections and streams.
///
/// `Clone` so one connection failure can be handed to every stream and
/// every later caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    /// The connection is closed. `NoError` means an orderly shutdown.
    #[error("connection closed ({0:?})")]
    ConnectionClosed(ErrorCode),

    /// The stream was reset by either endpoint.
    #[error("stream reset ({0:?})")]
    StreamReset(ErrorCode),

    /// The peer sent GOAWAY; streams above `last_stream_id` were never
    /// processed and new streams are refused.
    #[error("goaway received (last stream {last_stream_id}, {code:?})")]
    GoAway { last_stream_id: u32, code: ErrorCode },

    /// HTTP/2 protocol error.
    #[error("h2 error: {0}")]
    H2(#[from] H2Error),

    /// Failure in the underlying socket or runtime.
    #[error("io error: {0}")]
    Io(spindle::Error),

    /// Protocol error (unexpected event, bad state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
}

impl HttpError {
    /// The HTTP/2 error code that best describes this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionClosed(code) | Self::StreamReset(code) => *code,
            Self::GoAway { code, .. } => *code,
            Self::H2(e) => e.code(),
            Self::Io(_) => ErrorCode::InternalError,
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Config(_) => ErrorCode::InternalError,
        }
    }
}

impl From<spindle::Error> for HttpError {
    /// Unwraps an `HttpError` that travelled through a spindle pipe or
    /// promise; everything else is an I/O failure.
    fn from(err: spindle::Error) -> Self {
        if let spindle::Error::Other(inner) = &err
            && let Some(http) = inner.downcast_ref::<HttpError>()
        {
            return http.clone();
        }
        HttpError::Io(err)
    }
}

impl From<HttpError> for spindle::Error {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Io(inner) => inner,
            other => spindle::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_a_trip_through_spindle() {
        let original = HttpError::StreamReset(ErrorCode::Cancel);
        let carried: spindle::Error = original.into();
        match HttpError::from(carried) {
            HttpError::StreamReset(ErrorCode::Cancel) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn spindle_errors_stay_io() {
        let err = HttpError::from(spindle::Error::Closed);
        assert!(matches!(err, HttpError::Io(spindle::Error::Closed)));
        assert!(matches!(spindle::Error::from(err), spindle::Error::Closed));
    }

    #[test]
    fn codes() {
        assert_eq!(HttpError::H2(H2Error::FrameSizeError).code(), ErrorCode::FrameSizeError);
        assert_eq!(
            HttpError::GoAway {
                last_stream_id: 1,
                code: ErrorCode::EnhanceYourCalm,
            }
            .code(),
            ErrorCode::EnhanceYourCalm
        );
    }
}
