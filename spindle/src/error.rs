use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by spindle primitives.
///
/// `Clone` so a terminal error can be replayed to every later caller of a
/// finished baton, an ended pipe or a rejected promise.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The operation was cancelled (promise cancel, dropped task, lost race).
    #[error("operation cancelled")]
    Cancelled,
    /// A timeout raced the operation and won.
    #[error("operation timed out")]
    Timeout,
    /// The peer or the channel is closed.
    #[error("closed")]
    Closed,
    /// A pending operation was interrupted before it could complete.
    #[error("interrupted")]
    Interrupted,
    /// A read was cancelled by a concurrent read on the same stream.
    #[error("read cancelled by another read")]
    DoubleRead,
    /// A write was attempted while another write was still in progress.
    #[error("write already in progress")]
    DoubleWrite,
    /// `finish` was called on a baton that is already finished.
    #[error("already finished")]
    AlreadyFinished,
    /// A write was attempted after end of stream was signalled.
    #[error("write after end of stream")]
    WriteAfterEnd,
    /// The stream ended before the expected amount of data arrived.
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(&'static str),
    /// Malformed data in a framed stream.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The event loop is gone and can no longer accept work.
    #[error("event loop stopped")]
    LoopStopped,
    /// The task slab is at its configured capacity.
    #[error("task limit reached")]
    TaskLimit,
    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// Error raised by a collaborator.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Arc::new(err))
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result alias used throughout spindle.
pub type Result<T, E = Error> = std::result::Result<T, E>;
