//! spindle: a cooperative, single-threaded async I/O runtime.
//!
//! spindle runs tasks on an explicitly constructed [`EventLoop`] (one
//! *affinity thread* per loop) and provides the suspension primitives that
//! byte-stream protocols are built from:
//!
//! - [`Baton`]: two-party rendezvous with strict alternation.
//! - [`Cooperator`]: single-slot suspend/resume.
//! - [`Promise`]: exactly-once completion with callback fan-out.
//! - [`NonBlockingWritePipe`] / [`BlockingWritePipe`]: push/pull adapters
//!   with high-water-mark backpressure.
//! - [`AsyncReader`]: scan/length/peek parsing over any [`AsyncRead`].
//! - [`PipeSocket`], [`pipe_socket_pair`], [`PipeServer`]: in-memory sockets.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bytes::BytesMut;
//! use spindle::{AsyncRead, AsyncWrite, Config, EventLoop, pipe_socket_pair};
//!
//! fn main() -> Result<(), spindle::Error> {
//!     let mut event_loop = EventLoop::new(Config::default())?;
//!     let handle = event_loop.handle();
//!     let (client, server) = pipe_socket_pair();
//!
//!     handle.spawn(async move {
//!         let mut buf = BytesMut::from(&b"hello"[..]);
//!         let _ = client.write(&mut buf).await;
//!     })?;
//!
//!     let greeting = event_loop.block_on(async move {
//!         let mut buf = BytesMut::new();
//!         server.read(&mut buf).await.map(|_| buf)
//!     })?;
//!     assert_eq!(&greeting[..], b"hello");
//!     Ok(())
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;
pub(crate) mod runtime;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod filter;
pub mod io;
pub mod pipe;
pub mod promise;
pub mod reader;
pub mod socket;
pub mod sync;

// ── Re-exports: Event loop ──────────────────────────────────────────────

/// Single-threaded executor.
pub use runtime::EventLoop;
/// Cloneable, thread-safe handle for posting work onto an [`EventLoop`].
pub use runtime::LoopHandle;
/// Future returned by [`LoopHandle::sleep`].
pub use runtime::Sleep;
/// Handle to a spawned task; cancels on request.
pub use runtime::TaskHandle;
/// Identifies a timer from [`LoopHandle::post_delayed`].
pub use runtime::TimerId;
/// Result of [`select()`]: which branch completed.
pub use runtime::select::Either;
/// Future returned by [`join()`].
pub use runtime::select::Join;
/// Future returned by [`select()`].
pub use runtime::select::Select;
/// Poll two futures concurrently, returning both outputs when complete.
pub use runtime::select::join;
/// Poll two futures concurrently, returning whichever completes first.
pub use runtime::select::select;
/// Race a future against a sleep.
pub use runtime::select::timeout;

// ── Re-exports: Primitives ──────────────────────────────────────────────

pub use promise::{Deferred, Promise};
pub use sync::{Baton, BatonResult, Cooperator};

// ── Re-exports: Streams ─────────────────────────────────────────────────

pub use filter::{ChunkedDecoder, ChunkedEncoder, ContentLengthPipe, Pipe, Piped};
pub use io::{AsyncRead, AsyncSocket, AsyncWrite, BytesReader};
pub use pipe::{BlockingWritePipe, Buffered, NonBlockingWritePipe, WriteSink, buffer, buffer_with};
pub use reader::AsyncReader;
pub use socket::{InterruptibleRead, PairedPipeSocket, PipeServer, PipeSocket, pipe_socket_pair};

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Errors surfaced by spindle primitives.
pub use error::Error;
/// `Result` with [`Error`] as the default error type.
pub use error::Result;
