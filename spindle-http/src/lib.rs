//! Multiplexed HTTP/2 on the spindle runtime.
//!
//! Drives the sans-IO `spindle-h2` state machine over any
//! [`AsyncSocket`](spindle::AsyncSocket), exposing each stream as its own
//! byte stream with per-stream flow control.
//!
//! # Architecture
//!
//! `Http2Connection` spawns a reader and a writer task on the event loop.
//! The reader feeds frames to the state machine and routes events to
//! streams; the writer drains the frames the state machine queues. An
//! `Http2Stream` implements `AsyncRead`/`AsyncWrite`: reading releases
//! window credit back to the peer, writing suspends on an exhausted send
//! window until a WINDOW_UPDATE arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle_http::{Http2Config, Http2Connection, request_headers, status};
//!
//! async fn example(handle: &spindle::LoopHandle, socket: impl spindle::AsyncSocket + Send + Sync + 'static)
//!     -> Result<(), spindle_http::HttpError>
//! {
//!     let conn = Http2Connection::client(handle, socket, Http2Config::client()).await?;
//!
//!     let stream = conn.connect(&request_headers("GET", "/", "example.com"), true)?;
//!     let headers = stream.headers().await?;
//!     assert_eq!(status(&headers), Some(200));
//!
//!     let body = spindle::io::read_to_end(&stream).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Copy Semantics
//!
//! | Path | Copies | Notes |
//! |------|--------|-------|
//! | **recv data** | 2 | `AsyncReader` buffers the frame; the stream pipe copies it into the caller's buffer. |
//! | **send data** | 2 | `send_data` encodes into the state machine's send buffer; the outbound pipe copies it for the writer. |
//! | **headers** | 1 | HPACK decodes into owned `HeaderField`s. |

pub mod config;
pub mod connection;
pub mod error;
pub mod headers;
pub(crate) mod metrics;
pub mod stream;

pub use config::Http2Config;
pub use connection::{ConnectionState, Http2Connection};
pub use error::HttpError;
pub use headers::{header, method_and_path, request_headers, response_headers, status};
pub use spindle_h2::{ErrorCode, HeaderField, StreamState};
pub use stream::Http2Stream;
