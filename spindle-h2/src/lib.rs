//! Sans-IO HTTP/2 for both endpoints.
//!
//! This crate holds the HTTP/2 protocol logic without any I/O: frames,
//! HPACK, SETTINGS, flow-control windows and the connection state machine.
//! The caller feeds bytes in via `recv()` (or one frame at a time via
//! `recv_frame()`) and pulls bytes out via `take_pending_send()`.
//! `spindle-http` drives it over a `spindle` socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle_h2::{H2Connection, H2Event, HeaderField, Role, Settings};
//!
//! let mut h2 = H2Connection::new(Role::Client, Settings::client_default());
//! transport_send(&h2.take_pending_send());
//!
//! let stream_id = h2.open_stream(&[
//!     HeaderField::new(":method", "GET"),
//!     HeaderField::new(":path", "/"),
//!     HeaderField::new(":scheme", "http"),
//!     HeaderField::new(":authority", "example.com"),
//! ], true)?;
//! transport_send(&h2.take_pending_send());
//!
//! h2.recv(&received)?;
//! while let Some(event) = h2.poll_event() {
//!     match event {
//!         H2Event::Headers { headers, .. } => { /* response */ }
//!         H2Event::Data { stream_id, data, .. } => {
//!             consume(&data);
//!             h2.release_capacity(stream_id, data.len());
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod connection;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
mod huffman;
pub mod settings;
mod stream;

pub use connection::{H2Connection, H2Event, PREFACE, Role};
pub use error::{ErrorCode, H2Error};
pub use frame::{FRAME_HEADER_LEN, Frame, FrameHeader};
pub use hpack::HeaderField;
pub use settings::Settings;
pub use stream::StreamState;
