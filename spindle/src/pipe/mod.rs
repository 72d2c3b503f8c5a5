//! Push/pull adapters with backpressure.
//!
//! - [`NonBlockingWritePipe`]: a push-only producer (callback or interrupt
//!   driven) feeds a pulling reader; `write` never blocks and reports when
//!   the high-water mark is reached.
//! - [`BlockingWritePipe`]: a suspending writer feeds a non-blocking sink
//!   that accepts what it can and signals [`writable`](BlockingWritePipe::writable)
//!   when it can take more.
//! - [`buffer`]: read-ahead over any [`AsyncRead`](crate::AsyncRead).

mod blocking;
mod buffer;
mod nonblocking;

pub use blocking::{BlockingWritePipe, WriteSink};
pub use buffer::{Buffered, buffer, buffer_with};
pub use nonblocking::NonBlockingWritePipe;
