use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::task::Poll;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::io::AsyncRead;
use crate::metrics::{PIPE_BACKPRESSURE, PIPE_BYTES_WRITTEN};
use crate::sync::Cooperator;

struct State {
    pending: BytesMut,
    /// `Some` once the stream has ended, cleanly or with an error.
    eos: Option<Result<()>>,
    /// Latched when a write reaches the mark; cleared (firing `writable`)
    /// by the read that drains below it.
    needs_writable: bool,
}

/// Buffer between a producer that can only push and a consumer that pulls.
pub struct NonBlockingWritePipe {
    state: Mutex<State>,
    reader: Cooperator,
    high_water_mark: usize,
    writable: Box<dyn Fn() + Send + Sync>,
}

impl NonBlockingWritePipe {
    /// `writable` is invoked, outside any lock, once each time a read takes
    /// the buffer back below `high_water_mark` after a write reached it.
    pub fn new<F>(high_water_mark: usize, writable: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        NonBlockingWritePipe {
            state: Mutex::new(State {
                pending: BytesMut::new(),
                eos: None,
                needs_writable: false,
            }),
            reader: Cooperator::new(),
            high_water_mark,
            writable: Box::new(writable),
        }
    }

    /// Buffer `data` and wake the reader. Returns `Ok(false)` once the
    /// buffered size is at or above the high-water mark, telling the
    /// producer to pause until `writable` fires.
    pub fn write(&self, data: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        if state.eos.is_some() {
            return Err(Error::WriteAfterEnd);
        }
        state.pending.extend_from_slice(data);
        PIPE_BYTES_WRITTEN.add(data.len() as u64);
        let below = state.pending.len() < self.high_water_mark;
        if !below && !state.needs_writable {
            state.needs_writable = true;
            PIPE_BACKPRESSURE.increment();
        }
        drop(state);
        if !data.is_empty() {
            self.reader.resume();
        }
        Ok(below)
    }

    /// Mark a clean end of stream. Returns false if already ended.
    pub fn end(&self) -> bool {
        self.finish(Ok(()))
    }

    /// End the stream with an error, replayed by every later read once
    /// buffered data is drained. Returns false if already ended.
    pub fn end_with(&self, error: Error) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, eos: Result<()>) -> bool {
        let mut state = self.state.lock();
        if state.eos.is_some() {
            return false;
        }
        state.eos = Some(eos);
        drop(state);
        self.reader.resume();
        true
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().eos.is_some()
    }

    /// Bytes buffered and not yet read.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Move everything buffered into `buf`, suspending while empty.
    ///
    /// Returns `Ok(false)` at a clean end once drained, or replays the
    /// stored error. A read displaced by a newer concurrent read returns
    /// `Ok(true)` with nothing delivered.
    pub async fn read(&self, buf: &mut BytesMut) -> Result<bool> {
        let mut parked = self.reader.yield_now();
        let mut fire_writable = false;
        let result = poll_fn(|cx| {
            let mut state = self.state.lock();
            if !state.pending.is_empty() {
                buf.unsplit(state.pending.split());
                if state.needs_writable {
                    state.needs_writable = false;
                    fire_writable = true;
                }
                return Poll::Ready(Ok(true));
            }
            if let Some(eos) = &state.eos {
                return Poll::Ready(eos.clone().map(|()| false));
            }
            // Registered under the state lock so a write cannot slip in
            // between the emptiness check and parking.
            Pin::new(&mut parked).poll(cx).map(|()| Ok(true))
        })
        .await;
        if fire_writable {
            (self.writable)();
        }
        result
    }
}

impl AsyncRead for NonBlockingWritePipe {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        NonBlockingWritePipe::read(self, buf)
    }
}

impl std::fmt::Debug for NonBlockingWritePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NonBlockingWritePipe")
            .field("pending", &state.pending.len())
            .field("high_water_mark", &self.high_water_mark)
            .field("ended", &state.eos.is_some())
            .finish()
    }
}
