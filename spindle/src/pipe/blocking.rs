use std::future::{Future, poll_fn};
use std::task::{Poll, Waker};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::io::AsyncWrite;

/// A non-blocking destination: consumes as much of `buf` as it can right
/// now and leaves the rest in place.
pub trait WriteSink: Send + Sync {
    fn write_some(&self, buf: &mut BytesMut) -> Result<()>;
}

impl<F> WriteSink for F
where
    F: Fn(&mut BytesMut) -> Result<()> + Send + Sync,
{
    fn write_some(&self, buf: &mut BytesMut) -> Result<()> {
        self(buf)
    }
}

struct State {
    /// Bumped by every `writable()`; a writer waits for it to change.
    generation: u64,
    waker: Option<Waker>,
    writing: bool,
    closed: Option<Result<()>>,
}

/// Suspending writer over a [`WriteSink`].
///
/// `write` offers the buffer to the sink, and while bytes remain, suspends
/// until the sink's owner calls [`writable`](Self::writable), then retries.
pub struct BlockingWritePipe<S> {
    sink: S,
    state: Mutex<State>,
}

impl<S: WriteSink> BlockingWritePipe<S> {
    pub fn new(sink: S) -> Self {
        BlockingWritePipe {
            sink,
            state: Mutex::new(State {
                generation: 0,
                waker: None,
                writing: false,
                closed: None,
            }),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Signal that the sink can accept more; resumes a suspended writer.
    pub fn writable(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Close the pipe. A suspended writer fails with [`Error::Closed`].
    /// Returns false if already closed.
    pub fn close(&self) -> bool {
        self.finish(Ok(()))
    }

    /// Close the pipe with an error handed to current and later writers.
    pub fn close_with(&self, error: Error) -> bool {
        self.finish(Err(error))
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    fn finish(&self, closed: Result<()>) -> bool {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(closed);
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn closed_error(closed: &Result<()>) -> Error {
        match closed {
            Ok(()) => Error::Closed,
            Err(e) => e.clone(),
        }
    }

    /// Write all of `buf`. Fails with [`Error::DoubleWrite`] if another
    /// write is in progress.
    pub async fn write(&self, buf: &mut BytesMut) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(closed) = &state.closed {
                return Err(Self::closed_error(closed));
            }
            if state.writing {
                return Err(Error::DoubleWrite);
            }
            state.writing = true;
        }
        let _writing = WritingGuard(&self.state);

        loop {
            // Sampled before offering, so a `writable()` that lands between
            // the sink call and parking is not lost.
            let generation = self.state.lock().generation;
            if let Err(e) = self.sink.write_some(buf) {
                self.close_with(e.clone());
                return Err(e);
            }
            if buf.is_empty() {
                return Ok(());
            }
            poll_fn(|cx| {
                let mut state = self.state.lock();
                if let Some(closed) = &state.closed {
                    return Poll::Ready(Err(Self::closed_error(closed)));
                }
                if state.generation != generation {
                    return Poll::Ready(Ok(()));
                }
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            })
            .await?;
        }
    }
}

struct WritingGuard<'a>(&'a Mutex<State>);

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.writing = false;
        state.waker = None;
    }
}

impl<S: WriteSink> AsyncWrite for BlockingWritePipe<S> {
    fn write(&self, buf: &mut BytesMut) -> impl Future<Output = Result<()>> + Send {
        BlockingWritePipe::write(self, buf)
    }
}
