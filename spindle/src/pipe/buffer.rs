use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;

use bytes::BytesMut;
use tracing::trace;

use super::NonBlockingWritePipe;
use crate::error::Result;
use crate::io::AsyncRead;
use crate::runtime::{LoopHandle, TaskHandle};
use crate::sync::Cooperator;

/// Wakes the pump once the pipe drains below its mark. The flag covers a
/// `writable` that fires before the pump has parked.
#[derive(Default)]
struct Drained {
    flag: AtomicBool,
    pump: Cooperator,
}

impl Drained {
    fn signal(&self) {
        self.flag.store(true, Ordering::Release);
        self.pump.resume();
    }

    async fn wait(&self) {
        let mut parked = self.pump.yield_now();
        poll_fn(|cx| {
            let parked = Pin::new(&mut parked).poll(cx);
            if self.flag.swap(false, Ordering::AcqRel) {
                return Poll::Ready(());
            }
            parked
        })
        .await
    }
}

/// Read-ahead over `read` using the loop's configured
/// `buffer_high_water_mark`. See [`buffer_with`].
pub fn buffer<R>(handle: &LoopHandle, read: R) -> Result<Buffered>
where
    R: AsyncRead + Send + Sync + 'static,
{
    buffer_with(handle, read, handle.config().buffer_high_water_mark)
}

/// Read-ahead over `read`: a task pulls from the source into a
/// [`NonBlockingWritePipe`], pausing whenever `high_water_mark` bytes are
/// waiting unread. Dropping the returned reader stops the pump.
pub fn buffer_with<R>(handle: &LoopHandle, read: R, high_water_mark: usize) -> Result<Buffered>
where
    R: AsyncRead + Send + Sync + 'static,
{
    let drained = Arc::new(Drained::default());
    let signal = drained.clone();
    let pipe = Arc::new(NonBlockingWritePipe::new(high_water_mark, move || signal.signal()));
    let chunk = handle.config().read_chunk_size;

    let sink = pipe.clone();
    let pump = handle.spawn(async move {
        let mut buf = BytesMut::with_capacity(chunk);
        loop {
            let more = match read.read(&mut buf).await {
                Ok(more) => more,
                Err(e) => {
                    sink.end_with(e);
                    return;
                }
            };
            if !buf.is_empty() {
                let below = match sink.write(&buf) {
                    Ok(below) => below,
                    Err(_) => return,
                };
                buf.clear();
                if !below {
                    trace!(mark = high_water_mark, "read-ahead paused");
                    drained.wait().await;
                }
            }
            if !more {
                sink.end();
                return;
            }
        }
    })?;
    Ok(Buffered { pipe, pump })
}

/// Reader returned by [`buffer`].
pub struct Buffered {
    pipe: Arc<NonBlockingWritePipe>,
    pump: TaskHandle,
}

impl Buffered {
    /// Bytes read ahead and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.pipe.len()
    }
}

impl AsyncRead for Buffered {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        self.pipe.read(buf)
    }
}

impl Drop for Buffered {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}
