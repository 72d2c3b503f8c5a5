use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::trace;

use super::PipeSocket;
use crate::error::{Error, Result};
use crate::io::AsyncRead;
use crate::runtime::{LoopHandle, TaskHandle};

/// A read that can be interrupted from outside.
///
/// A pump task copies `input` into a [`PipeSocket`]; reads come from the
/// socket. [`interrupt`](Self::interrupt) resolves a pending read with
/// `Ok(true)` and no data. The pump keeps the bytes it was about to hand
/// over and offers them to the next read, so nothing is lost or repeated.
pub struct InterruptibleRead {
    pipe: Arc<PipeSocket>,
    pump: TaskHandle,
}

impl InterruptibleRead {
    pub fn new<R>(handle: &LoopHandle, input: R) -> Result<Self>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let pipe = Arc::new(PipeSocket::new());
        let out = pipe.clone();
        let pump = handle.spawn(async move {
            let mut buf = BytesMut::new();
            loop {
                if buf.is_empty() {
                    match input.read(&mut buf).await {
                        Ok(true) => continue,
                        Ok(false) => {
                            out.close();
                            return;
                        }
                        Err(e) => {
                            out.close_with(e);
                            return;
                        }
                    }
                }
                match out.write(&mut buf).await {
                    Ok(()) => {}
                    Err(Error::Interrupted) => trace!(pending = buf.len(), "pump write interrupted"),
                    Err(_) => return,
                }
            }
        })?;
        Ok(InterruptibleRead { pipe, pump })
    }

    pub async fn read(&self, buf: &mut BytesMut) -> Result<bool> {
        self.pipe.read(buf).await
    }

    /// Resolve the pending read, if any, with no data. Returns whether a
    /// read was interrupted.
    pub fn interrupt(&self) -> bool {
        self.pipe.interrupt_read()
    }

    /// Bounce the pump's pending hand-off; its bytes are offered again.
    pub fn read_transient(&self) -> bool {
        self.pipe.interrupt_write()
    }
}

impl AsyncRead for InterruptibleRead {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        self.pipe.read(buf)
    }
}

impl Drop for InterruptibleRead {
    fn drop(&mut self) {
        self.pump.cancel();
        self.pipe.close();
    }
}
