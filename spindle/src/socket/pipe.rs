use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::io::{AsyncRead, AsyncSocket, AsyncWrite};
use crate::sync::Baton;

/// What each side offers through the baton.
#[derive(Debug, Clone)]
enum PipeData {
    Read,
    Write(Bytes),
    Interrupt,
}

/// A loopback socket: bytes written are handed directly to the reader,
/// one write per read, with no intermediate queue.
///
/// Only one read and one write may be pending. A second concurrent read
/// displaces the first, which returns `Ok(true)` with nothing delivered; a
/// second concurrent write fails with [`Error::DoubleWrite`] and leaves the
/// first pending.
#[derive(Debug, Default)]
pub struct PipeSocket {
    baton: Baton<PipeData>,
}

impl PipeSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, buf: &mut BytesMut) -> Result<bool> {
        loop {
            let result = self.baton.exchange(Ok(PipeData::Read)).await;
            if result.finished {
                return result.value.map(|_| false);
            }
            match result.value? {
                PipeData::Write(data) => {
                    buf.extend_from_slice(&data);
                    return Ok(true);
                }
                PipeData::Interrupt => return Ok(true),
                // We displaced an older pending read; now wait ourselves.
                PipeData::Read if result.resumed => continue,
                // A newer read displaced us.
                PipeData::Read => return Ok(true),
            }
        }
    }

    /// Hand all of `buf` to a reader. On failure `buf` is left untouched.
    pub async fn write(&self, buf: &mut BytesMut) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let offer = PipeData::Write(Bytes::copy_from_slice(buf));
        let result = self
            .baton
            .exchange_checked(Ok(offer), |pending| match pending {
                Ok(PipeData::Write(_)) => Err(Error::DoubleWrite),
                _ => Ok(()),
            })
            .await;
        if result.finished {
            return Err(result.value.err().unwrap_or(Error::Closed));
        }
        match result.value? {
            PipeData::Read => {
                buf.clear();
                Ok(())
            }
            PipeData::Interrupt => Err(Error::Interrupted),
            PipeData::Write(_) => Err(Error::DoubleWrite),
        }
    }

    /// Make a pending read return `Ok(true)` with no data. Returns false
    /// (and does nothing) if no read is pending.
    pub fn interrupt_read(&self) -> bool {
        self.baton
            .take_if(PipeData::Interrupt, |pending| matches!(pending, Ok(PipeData::Read)))
            .is_some()
    }

    /// Make a pending write fail with [`Error::Interrupted`], keeping its
    /// data. Returns false if no write is pending.
    pub fn interrupt_write(&self) -> bool {
        self.baton
            .take_if(PipeData::Interrupt, |pending| matches!(pending, Ok(PipeData::Write(_))))
            .is_some()
    }

    /// Close cleanly: readers see end of stream, writers [`Error::Closed`].
    /// Returns false if already closed.
    pub fn close(&self) -> bool {
        self.baton.finish(PipeData::Read).is_ok()
    }

    /// Close with an error delivered to every pending and later operation.
    pub fn close_with(&self, error: Error) -> bool {
        self.baton.raise_finish(error).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.baton.is_finished()
    }
}

impl AsyncRead for PipeSocket {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        PipeSocket::read(self, buf)
    }
}

impl AsyncWrite for PipeSocket {
    fn write(&self, buf: &mut BytesMut) -> impl Future<Output = Result<()>> + Send {
        PipeSocket::write(self, buf)
    }
}

impl AsyncSocket for PipeSocket {
    async fn close(&self) -> Result<()> {
        PipeSocket::close(self);
        Ok(())
    }
}

/// One end of a duplex in-memory connection from [`pipe_socket_pair`].
#[derive(Debug, Clone)]
pub struct PairedPipeSocket {
    input: Arc<PipeSocket>,
    output: Arc<PipeSocket>,
}

impl PairedPipeSocket {
    /// Close both directions.
    pub fn close(&self) {
        self.input.close();
        self.output.close();
    }

    /// Close both directions with an error.
    pub fn close_with(&self, error: Error) {
        self.input.close_with(error.clone());
        self.output.close_with(error);
    }

    /// Interrupt a pending read on this end.
    pub fn interrupt_read(&self) -> bool {
        self.input.interrupt_read()
    }
}

impl AsyncRead for PairedPipeSocket {
    fn read(&self, buf: &mut BytesMut) -> impl Future<Output = Result<bool>> + Send {
        self.input.read(buf)
    }
}

impl AsyncWrite for PairedPipeSocket {
    fn write(&self, buf: &mut BytesMut) -> impl Future<Output = Result<()>> + Send {
        self.output.write(buf)
    }
}

impl AsyncSocket for PairedPipeSocket {
    async fn close(&self) -> Result<()> {
        PairedPipeSocket::close(self);
        Ok(())
    }
}

/// Two connected sockets: what one writes, the other reads.
pub fn pipe_socket_pair() -> (PairedPipeSocket, PairedPipeSocket) {
    let a_to_b = Arc::new(PipeSocket::new());
    let b_to_a = Arc::new(PipeSocket::new());
    (
        PairedPipeSocket {
            input: b_to_a.clone(),
            output: a_to_b.clone(),
        },
        PairedPipeSocket {
            input: a_to_b,
            output: b_to_a,
        },
    )
}
