use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::{Poll, Waker};

use parking_lot::Mutex;
use tracing::debug;

use super::{PairedPipeSocket, pipe_socket_pair};
use crate::error::{Error, Result};

struct State {
    backlog: VecDeque<PairedPipeSocket>,
    acceptors: Vec<Waker>,
    closed: bool,
}

/// In-memory listener: [`connect`](Self::connect) creates a socket pair,
/// queues one end for [`accept`](Self::accept) and returns the other.
pub struct PipeServer {
    state: Mutex<State>,
}

impl Default for PipeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeServer {
    pub fn new() -> Self {
        PipeServer {
            state: Mutex::new(State {
                backlog: VecDeque::new(),
                acceptors: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn connect(&self) -> Result<PairedPipeSocket> {
        let (server_end, client_end) = pipe_socket_pair();
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.backlog.push_back(server_end);
        let acceptors = std::mem::take(&mut state.acceptors);
        drop(state);
        for waker in acceptors {
            waker.wake();
        }
        Ok(client_end)
    }

    /// The next connected socket, or `None` once the server is closed and
    /// the backlog is drained.
    pub async fn accept(&self) -> Option<PairedPipeSocket> {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(socket) = state.backlog.pop_front() {
                return Poll::Ready(Some(socket));
            }
            if state.closed {
                return Poll::Ready(None);
            }
            if !state.acceptors.iter().any(|w| w.will_wake(cx.waker())) {
                state.acceptors.push(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }

    /// Stop accepting new connections. Already queued sockets can still be
    /// accepted.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let acceptors = std::mem::take(&mut state.acceptors);
        let backlog = state.backlog.len();
        drop(state);
        debug!(backlog, "pipe server closed");
        for waker in acceptors {
            waker.wake();
        }
    }
}
