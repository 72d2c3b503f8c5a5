//! In-memory sockets built on [`Baton`](crate::sync::Baton) hand-offs.

mod interruptible;
mod pipe;
mod server;

pub use interruptible::InterruptibleRead;
pub use pipe::{PairedPipeSocket, PipeSocket, pipe_socket_pair};
pub use server::PipeServer;
