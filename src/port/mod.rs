//! Process-local port objects wrapping access to a shared [`crate::Segment`].
//!
//! One channel binds exactly one [`SendPort`] to exactly one receive port:
//! either the polling [`RecvPort`] (background worker + bounded local queue)
//! or the queue-less [`BlockRecvPort`] for single-slot channels.

mod block_recv;
mod recv;
mod send;

pub use block_recv::BlockRecvPort;
pub use recv::RecvPort;
pub use send::SendPort;
