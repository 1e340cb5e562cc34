//! Shared-memory message ports for multi-process runtimes.
//!
//! This crate moves discrete, variably-sized numeric-array messages between
//! two OS processes through a named POSIX shared-memory segment. A channel
//! binds exactly one sender to exactly one receiver. The sender writes
//! [`Envelope`]s (shape/stride metadata plus a contiguous payload) into the
//! fixed-slot [`Segment`] ring; the receive side either polls the ring from a
//! background worker into a bounded local queue ([`RecvPort`]) or blocks
//! directly on the ring ([`BlockRecvPort`], single-slot channels only).
//!
//! Backpressure is end to end: a full local queue stops the poller, the ring
//! fills, and the sender's `send` blocks. Nothing is dropped.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod port;
pub mod queue;
pub mod segment;

// Public re-exports for convenience
pub use channel::ShmemChannel;
pub use envelope::{DType, Envelope, MAX_DIMS};
pub use error::{EnvelopeError, RecvError, SegmentError, SendError, StartError};
pub use port::{BlockRecvPort, RecvPort, SendPort};
pub use queue::RecvQueue;
pub use segment::Segment;
