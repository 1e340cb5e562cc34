//! Channel construction: opens the shared segment by name and hands out the
//! process-local ports.
//!
//! Both processes construct the channel with identical parameters; the first
//! one creates the OS object, the second attaches to it. Each side then takes
//! the port for its role. The segment is detached (and unlinked by the last
//! process) when every port and the channel handle have been dropped.

use crate::envelope;
use crate::error::SegmentError;
use crate::port::{BlockRecvPort, RecvPort, SendPort};
use crate::segment::Segment;

use std::sync::Arc;

/// A named shared-memory channel between one sender and one receiver.
pub struct ShmemChannel {
  name: String,
  depth: usize,
  segment: Arc<Segment>,
}

impl ShmemChannel {
  /// Creates or attaches the channel `name` with `depth` slots, each able to
  /// carry an envelope with up to `max_payload` payload bytes.
  ///
  /// The slot size is `max_payload` plus the worst-case envelope header, so
  /// any message whose payload fits the budget fits a slot regardless of its
  /// rank.
  pub fn open(name: &str, depth: usize, max_payload: usize) -> Result<Self, SegmentError> {
    let nbytes = envelope::header_bound() + max_payload;
    let segment = Segment::open(name, depth, nbytes)?;
    Ok(Self {
      name: name.to_string(),
      depth,
      segment: Arc::new(segment),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Slot count of the underlying ring.
  pub fn depth(&self) -> usize {
    self.depth
  }

  /// Capacity of one slot in bytes (header bound + payload budget).
  pub fn slot_size(&self) -> usize {
    self.segment.nbytes()
  }

  /// The sending end. Call in the producer process.
  pub fn send_port(&self) -> SendPort {
    SendPort::new(format!("{}:send", self.name), Arc::clone(&self.segment))
  }

  /// The polling receive end; its local queue holds up to `depth` envelopes.
  /// Call [`RecvPort::start`] before receiving.
  pub fn recv_port(&self) -> RecvPort {
    RecvPort::new(
      format!("{}:recv", self.name),
      Arc::clone(&self.segment),
      self.depth,
    )
  }

  /// The blocking, queue-less receive end. Panics unless the channel was
  /// opened with depth 1.
  pub fn block_recv_port(&self) -> BlockRecvPort {
    BlockRecvPort::new(format!("{}:recv", self.name), Arc::clone(&self.segment))
  }
}
