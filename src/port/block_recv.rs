use crate::envelope::Envelope;
use crate::error::SegmentError;
use crate::segment::Segment;

use std::sync::Arc;

/// Queue-less receive end for single-slot (depth 1) channels.
///
/// No worker thread: `recv` blocks the calling thread directly on the shared
/// segment and returns exactly once per corresponding send.
pub struct BlockRecvPort {
  name: String,
  segment: Arc<Segment>,
}

impl BlockRecvPort {
  /// Panics unless the segment has depth 1; deeper rings need the polling
  /// [`crate::RecvPort`].
  pub(crate) fn new(name: String, segment: Arc<Segment>) -> Self {
    assert_eq!(
      segment.depth(),
      1,
      "block recv port requires a single-slot segment"
    );
    Self { name, segment }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Blocks until a message is available, consumes it, and returns it.
  pub fn recv(&self) -> Result<Envelope, SegmentError> {
    self.segment.block_load(Envelope::read_from)
  }

  /// The currently buffered message, if any, without consuming it. May be
  /// called any number of times before the matching `recv`.
  pub fn peek(&self) -> Option<Envelope> {
    self.segment.read(Envelope::read_from)
  }

  /// Non-blocking presence check directly against the segment.
  pub fn probe(&self) -> bool {
    self.segment.try_probe()
  }
}
