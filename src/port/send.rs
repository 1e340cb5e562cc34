use crate::envelope::Envelope;
use crate::error::SendError;
use crate::segment::Segment;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The sending end of a channel.
///
/// Writes envelopes into the shared segment synchronously on the caller's
/// thread; `send` blocks while the ring is full, which is how backpressure
/// reaches the producer.
pub struct SendPort {
  name: String,
  segment: Arc<Segment>,
  done: AtomicBool,
}

impl SendPort {
  pub(crate) fn new(name: String, segment: Arc<Segment>) -> Self {
    Self {
      name,
      segment,
      done: AtomicBool::new(false),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Copies the envelope (header, then payload, contiguously) into the next
  /// empty slot, blocking until one is available.
  ///
  /// # Errors
  ///
  /// - [`SendError::TooLarge`] if the encoded envelope exceeds the slot
  ///   capacity of this channel.
  /// - [`SendError::Segment`] if the shared segment fails at the OS level.
  pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
    let required = envelope.wire_size();
    let capacity = self.segment.nbytes();
    if required > capacity {
      return Err(SendError::TooLarge { required, capacity });
    }
    self.segment.store(|slot| envelope.write_to(slot))?;
    Ok(())
  }

  /// True iff a `send` would currently not block, i.e. the ring has at least
  /// one empty slot.
  pub fn probe(&self) -> bool {
    self.segment.free_slots() > 0
  }

  /// Marks the port terminated. Idempotent; the send port owns no background
  /// thread, so there is nothing to wait for.
  pub fn join(&self) {
    self.done.store(true, Ordering::Release);
  }

  /// Whether [`Self::join`] has been called.
  pub fn is_joined(&self) -> bool {
    self.done.load(Ordering::Acquire)
  }
}
