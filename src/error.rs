use crate::envelope::MAX_DIMS;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while creating, attaching, or operating on a shared segment.
///
/// Attach failures are immediate; there is no retry. Transient emptiness of
/// the ring is *not* an error and is reported through `Option`/`bool` returns
/// on the segment API instead.
#[derive(Debug, Error)]
pub enum SegmentError {
  /// An OS call on the shared-memory object failed.
  #[error("segment {segment:?}: {op} failed: {source}")]
  Os {
    segment: String,
    op: &'static str,
    #[source]
    source: Errno,
  },

  /// The named region exists but was created with a different geometry.
  #[error(
    "segment {segment:?} layout mismatch: expected {expected_depth} slots x {expected_nbytes} B, \
     found {found_depth} slots x {found_nbytes} B"
  )]
  LayoutMismatch {
    segment: String,
    expected_depth: usize,
    expected_nbytes: usize,
    found_depth: usize,
    found_nbytes: usize,
  },

  /// The creating process did not finish initializing the region in time.
  #[error("segment {segment:?}: creator did not initialize the region within {timeout_ms} ms")]
  AttachTimeout { segment: String, timeout_ms: u64 },
}

/// Structural violations caught when constructing an [`crate::Envelope`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
  #[error("{nd} dimensions exceed the maximum of {MAX_DIMS}")]
  TooManyDims { nd: usize },

  #[error("dims rank {dims} does not match strides rank {strides}")]
  RankMismatch { dims: usize, strides: usize },

  #[error("element size must be non-zero")]
  ZeroElsize,

  #[error("payload of {actual} bytes does not match total_size * elsize = {expected}")]
  PayloadSizeMismatch { expected: usize, actual: usize },
}

/// Errors returned by [`crate::SendPort::send`].
#[derive(Debug, Error)]
pub enum SendError {
  /// The encoded envelope does not fit in one slot of this channel.
  #[error("envelope of {required} bytes exceeds the slot capacity of {capacity} bytes")]
  TooLarge { required: usize, capacity: usize },

  #[error(transparent)]
  Segment(#[from] SegmentError),
}

/// Error returned by [`crate::RecvPort::recv`] once the port has been joined
/// and its local queue drained.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
  #[error("receive port has been joined")]
  Stopped,
}

/// Errors returned by [`crate::RecvPort::start`].
#[derive(Debug, Error)]
pub enum StartError {
  /// The port already owns a poll worker; spawning twice is not supported.
  #[error("port already started")]
  AlreadyStarted,

  #[error("failed to spawn poll worker: {0}")]
  Spawn(#[from] std::io::Error),
}
