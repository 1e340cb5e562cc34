use shmem_port::{DType, Envelope};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(500);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(3);

static NAME_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Unique channel name per test run, so a crashed run's stale shm object
/// cannot collide with the next one.
pub fn unique_name(tag: &str) -> String {
  format!(
    "test_{tag}_{}_{}",
    std::process::id(),
    NAME_SEQ.fetch_add(1, Ordering::Relaxed)
  )
}

/// Spins until `pred` holds or `timeout` elapses; returns whether it held.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if pred() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  pred()
}

/// A 1-D u8 envelope filled with `tag` bytes.
pub fn tagged_envelope(tag: u8, len: usize) -> Envelope {
  Envelope::new(DType::U8, 1, vec![len as i64], vec![1], vec![tag; len]).unwrap()
}
