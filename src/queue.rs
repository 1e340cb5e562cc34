//! Bounded in-process FIFO of materialized envelopes.
//!
//! Sits between a [`crate::RecvPort`]'s poll worker and its consumer call
//! site. The worker only pushes after checking [`RecvQueue::available_count`],
//! so the push path is effectively non-blocking in normal operation; the
//! consumer blocks in [`RecvQueue::pop`] until an entry arrives or the queue
//! is stopped.

use crate::envelope::Envelope;

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct Inner {
  entries: VecDeque<Envelope>,
  stopped: bool,
}

/// Capacity-limited FIFO with backpressure reporting and a non-destructive
/// peek.
pub struct RecvQueue {
  capacity: usize,
  inner: Mutex<Inner>,
  not_empty: Condvar,
  not_full: Condvar,
}

impl RecvQueue {
  /// Panics if `capacity` is 0.
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "recv queue capacity must be greater than 0");
    Self {
      capacity,
      inner: Mutex::new(Inner {
        entries: VecDeque::with_capacity(capacity),
        stopped: false,
      }),
      not_empty: Condvar::new(),
      not_full: Condvar::new(),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Remaining free capacity; the poller checks this before draining the
  /// segment so it never overruns the queue.
  pub fn available_count(&self) -> usize {
    let inner = self.inner.lock();
    self.capacity - inner.entries.len()
  }

  /// Appends an entry, blocking while the queue is full. Returns the entry
  /// back if the queue was stopped before space became available.
  pub fn push(&self, entry: Envelope) -> Result<(), Envelope> {
    let mut inner = self.inner.lock();
    while inner.entries.len() == self.capacity && !inner.stopped {
      self.not_full.wait(&mut inner);
    }
    if inner.stopped {
      return Err(entry);
    }
    inner.entries.push_back(entry);
    self.not_empty.notify_one();
    Ok(())
  }

  /// Removes and returns the oldest entry, blocking until one exists.
  /// Returns `None` once the queue has been stopped and drained.
  pub fn pop(&self) -> Option<Envelope> {
    let mut inner = self.inner.lock();
    loop {
      if let Some(entry) = inner.entries.pop_front() {
        self.not_full.notify_one();
        return Some(entry);
      }
      if inner.stopped {
        return None;
      }
      self.not_empty.wait(&mut inner);
    }
  }

  /// Non-blocking removal of the oldest entry.
  pub fn try_pop(&self) -> Option<Envelope> {
    let mut inner = self.inner.lock();
    let entry = inner.entries.pop_front();
    if entry.is_some() {
      self.not_full.notify_one();
    }
    entry
  }

  /// True iff at least one entry is present; never blocks.
  pub fn probe(&self) -> bool {
    !self.inner.lock().entries.is_empty()
  }

  /// A copy of the oldest entry without removing it.
  pub fn front(&self) -> Option<Envelope> {
    self.inner.lock().entries.front().cloned()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().entries.is_empty()
  }

  /// Releases all waiting state: pending and future blocking `push`/`pop`
  /// calls unblock. Entries already queued remain poppable.
  pub fn stop(&self) {
    let mut inner = self.inner.lock();
    inner.stopped = true;
    self.not_empty.notify_all();
    self.not_full.notify_all();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::envelope::DType;
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  fn entry(tag: u8) -> Envelope {
    Envelope::new(DType::U8, 1, vec![1], vec![1], vec![tag]).unwrap()
  }

  #[test]
  #[should_panic]
  fn zero_capacity_panics() {
    let _ = RecvQueue::new(0);
  }

  #[test]
  fn fifo_order() {
    let queue = RecvQueue::new(4);
    for tag in 0..3 {
      queue.push(entry(tag)).unwrap();
    }
    for tag in 0..3 {
      assert_eq!(queue.pop().unwrap().payload(), &[tag]);
    }
  }

  #[test]
  fn available_count_tracks_len() {
    let queue = RecvQueue::new(2);
    assert_eq!(queue.available_count(), 2);
    queue.push(entry(0)).unwrap();
    assert_eq!(queue.available_count(), 1);
    queue.push(entry(1)).unwrap();
    assert_eq!(queue.available_count(), 0);
    queue.pop().unwrap();
    assert_eq!(queue.available_count(), 1);
  }

  #[test]
  fn front_is_non_destructive() {
    let queue = RecvQueue::new(2);
    queue.push(entry(9)).unwrap();
    assert_eq!(queue.front().unwrap().payload(), &[9]);
    assert_eq!(queue.front().unwrap().payload(), &[9]);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.pop().unwrap().payload(), &[9]);
    assert!(queue.front().is_none());
  }

  #[test]
  fn probe_and_try_pop() {
    let queue = RecvQueue::new(2);
    assert!(!queue.probe());
    assert!(queue.try_pop().is_none());
    queue.push(entry(1)).unwrap();
    assert!(queue.probe());
    assert_eq!(queue.try_pop().unwrap().payload(), &[1]);
    assert!(!queue.probe());
  }

  #[test]
  fn pop_blocks_until_push() {
    let queue = Arc::new(RecvQueue::new(1));
    let consumer = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || queue.pop().unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    queue.push(entry(3)).unwrap();
    assert_eq!(consumer.join().unwrap().payload(), &[3]);
  }

  #[test]
  fn push_blocks_until_pop() {
    let queue = Arc::new(RecvQueue::new(1));
    queue.push(entry(1)).unwrap();

    let producer = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || queue.push(entry(2)).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.len(), 1);

    assert_eq!(queue.pop().unwrap().payload(), &[1]);
    producer.join().unwrap();
    assert_eq!(queue.pop().unwrap().payload(), &[2]);
  }

  #[test]
  fn stop_unblocks_pending_pop() {
    let queue = Arc::new(RecvQueue::new(1));
    let consumer = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || queue.pop())
    };
    thread::sleep(Duration::from_millis(100));
    queue.stop();
    assert!(consumer.join().unwrap().is_none());
  }

  #[test]
  fn stop_leaves_queued_entries_poppable() {
    let queue = RecvQueue::new(2);
    queue.push(entry(5)).unwrap();
    queue.stop();
    assert_eq!(queue.pop().unwrap().payload(), &[5]);
    assert!(queue.pop().is_none());
    assert!(queue.push(entry(6)).is_err());
  }
}
