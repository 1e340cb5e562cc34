use crate::envelope::Envelope;
use crate::error::{RecvError, StartError};
use crate::queue::RecvQueue;
use crate::segment::Segment;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

/// How long the poll worker sleeps when the ring was empty or the local
/// queue had no capacity. The done flag is observed at least once per
/// interval, so `join` terminates promptly.
const POLL_BACKOFF: Duration = Duration::from_micros(100);

/// The polling receive end of a channel.
///
/// Owns one background worker that drains the shared segment into a bounded
/// local queue whenever the queue has spare capacity; the public API reads
/// from that queue. Lifecycle: created, started (worker spawned), joined
/// (worker exited, queue stopped).
pub struct RecvPort {
  name: String,
  segment: Arc<Segment>,
  queue: Arc<RecvQueue>,
  done: Arc<AtomicBool>,
  worker: Option<JoinHandle<()>>,
}

impl RecvPort {
  pub(crate) fn new(name: String, segment: Arc<Segment>, queue_capacity: usize) -> Self {
    Self {
      name,
      segment,
      queue: Arc::new(RecvQueue::new(queue_capacity)),
      done: Arc::new(AtomicBool::new(false)),
      worker: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Spawns the poll worker. Must be called exactly once before `recv`
  /// returns anything.
  ///
  /// # Errors
  ///
  /// - [`StartError::AlreadyStarted`] on a second call.
  /// - [`StartError::Spawn`] if the OS refuses the thread.
  pub fn start(&mut self) -> Result<(), StartError> {
    if self.worker.is_some() {
      return Err(StartError::AlreadyStarted);
    }
    let segment = Arc::clone(&self.segment);
    let queue = Arc::clone(&self.queue);
    let done = Arc::clone(&self.done);
    let handle = thread::Builder::new()
      .name(format!("{}-poll", self.name))
      .spawn(move || poll_loop(&segment, &queue, &done))?;
    self.worker = Some(handle);
    debug!(port = %self.name, "recv port started");
    Ok(())
  }

  /// Removes and returns the oldest received envelope, blocking until one is
  /// available.
  ///
  /// # Errors
  ///
  /// - [`RecvError::Stopped`] once the port has been joined and the local
  ///   queue drained.
  pub fn recv(&self) -> Result<Envelope, RecvError> {
    self.queue.pop().ok_or(RecvError::Stopped)
  }

  /// True iff an envelope is ready in the local queue (not the segment).
  pub fn probe(&self) -> bool {
    self.queue.probe()
  }

  /// A copy of the oldest received envelope without removing it; the next
  /// `recv` returns exactly this message.
  pub fn peek(&self) -> Option<Envelope> {
    self.queue.front()
  }

  /// Stops the worker and the local queue: sets the done flag, waits for the
  /// worker thread to exit, then releases queue waiters. Second and later
  /// calls are no-ops.
  pub fn join(&mut self) {
    if self.done.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(handle) = self.worker.take() {
      let _ = handle.join();
    }
    self.queue.stop();
    debug!(port = %self.name, "recv port joined");
  }
}

impl Drop for RecvPort {
  fn drop(&mut self) {
    self.join();
  }
}

/// Worker loop: drain the segment into the queue while there is spare queue
/// capacity, sleeping one backoff interval whenever no progress was made.
fn poll_loop(segment: &Segment, queue: &RecvQueue, done: &AtomicBool) {
  while !done.load(Ordering::Acquire) {
    let mut progressed = false;
    if queue.available_count() > 0 {
      match segment.load(Envelope::read_from) {
        Ok(Some(envelope)) => {
          // Cannot block: this worker is the queue's only producer and it
          // just observed spare capacity. Err means the queue was stopped.
          if queue.push(envelope).is_err() {
            break;
          }
          progressed = true;
        }
        Ok(None) => {}
        Err(err) => {
          error!(segment = %segment.name(), %err, "poll worker stopping on segment error");
          break;
        }
      }
    }
    if !progressed {
      thread::sleep(POLL_BACKOFF);
    }
  }
}
