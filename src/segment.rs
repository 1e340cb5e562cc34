//! Named POSIX shared-memory segment organized as a fixed-depth ring of
//! fixed-size slots.
//!
//! Both processes map the same region. The ring state (cursors, slot
//! accounting) lives inside the region itself, so each side observes the same
//! counters. Slot accounting uses a pair of process-shared counting
//! semaphores: `empty` counts free slots (initially the depth), `full` counts
//! occupied ones (initially zero). `store` waits on `empty` and posts `full`;
//! consuming loads do the reverse.
//!
//! Exactly one producer and one consumer may use a segment; concurrent
//! consumers on the same segment are undefined. Slot memory is only ever
//! handed to callers as a scoped byte slice for the duration of one
//! operation.

use crate::error::SegmentError;

use std::cell::UnsafeCell;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{self, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::debug;

/// Written last (release) by the creating process; attachers wait for it.
const READY_MAGIC: u32 = 0x5348_4d50; // "SHMP"

/// How long an attacher waits for the creator to finish initialization.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);
const ATTACH_POLL: Duration = Duration::from_millis(1);

/// Ring state at the start of the mapped region, shared by both processes.
///
/// The layout must be identical in every attaching process, hence `repr(C)`.
/// A fresh shm object is zero-filled, so every field except the semaphores is
/// valid before initialization; `ready` flips to `READY_MAGIC` only after the
/// creator has initialized the semaphores and recorded the geometry.
#[repr(C)]
struct SegmentHeader {
  ready: AtomicU32,
  depth: AtomicU32,
  attach_count: AtomicU32,
  write_cursor: AtomicU32,
  read_cursor: AtomicU32,
  _reserved: u32,
  nbytes: AtomicU64,
  empty: UnsafeCell<libc::sem_t>,
  full: UnsafeCell<libc::sem_t>,
}

/// Slot storage starts on a cache-line boundary past the header.
const fn slot_region_offset() -> usize {
  (std::mem::size_of::<SegmentHeader>() + 63) & !63
}

/// A named shared-memory ring of `depth` slots of `nbytes` bytes each.
///
/// Construction is create-or-attach: the first process creates and
/// initializes the region, later ones attach and validate its geometry. The
/// last handle to detach (on `Drop`) destroys the semaphores and unlinks the
/// OS object.
#[derive(Debug)]
pub struct Segment {
  name: String,
  shm_name: String,
  map: NonNull<libc::c_void>,
  map_len: usize,
  depth: usize,
  nbytes: usize,
  _fd: OwnedFd,
}

// SAFETY: all mutation of shared state goes through the process-shared
// semaphores and the header's atomics; slot memory is partitioned between
// the single producer and single consumer by the empty/full accounting.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
  /// Creates or attaches the named segment and maps it into this process.
  ///
  /// Both sides must pass the same `name`, `depth`, and `nbytes`. Panics if
  /// `depth` or `nbytes` is zero.
  ///
  /// # Errors
  ///
  /// - [`SegmentError::Os`] for any failing OS call; no retry is attempted.
  /// - [`SegmentError::LayoutMismatch`] if the region exists with a
  ///   different geometry.
  /// - [`SegmentError::AttachTimeout`] if the creating process never
  ///   finishes initialization.
  pub fn open(name: &str, depth: usize, nbytes: usize) -> Result<Self, SegmentError> {
    assert!(depth > 0, "segment depth must be greater than 0");
    assert!(nbytes > 0, "segment slot size must be greater than 0");

    let shm_name = format!("/shp_{name}");
    let map_len = slot_region_offset() + depth * nbytes;

    match mman::shm_open(
      shm_name.as_str(),
      OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
      Mode::S_IRUSR | Mode::S_IWUSR,
    ) {
      Ok(fd) => Self::create(name, shm_name, fd, depth, nbytes, map_len),
      Err(Errno::EEXIST) => {
        let fd = mman::shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::empty())
          .map_err(|e| os_err(name, "shm_open", e))?;
        Self::attach(name, shm_name, fd, depth, nbytes, map_len)
      }
      Err(e) => Err(os_err(name, "shm_open", e)),
    }
  }

  fn create(
    name: &str,
    shm_name: String,
    fd: OwnedFd,
    depth: usize,
    nbytes: usize,
    map_len: usize,
  ) -> Result<Self, SegmentError> {
    if let Err(e) = unistd::ftruncate(&fd, map_len as libc::off_t) {
      let _ = mman::shm_unlink(shm_name.as_str());
      return Err(os_err(name, "ftruncate", e));
    }
    let map = match Self::map(name, &fd, map_len) {
      Ok(map) => map,
      Err(err) => {
        let _ = mman::shm_unlink(shm_name.as_str());
        return Err(err);
      }
    };

    // SAFETY: the mapping covers the header and outlives this scope.
    let hdr = unsafe { &*(map.as_ptr() as *const SegmentHeader) };
    // The region is zero-filled; only the semaphores need real construction.
    if unsafe { libc::sem_init(hdr.empty.get(), 1, depth as libc::c_uint) } != 0 {
      return Self::fail_create(map, map_len, &shm_name, os_err(name, "sem_init(empty)", Errno::last()));
    }
    if unsafe { libc::sem_init(hdr.full.get(), 1, 0) } != 0 {
      return Self::fail_create(map, map_len, &shm_name, os_err(name, "sem_init(full)", Errno::last()));
    }
    hdr.depth.store(depth as u32, Ordering::Relaxed);
    hdr.nbytes.store(nbytes as u64, Ordering::Relaxed);
    hdr.attach_count.store(1, Ordering::Relaxed);
    hdr.ready.store(READY_MAGIC, Ordering::Release);

    debug!(segment = name, depth, nbytes, "created shared segment");
    Ok(Self {
      name: name.to_string(),
      shm_name,
      map,
      map_len,
      depth,
      nbytes,
      _fd: fd,
    })
  }

  /// Failed mid-creation: nothing else can be attached yet, so tear the
  /// object down rather than leaving a half-initialized region behind.
  fn fail_create(
    map: NonNull<libc::c_void>,
    map_len: usize,
    shm_name: &str,
    err: SegmentError,
  ) -> Result<Self, SegmentError> {
    unsafe {
      let _ = mman::munmap(map, map_len);
    }
    let _ = mman::shm_unlink(shm_name);
    Err(err)
  }

  fn attach(
    name: &str,
    shm_name: String,
    fd: OwnedFd,
    depth: usize,
    nbytes: usize,
    map_len: usize,
  ) -> Result<Self, SegmentError> {
    // The creator may still be between shm_open and ftruncate; touching a
    // zero-length mapping would fault, so wait until at least the header
    // region exists. Waiting for the full expected size instead would turn a
    // geometry mismatch (smaller object) into a timeout.
    let deadline = Instant::now() + ATTACH_TIMEOUT;
    loop {
      let mut stat: libc::stat = unsafe { std::mem::zeroed() };
      if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(os_err(name, "fstat", Errno::last()));
      }
      if stat.st_size as usize >= slot_region_offset() {
        break;
      }
      if Instant::now() >= deadline {
        return Err(SegmentError::AttachTimeout {
          segment: name.to_string(),
          timeout_ms: ATTACH_TIMEOUT.as_millis() as u64,
        });
      }
      thread::sleep(ATTACH_POLL);
    }

    let map = Self::map(name, &fd, map_len)?;
    // SAFETY: the mapping covers the header and outlives this scope. Self is
    // only constructed after the refcount bump below, so error paths here
    // must not run Drop (which would decrement a count we never incremented).
    let hdr = unsafe { &*(map.as_ptr() as *const SegmentHeader) };

    while hdr.ready.load(Ordering::Acquire) != READY_MAGIC {
      if Instant::now() >= deadline {
        return Self::fail_attach(
          map,
          map_len,
          SegmentError::AttachTimeout {
            segment: name.to_string(),
            timeout_ms: ATTACH_TIMEOUT.as_millis() as u64,
          },
        );
      }
      thread::sleep(ATTACH_POLL);
    }

    let found_depth = hdr.depth.load(Ordering::Relaxed) as usize;
    let found_nbytes = hdr.nbytes.load(Ordering::Relaxed) as usize;
    if found_depth != depth || found_nbytes != nbytes {
      return Self::fail_attach(
        map,
        map_len,
        SegmentError::LayoutMismatch {
          segment: name.to_string(),
          expected_depth: depth,
          expected_nbytes: nbytes,
          found_depth,
          found_nbytes,
        },
      );
    }
    hdr.attach_count.fetch_add(1, Ordering::AcqRel);

    debug!(segment = name, depth, nbytes, "attached shared segment");
    Ok(Self {
      name: name.to_string(),
      shm_name,
      map,
      map_len,
      depth,
      nbytes,
      _fd: fd,
    })
  }

  /// Failed before registering in the attach count: just unmap, the live
  /// region belongs to the other side.
  fn fail_attach(
    map: NonNull<libc::c_void>,
    map_len: usize,
    err: SegmentError,
  ) -> Result<Self, SegmentError> {
    unsafe {
      let _ = mman::munmap(map, map_len);
    }
    Err(err)
  }

  fn map(
    name: &str,
    fd: &OwnedFd,
    map_len: usize,
  ) -> Result<NonNull<libc::c_void>, SegmentError> {
    let len = NonZeroUsize::new(map_len).ok_or_else(|| os_err(name, "mmap", Errno::EINVAL))?;
    unsafe {
      mman::mmap(
        None,
        len,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED,
        fd,
        0,
      )
    }
    .map_err(|e| os_err(name, "mmap", e))
  }

  /// Slot capacity in bytes.
  pub fn nbytes(&self) -> usize {
    self.nbytes
  }

  /// Slot count.
  pub fn depth(&self) -> usize {
    self.depth
  }

  /// The channel name this segment was opened under.
  pub fn name(&self) -> &str {
    &self.name
  }

  fn header(&self) -> &SegmentHeader {
    // SAFETY: the mapping is at least slot_region_offset() bytes and lives
    // as long as self; the header type is repr(C) and valid for the
    // zero-filled or initialized region.
    unsafe { &*(self.map.as_ptr() as *const SegmentHeader) }
  }

  fn slot_ptr(&self, idx: u32) -> *mut u8 {
    debug_assert!((idx as usize) < self.depth);
    // SAFETY: idx < depth, so the slot lies inside the mapping.
    unsafe {
      (self.map.as_ptr() as *mut u8).add(slot_region_offset() + idx as usize * self.nbytes)
    }
  }

  /// Blocks until an empty slot is available, hands its memory to `writer`
  /// (a zeroed-or-stale `nbytes`-byte slice to fill with one envelope), then
  /// marks the slot full and wakes one waiting reader.
  pub fn store<F: FnOnce(&mut [u8])>(&self, writer: F) -> Result<(), SegmentError> {
    let hdr = self.header();
    self.sem_wait(hdr.empty.get(), "sem_wait(empty)")?;

    let idx = hdr.write_cursor.load(Ordering::Relaxed);
    // SAFETY: the empty-semaphore acquisition gives the producer exclusive
    // use of this slot until it is posted full.
    let slot = unsafe { slice::from_raw_parts_mut(self.slot_ptr(idx), self.nbytes) };
    writer(slot);
    hdr
      .write_cursor
      .store((idx + 1) % self.depth as u32, Ordering::Release);

    atomic::fence(Ordering::Release);
    self.sem_post(hdr.full.get(), "sem_post(full)")
  }

  /// Non-blocking consume: if a full slot exists, runs `reader` on it, marks
  /// it empty, wakes one waiting writer, and returns the reader's result.
  /// Returns `Ok(None)` immediately when the ring is empty.
  pub fn load<R, F: FnOnce(&[u8]) -> R>(&self, reader: F) -> Result<Option<R>, SegmentError> {
    let hdr = self.header();
    if !self.sem_trywait(hdr.full.get(), "sem_trywait(full)")? {
      return Ok(None);
    }
    self.consume_slot(reader).map(Some)
  }

  /// Blocking consume: waits until a full slot exists, then behaves like the
  /// success path of [`Self::load`].
  pub fn block_load<R, F: FnOnce(&[u8]) -> R>(&self, reader: F) -> Result<R, SegmentError> {
    let hdr = self.header();
    self.sem_wait(hdr.full.get(), "sem_wait(full)")?;
    self.consume_slot(reader)
  }

  fn consume_slot<R, F: FnOnce(&[u8]) -> R>(&self, reader: F) -> Result<R, SegmentError> {
    let hdr = self.header();
    atomic::fence(Ordering::Acquire);

    let idx = hdr.read_cursor.load(Ordering::Relaxed);
    // SAFETY: the full-semaphore acquisition gives the consumer exclusive
    // use of this slot until it is posted empty.
    let slot = unsafe { slice::from_raw_parts(self.slot_ptr(idx), self.nbytes) };
    let result = reader(slot);
    hdr
      .read_cursor
      .store((idx + 1) % self.depth as u32, Ordering::Release);

    self.sem_post(hdr.empty.get(), "sem_post(empty)")?;
    Ok(result)
  }

  /// Non-destructive peek: runs `reader` on the oldest full slot without
  /// consuming it, so the same slot remains available to a subsequent
  /// [`Self::load`]/[`Self::block_load`]. Returns `None` when the ring is
  /// empty.
  ///
  /// Meaningful only on single-slot (depth 1) segments, where the producer
  /// cannot overwrite the peeked slot concurrently.
  pub fn read<R, F: FnOnce(&[u8]) -> R>(&self, reader: F) -> Option<R> {
    let hdr = self.header();
    if self.sem_value(hdr.full.get()) == 0 {
      return None;
    }
    atomic::fence(Ordering::Acquire);

    let idx = hdr.read_cursor.load(Ordering::Relaxed);
    // SAFETY: the slot is full, so the producer cannot touch it until a
    // consuming load posts it empty; we are the only consumer.
    let slot = unsafe { slice::from_raw_parts(self.slot_ptr(idx), self.nbytes) };
    Some(reader(slot))
  }

  /// Non-blocking check for a full slot; consumes nothing and invokes no
  /// callback.
  pub fn try_probe(&self) -> bool {
    self.sem_value(self.header().full.get()) > 0
  }

  /// Current number of empty slots (a `store` would not block iff > 0).
  pub fn free_slots(&self) -> usize {
    self.sem_value(self.header().empty.get()) as usize
  }

  fn sem_wait(&self, sem: *mut libc::sem_t, op: &'static str) -> Result<(), SegmentError> {
    loop {
      if unsafe { libc::sem_wait(sem) } == 0 {
        return Ok(());
      }
      let errno = Errno::last();
      if errno != Errno::EINTR {
        return Err(os_err(&self.name, op, errno));
      }
    }
  }

  /// Returns whether the semaphore was decremented; `false` means it was at
  /// zero (the expected "nothing to read yet" signal, not an error).
  fn sem_trywait(&self, sem: *mut libc::sem_t, op: &'static str) -> Result<bool, SegmentError> {
    loop {
      if unsafe { libc::sem_trywait(sem) } == 0 {
        return Ok(true);
      }
      match Errno::last() {
        Errno::EAGAIN => return Ok(false),
        Errno::EINTR => continue,
        errno => return Err(os_err(&self.name, op, errno)),
      }
    }
  }

  fn sem_post(&self, sem: *mut libc::sem_t, op: &'static str) -> Result<(), SegmentError> {
    if unsafe { libc::sem_post(sem) } == 0 {
      Ok(())
    } else {
      Err(os_err(&self.name, op, Errno::last()))
    }
  }

  fn sem_value(&self, sem: *mut libc::sem_t) -> u32 {
    let mut value: libc::c_int = 0;
    if unsafe { libc::sem_getvalue(sem, &mut value) } == 0 && value > 0 {
      value as u32
    } else {
      0
    }
  }
}

impl Drop for Segment {
  fn drop(&mut self) {
    let remaining = self.header().attach_count.fetch_sub(1, Ordering::AcqRel);
    let last = remaining == 1;
    if last {
      let hdr = self.header();
      unsafe {
        libc::sem_destroy(hdr.empty.get());
        libc::sem_destroy(hdr.full.get());
      }
    }
    unsafe {
      let _ = mman::munmap(self.map, self.map_len);
    }
    if last {
      let _ = mman::shm_unlink(self.shm_name.as_str());
      debug!(segment = %self.name, "unlinked shared segment");
    }
  }
}

fn os_err(name: &str, op: &'static str, source: Errno) -> SegmentError {
  SegmentError::Os {
    segment: name.to_string(),
    op,
    source,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;

  static NAME_SEQ: AtomicUsize = AtomicUsize::new(0);

  fn unique_name(tag: &str) -> String {
    format!(
      "seg_{tag}_{}_{}",
      std::process::id(),
      NAME_SEQ.fetch_add(1, Ordering::Relaxed)
    )
  }

  fn fill(slot: &mut [u8], byte: u8) {
    for b in slot.iter_mut() {
      *b = byte;
    }
  }

  #[test]
  #[serial]
  fn store_then_load_round_trips() {
    let seg = Segment::open(&unique_name("rt"), 2, 16).unwrap();
    seg.store(|slot| fill(slot, 7)).unwrap();

    let bytes = seg.load(|slot| slot.to_vec()).unwrap().unwrap();
    assert_eq!(bytes, vec![7u8; 16]);
  }

  #[test]
  #[serial]
  fn load_on_empty_returns_none() {
    let seg = Segment::open(&unique_name("empty"), 2, 16).unwrap();
    assert!(seg.load(|_| ()).unwrap().is_none());
    assert!(!seg.try_probe());
    assert_eq!(seg.free_slots(), 2);
  }

  #[test]
  #[serial]
  fn fifo_order_across_wraparound() {
    let seg = Segment::open(&unique_name("fifo"), 2, 8).unwrap();
    for round in 0u8..5 {
      seg.store(|slot| fill(slot, round)).unwrap();
      let byte = seg.load(|slot| slot[0]).unwrap().unwrap();
      assert_eq!(byte, round);
    }
  }

  #[test]
  #[serial]
  fn read_is_non_destructive() {
    let seg = Segment::open(&unique_name("peek"), 1, 8).unwrap();
    seg.store(|slot| fill(slot, 42)).unwrap();

    assert_eq!(seg.read(|slot| slot[0]), Some(42));
    assert_eq!(seg.read(|slot| slot[0]), Some(42));
    assert!(seg.try_probe());

    // The peeked slot is still consumable.
    assert_eq!(seg.load(|slot| slot[0]).unwrap(), Some(42));
    assert_eq!(seg.read(|slot| slot[0]), None);
  }

  #[test]
  #[serial]
  fn store_blocks_when_full() {
    let seg = Arc::new(Segment::open(&unique_name("full"), 1, 8).unwrap());
    seg.store(|slot| fill(slot, 1)).unwrap();
    assert_eq!(seg.free_slots(), 0);

    let stored = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let producer = {
      let seg = Arc::clone(&seg);
      let stored = Arc::clone(&stored);
      thread::spawn(move || {
        seg.store(|slot| fill(slot, 2)).unwrap();
        stored.store(true, Ordering::SeqCst);
      })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!stored.load(Ordering::SeqCst));

    assert_eq!(seg.load(|slot| slot[0]).unwrap(), Some(1));
    producer.join().unwrap();
    assert!(stored.load(Ordering::SeqCst));
    assert_eq!(seg.load(|slot| slot[0]).unwrap(), Some(2));
  }

  #[test]
  #[serial]
  fn block_load_waits_for_store() {
    let seg = Arc::new(Segment::open(&unique_name("block"), 1, 8).unwrap());

    let consumer = {
      let seg = Arc::clone(&seg);
      thread::spawn(move || seg.block_load(|slot| slot[0]).unwrap())
    };

    thread::sleep(Duration::from_millis(100));
    seg.store(|slot| fill(slot, 9)).unwrap();
    assert_eq!(consumer.join().unwrap(), 9);
  }

  #[test]
  #[serial]
  fn attach_sees_creator_data() {
    let name = unique_name("attach");
    let creator = Segment::open(&name, 2, 16).unwrap();
    let attacher = Segment::open(&name, 2, 16).unwrap();

    creator.store(|slot| fill(slot, 5)).unwrap();
    assert_eq!(attacher.load(|slot| slot[0]).unwrap(), Some(5));
  }

  #[test]
  #[serial]
  fn attach_rejects_geometry_mismatch() {
    let name = unique_name("geom");
    let _creator = Segment::open(&name, 2, 16).unwrap();
    match Segment::open(&name, 4, 16) {
      Err(SegmentError::LayoutMismatch {
        expected_depth: 4,
        found_depth: 2,
        ..
      }) => {}
      other => panic!("expected LayoutMismatch, got {other:?}"),
    }
  }
}
