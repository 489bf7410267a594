//! Reference-counted frame buffer pool
//!
//! A fixed arena of frame-sized cells shared between the event loop (the
//! sole producer) and the writer workers (fan-out consumers). A cell is
//! free iff its reference count is zero; `acquire` claims a free cell for
//! the caller with one count held, `retain` adds one count per fan-out
//! target, and every finished or failed send gives one count back.
//!
//! At any quiescent moment (no in-flight sends, empty queue, no cell held
//! by the event loop) every count in the pool is zero.

use crate::codec::frame::FRAME_CAPACITY;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

/// Number of cells; worker parallelism plus headroom.
pub const POOL_SIZE: usize = 24;

/// Failed-scan streak at which `acquire` starts napping between scans.
const SLEEP_ENTER_STREAK: u32 = 30;
/// Streak level at which the napping stops.
const SLEEP_EXIT_STREAK: u32 = 20;
/// Nap length inside the sleep state.
const SLEEP_NAP: Duration = Duration::from_millis(10);

struct Cell {
    refs: AtomicU16,
    /// Total frame length recorded by the producer for the workers.
    len: AtomicUsize,
    bytes: UnsafeCell<[u8; FRAME_CAPACITY]>,
}

pub struct BufferPool {
    cells: Box<[Cell]>,
}

// SAFETY: cell bytes are only written through `cell_mut` while the caller
// is the exclusive holder (refcount 1, before any retain), and only read
// through `cell` while a count is held; the refcount protocol serializes
// the two phases.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(size: usize) -> Arc<Self> {
        let cells = (0..size)
            .map(|_| Cell {
                refs: AtomicU16::new(0),
                len: AtomicUsize::new(0),
                bytes: UnsafeCell::new([0u8; FRAME_CAPACITY]),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self { cells })
    }

    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// One scan over the pool; claims and returns the first free cell.
    pub fn try_acquire(&self) -> Option<usize> {
        for (i, cell) in self.cells.iter().enumerate() {
            if cell
                .refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(i);
            }
        }
        None
    }

    /// Scans until a cell frees up, backing off through `backoff` when the
    /// pool is saturated. Exhaustion is never fatal.
    pub fn acquire(&self, backoff: &mut AcquireBackoff) -> usize {
        loop {
            if let Some(i) = self.try_acquire() {
                return i;
            }
            backoff.exhausted();
        }
    }

    /// Adds `n` counts for `n` outstanding fan-out sends.
    pub fn retain(&self, idx: usize, n: u16) {
        self.cells[idx].refs.fetch_add(n, Ordering::AcqRel);
    }

    /// Gives back one count.
    pub fn release(&self, idx: usize) {
        let prev = self.cells[idx].refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "buffer cell {idx} released below zero");
    }

    pub fn refs(&self, idx: usize) -> u16 {
        self.cells[idx].refs.load(Ordering::Acquire)
    }

    pub fn set_len(&self, idx: usize, len: usize) {
        self.cells[idx].len.store(len, Ordering::Release);
    }

    pub fn len(&self, idx: usize) -> usize {
        self.cells[idx].len.load(Ordering::Acquire)
    }

    /// Mutable view of a cell's bytes.
    ///
    /// # Safety
    /// The caller must be the exclusive holder: the cell was acquired by
    /// the caller and no retain has published it to workers yet.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn cell_mut(&self, idx: usize) -> &mut [u8] {
        unsafe { &mut *self.cells[idx].bytes.get() }
    }

    /// Shared view of a cell's bytes.
    ///
    /// # Safety
    /// The caller must hold a reference count on the cell, and the
    /// producer must have finished filling it before publishing.
    pub unsafe fn cell(&self, idx: usize) -> &[u8] {
        unsafe { &*self.cells[idx].bytes.get() }
    }
}

/// Scan backoff state for [`BufferPool::acquire`].
///
/// Mirrors the relay's saturation policy: stay hot through transient
/// bursts, then nap once the failing streak passes the enter threshold,
/// and wake back up when it drains below the exit threshold. The streak
/// persists across acquisitions.
pub struct AcquireBackoff {
    streak: u32,
    sleeping: bool,
}

impl AcquireBackoff {
    pub fn new() -> Self {
        Self {
            streak: 0,
            sleeping: false,
        }
    }

    fn exhausted(&mut self) {
        if self.sleeping {
            std::thread::sleep(SLEEP_NAP);
            self.streak = self.streak.saturating_sub(1);
            if self.streak <= SLEEP_EXIT_STREAK {
                self.sleeping = false;
            }
        } else {
            self.streak += 1;
            if self.streak > SLEEP_ENTER_STREAK {
                self.sleeping = true;
            }
        }
    }
}

impl Default for AcquireBackoff {
    fn default() -> Self {
        Self::new()
    }
}
