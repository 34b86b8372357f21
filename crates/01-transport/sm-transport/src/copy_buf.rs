//! Pool of page-sized staging buffers shared by every peer of a region.
//!
//! Ownership of a buffer is handed out through the availability bitmap. Each
//! buffer also has its own spinlock held around the raw copy, so a buffer that
//! was just released cannot be overwritten while its previous owner is still
//! copying out of it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bitmap::AtomicBitmap;
use crate::ring::CachePadded;

/// Number of copy buffers in a region.
pub const NUM_BUFS: usize = 64;
/// Size in bytes of one copy buffer.
pub const COPY_BUF_SIZE: usize = 4096;

#[repr(C)]
struct SpinLock(AtomicU32);

impl SpinLock {
    fn lock(&self) -> SpinGuard<'_> {
        while self
            .0
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.0.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
        SpinGuard(self)
    }
}

struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(0, Ordering::Release);
    }
}

#[repr(C)]
pub struct CopyBufPool {
    locks: [SpinLock; NUM_BUFS],
    bufs: [UnsafeCell<[u8; COPY_BUF_SIZE]>; NUM_BUFS],
    available: CachePadded<AtomicBitmap<1>>,
}

// SAFETY: every access to `bufs` happens under the matching spinlock.
unsafe impl Sync for CopyBufPool {}

impl CopyBufPool {
    /// Clears every buffer and lock and marks all buffers available.
    pub(crate) fn init(&self) {
        for (lock, buf) in self.locks.iter().zip(&self.bufs) {
            lock.0.store(0, Ordering::Relaxed);
            // SAFETY: called only while the region is being created.
            unsafe { (*buf.get()).fill(0) };
        }
        self.available.0.fill();
    }

    pub fn reserve(&self) -> Option<usize> {
        self.available.0.reserve()
    }

    pub fn release(&self, idx: usize) {
        self.available.0.release(idx);
    }

    pub fn available(&self) -> usize {
        self.available.0.available()
    }

    /// Copies `src` into buffer `idx`. `src` must fit in one buffer.
    pub fn copy_to(&self, idx: usize, src: &[u8]) {
        assert!(src.len() <= COPY_BUF_SIZE, "payload exceeds copy buffer");
        let _guard = self.locks[idx].lock();
        // SAFETY: the spinlock serializes access to this buffer.
        let buf = unsafe { &mut *self.bufs[idx].get() };
        buf[..src.len()].copy_from_slice(src);
    }

    /// Copies the first `dst.len()` bytes of buffer `idx` into `dst`.
    pub fn copy_from(&self, idx: usize, dst: &mut [u8]) {
        assert!(dst.len() <= COPY_BUF_SIZE, "read exceeds copy buffer");
        let _guard = self.locks[idx].lock();
        // SAFETY: the spinlock serializes access to this buffer.
        let buf = unsafe { &*self.bufs[idx].get() };
        dst.copy_from_slice(&buf[..dst.len()]);
    }
}
