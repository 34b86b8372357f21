//! Lock-free availability bitmap.
//!
//! A set bit means "free". `reserve` clears the lowest set bit and returns its
//! index; `release` sets it again. Used for copy buffers (one word) and queue
//! pairs (four words).

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
pub struct AtomicBitmap<const WORDS: usize> {
    words: [AtomicU64; WORDS],
}

impl<const WORDS: usize> AtomicBitmap<WORDS> {
    pub const BITS: usize = WORDS * 64;

    /// Creates a bitmap with every index available.
    pub fn new() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicU64::new(u64::MAX)),
        }
    }

    /// Marks every index available again.
    pub fn fill(&self) {
        for word in &self.words {
            word.store(u64::MAX, Ordering::Release);
        }
    }

    /// Claims the lowest available index.
    pub fn reserve(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            while current != 0 {
                let bit = current.trailing_zeros();
                let next = current & !(1u64 << bit);
                match word.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(w * 64 + bit as usize),
                    Err(observed) => current = observed,
                }
            }
        }
        None
    }

    /// Returns `idx` to the available set.
    pub fn release(&self, idx: usize) {
        debug_assert!(idx < Self::BITS, "bitmap index {idx} out of range");
        let prev = self.words[idx / 64].fetch_or(1u64 << (idx % 64), Ordering::AcqRel);
        debug_assert_eq!(prev & (1u64 << (idx % 64)), 0, "double release of {idx}");
    }

    /// `true` when `idx` is currently available.
    pub fn is_available(&self, idx: usize) -> bool {
        self.words[idx / 64].load(Ordering::Acquire) & (1u64 << (idx % 64)) != 0
    }

    /// Number of available indices.
    pub fn available(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

impl<const WORDS: usize> Default for AtomicBitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    #[ignore]
    fn slow_loom_reserve_release_race() {
        loom::model(|| {
            let map = Arc::new(AtomicBitmap::<1>::new());
            let a = map.clone();
            let b = map.clone();
            let ta = thread::spawn(move || a.reserve());
            let tb = thread::spawn(move || b.reserve());
            let ia = ta.join().unwrap().unwrap();
            let ib = tb.join().unwrap().unwrap();
            assert_ne!(ia, ib);
            map.release(ia);
            map.release(ib);
            assert_eq!(map.available(), 64);
        });
    }
}
