//! Lock-free multi-producer/multi-consumer ring of 64-bit words.
//!
//! The ring lives inside the shared region, so it is `repr(C)` and holds
//! nothing but atomics. Cursors are free-running `u32` values masked on
//! access; each sits on its own cache line:
//!
//! ```text
//! +-----------+-----------+-----------+-----------+----------------+
//! | prod_head | prod_tail | cons_head | cons_tail | slots[N] (u64) |
//! +-----------+-----------+-----------+-----------+----------------+
//! ```
//!
//! Producers claim a slot by advancing `prod_head`, store the word, then wait
//! for earlier producers before publishing through `prod_tail`. Consumers do
//! the same on `cons_head`/`cons_tail` and clear the slot they read. Zero is
//! reserved for "empty"; every stored word is non-zero.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Capacity of each per-peer message ring.
pub const MSG_RING_CAPACITY: usize = 64;
/// Capacity of the shared command ring (twice the peer count).
pub const CMD_RING_CAPACITY: usize = 512;

/// Ring carrying packed message headers.
pub type MsgRing = AtomicRing<MSG_RING_CAPACITY>;
/// Ring carrying packed command headers.
pub type CmdRing = AtomicRing<CMD_RING_CAPACITY>;

/// Pads `T` to a full cache line.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct CachePadded<T>(pub(crate) T);

/// Fixed-capacity MPMC queue of non-zero `u64` values.
#[repr(C)]
pub struct AtomicRing<const N: usize> {
    prod_head: CachePadded<AtomicU32>,
    prod_tail: CachePadded<AtomicU32>,
    cons_head: CachePadded<AtomicU32>,
    cons_tail: CachePadded<AtomicU32>,
    slots: [AtomicU64; N],
}

impl<const N: usize> AtomicRing<N> {
    const MASK: u32 = {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        assert!(N <= 1 << 16, "ring capacity must fit the cursor space");
        (N - 1) as u32
    };

    /// Allocates an empty ring on the heap.
    pub fn new() -> Box<Self> {
        Box::new(Self {
            prod_head: CachePadded(AtomicU32::new(0)),
            prod_tail: CachePadded(AtomicU32::new(0)),
            cons_head: CachePadded(AtomicU32::new(0)),
            cons_tail: CachePadded(AtomicU32::new(0)),
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    /// Number of slots.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Rewinds every cursor and clears every slot.
    ///
    /// Only valid while no other party can touch the ring, i.e. when the
    /// owning region is being created.
    pub fn reset(&self) {
        self.prod_head.0.store(0, Ordering::Relaxed);
        self.prod_tail.0.store(0, Ordering::Relaxed);
        self.cons_head.0.store(0, Ordering::Relaxed);
        self.cons_tail.0.store(0, Ordering::Relaxed);
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Enqueues `value`; returns `false` without blocking when the ring is full.
    pub fn push(&self, value: u64) -> bool {
        debug_assert_ne!(value, 0, "zero is reserved for empty slots");
        let mut head = self.prod_head.0.load(Ordering::Acquire);
        loop {
            let tail = self.cons_tail.0.load(Ordering::Acquire);
            let used = head.wrapping_sub(tail);
            if used == N as u32 {
                return false;
            }
            if used > N as u32 {
                // `head` went stale while consumers moved on.
                head = self.prod_head.0.load(Ordering::Acquire);
                continue;
            }
            match self.prod_head.0.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.slots[(head & Self::MASK) as usize].store(value, Ordering::Relaxed);

        // Publish in claim order.
        while self.prod_tail.0.load(Ordering::Acquire) != head {
            spin();
        }
        self.prod_tail.0.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Dequeues the oldest value, or `None` when the ring is empty.
    pub fn pop(&self) -> Option<u64> {
        let mut head = self.cons_head.0.load(Ordering::Acquire);
        loop {
            let tail = self.prod_tail.0.load(Ordering::Acquire);
            let available = tail.wrapping_sub(head);
            if available == 0 {
                return None;
            }
            if available > N as u32 {
                head = self.cons_head.0.load(Ordering::Acquire);
                continue;
            }
            match self.cons_head.0.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let value = self.slots[(head & Self::MASK) as usize].swap(0, Ordering::Acquire);
        debug_assert_ne!(value, 0, "published slot was empty");

        while self.cons_tail.0.load(Ordering::Acquire) != head {
            spin();
        }
        self.cons_tail.0.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Returns `true` when no published value is waiting.
    pub fn is_empty(&self) -> bool {
        let head = self.cons_head.0.load(Ordering::Acquire);
        let tail = self.prod_tail.0.load(Ordering::Acquire);
        head == tail
    }

    /// Number of published values not yet claimed by a consumer.
    pub fn len(&self) -> usize {
        let head = self.cons_head.0.load(Ordering::Acquire);
        let tail = self.prod_tail.0.load(Ordering::Acquire);
        (tail.wrapping_sub(head) as usize).min(N)
    }
}

#[inline]
fn spin() {
    #[cfg(feature = "loom")]
    loom::thread::yield_now();
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    #[ignore]
    fn slow_loom_two_producers_one_consumer() {
        loom::model(|| {
            let ring: Arc<AtomicRing<2>> = Arc::new(*AtomicRing::<2>::new());
            let a = ring.clone();
            let b = ring.clone();

            let pa = thread::spawn(move || a.push(1));
            let pb = thread::spawn(move || b.push(2));

            let mut seen = Vec::new();
            while seen.len() < 2 {
                match ring.pop() {
                    Some(value) => seen.push(value),
                    None => thread::yield_now(),
                }
            }
            assert!(pa.join().unwrap());
            assert!(pb.join().unwrap());
            seen.sort_unstable();
            assert_eq!(seen, vec![1, 2]);
            assert!(ring.is_empty());
        });
    }

    #[test]
    #[ignore]
    fn slow_loom_full_ring_rejects_then_recovers() {
        loom::model(|| {
            let ring: Arc<AtomicRing<2>> = Arc::new(*AtomicRing::<2>::new());
            assert!(ring.push(1));
            assert!(ring.push(2));
            let producer = ring.clone();
            let consumer = ring.clone();

            let p = thread::spawn(move || {
                while !producer.push(3) {
                    thread::yield_now();
                }
            });
            let c = thread::spawn(move || {
                let mut out = Vec::new();
                while out.len() < 3 {
                    match consumer.pop() {
                        Some(v) => out.push(v),
                        None => thread::yield_now(),
                    }
                }
                out
            });

            p.join().unwrap();
            let out = c.join().unwrap();
            assert_eq!(out, vec![1, 2, 3], "single consumer sees FIFO order");
        });
    }
}
