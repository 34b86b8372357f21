//! Fixed `repr(C)` layout of one shared region.
//!
//! ```text
//! +-------------------+------------------------------+-----------+-----------------+
//! | copy buffer pool  | queue pairs [MAX_PEERS]      | cmd ring  | pair bitmap     |
//! | locks|bufs|bitmap | (tx ring, rx ring), 4K-aligned|           | 4 x u64         |
//! +-------------------+------------------------------+-----------+-----------------+
//! ```
//!
//! Every process mapping the region must agree on this layout, so the struct
//! holds only atomics and raw bytes.

use crate::bitmap::AtomicBitmap;
use crate::copy_buf::CopyBufPool;
use crate::ring::{CachePadded, CmdRing, MsgRing};

/// Number of queue pairs (remote peer slots) per region.
pub const MAX_PEERS: usize = 256;

/// One bidirectional channel between the region owner and a peer.
///
/// `tx` carries traffic from the peer that reserved the pair towards the
/// region owner, `rx` the reverse.
#[repr(C, align(4096))]
pub struct QueuePair {
    pub tx: MsgRing,
    pub rx: MsgRing,
}

#[repr(C)]
pub struct RegionLayout {
    pub copy_bufs: CopyBufPool,
    pub queue_pairs: [QueuePair; MAX_PEERS],
    pub cmd_queue: CmdRing,
    available_pairs: CachePadded<AtomicBitmap<{ MAX_PEERS / 64 }>>,
}

impl RegionLayout {
    /// Total mapped size of a region.
    pub const SIZE: usize = std::mem::size_of::<RegionLayout>();

    /// Puts a freshly created region into its initial state.
    pub(crate) fn init(&self) {
        self.copy_bufs.init();
        for pair in &self.queue_pairs {
            pair.tx.reset();
            pair.rx.reset();
        }
        self.cmd_queue.reset();
        self.available_pairs.0.fill();
    }

    /// Claims a free queue pair index.
    pub fn reserve_pair(&self) -> Option<u8> {
        self.available_pairs.0.reserve().map(|idx| idx as u8)
    }

    pub fn release_pair(&self, idx: u8) {
        self.available_pairs.0.release(usize::from(idx));
    }

    pub fn pair(&self, idx: u8) -> &QueuePair {
        &self.queue_pairs[usize::from(idx)]
    }

    pub fn available_pairs(&self) -> usize {
        self.available_pairs.0.available()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::SharedRegion;

    #[test]
    fn queue_pairs_are_page_aligned() {
        assert_eq!(std::mem::align_of::<QueuePair>(), 4096);
        let region = SharedRegion::anonymous().expect("map region");
        for pair in &region.layout().queue_pairs {
            assert_eq!(pair as *const QueuePair as usize % 4096, 0);
        }
    }

    #[test]
    fn pairs_reserve_until_exhausted() {
        let region = SharedRegion::anonymous().expect("map region");
        let layout = region.layout();
        for expected in 0..MAX_PEERS {
            assert_eq!(layout.reserve_pair(), Some(expected as u8));
        }
        assert_eq!(layout.reserve_pair(), None, "all peer slots are taken");
        layout.release_pair(200);
        assert_eq!(layout.reserve_pair(), Some(200));
    }

    #[test]
    fn init_leaves_rings_empty() {
        let region = SharedRegion::anonymous().expect("map region");
        let layout = region.layout();
        assert!(layout.cmd_queue.is_empty());
        assert!(layout.queue_pairs.iter().all(|p| p.tx.is_empty() && p.rx.is_empty()));
        assert_eq!(layout.available_pairs(), MAX_PEERS);
    }
}
