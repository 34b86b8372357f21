//! Shared-memory transport primitives used by the `na-sm` plugin.
//!
//! Everything here is either placed inside a shared region or wraps a Linux
//! descriptor used to coordinate peers:
//! * [`AtomicRing`] – lock-free MPMC ring of non-zero 64-bit words.
//! * [`AtomicBitmap`] – CAS-based index allocator for buffers and queue pairs.
//! * [`CopyBufPool`] – page-sized staging buffers with per-buffer spinlocks.
//! * [`RegionLayout`] / [`SharedRegion`] – fixed region layout and its named mapping.
//! * [`MsgHeader`] / [`CmdHeader`] – packed headers carried through the rings.
//! * [`EventFd`], [`PollSet`], [`RendezvousSock`] – notification, multiplexing
//!   and descriptor passing.
//! * [`TransportError`] – error surface for naming, mapping and OS failures.

#[cfg(not(target_os = "linux"))]
compile_error!("sm-transport relies on eventfd, epoll and process_vm_* and only builds on Linux");

mod bitmap;
mod copy_buf;
mod error;
mod event;
mod header;
mod layout;
pub mod naming;
mod poll;
mod region;
mod ring;
mod sock;

pub use bitmap::AtomicBitmap;
pub use copy_buf::{CopyBufPool, COPY_BUF_SIZE, NUM_BUFS};
pub use error::{TransportError, TransportResult};
pub use event::EventFd;
pub use header::{CmdHeader, CmdType, MsgHeader, MsgType};
pub use layout::{QueuePair, RegionLayout, MAX_PEERS};
pub use poll::{PollSet, Ready, MAX_EVENTS};
pub use region::SharedRegion;
pub use ring::{AtomicRing, CmdRing, MsgRing, CMD_RING_CAPACITY, MSG_RING_CAPACITY};
pub use sock::{NotifyFds, RendezvousSock};
