//! Operation objects and the FIFO queues they wait in.
//!
//! An operation moves `Free → InUse → Completing → Completed` and may be
//! reposted once `Completed`. Completion and cancellation race through the
//! `status` bits: whoever sets `COMPLETED` first owns the single completion
//! record, and a `CANCELED` bit seen at that moment turns it into a
//! cancellation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::AddrId;
use crate::arena::Handle;
use crate::error::{NaError, NaResult};

pub(crate) const COMPLETED: u32 = 1 << 0;
pub(crate) const CANCELED: u32 = 1 << 1;
pub(crate) const QUEUED: u32 = 1 << 2;

/// Handle to an operation object created by [`crate::SmEndpoint::op_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) Handle);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    SendUnexpected = 1,
    RecvUnexpected = 2,
    SendExpected = 3,
    RecvExpected = 4,
    Put = 5,
    Get = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    Free = 0,
    InUse = 1,
    Completing = 2,
    Completed = 3,
}

impl OpState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => OpState::InUse,
            2 => OpState::Completing,
            3 => OpState::Completed,
            _ => OpState::Free,
        }
    }
}

/// Everything an in-flight operation carries.
#[derive(Debug)]
pub(crate) struct OpData {
    pub kind: OpKind,
    pub context: u64,
    /// Peer the op holds a reference on.
    pub addr: Option<AddrId>,
    pub buf: Vec<u8>,
    pub actual_size: usize,
    pub tag: u32,
}

impl OpData {
    pub fn new(kind: OpKind, context: u64, addr: Option<AddrId>, buf: Vec<u8>, tag: u32) -> Self {
        Self {
            kind,
            context,
            addr,
            buf,
            actual_size: 0,
            tag,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Op {
    status: AtomicU32,
    state: AtomicU8,
    data: Mutex<Option<OpData>>,
}

impl Op {
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            state: AtomicU8::new(OpState::Free as u8),
            data: Mutex::new(None),
        }
    }

    pub fn state(&self) -> OpState {
        OpState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Claims the op for a new post.
    pub fn begin(&self, data: OpData) -> NaResult<()> {
        let claimed = [OpState::Free, OpState::Completed].iter().any(|from| {
            self.state
                .compare_exchange(
                    *from as u8,
                    OpState::InUse as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        });
        if !claimed {
            return Err(NaError::Busy);
        }
        self.status.store(0, Ordering::Release);
        *self.data.lock() = Some(data);
        Ok(())
    }

    /// Returns a just-claimed op to `Free` after a synchronous failure.
    pub fn abort(&self) -> Option<OpData> {
        let data = self.data.lock().take();
        self.state.store(OpState::Free as u8, Ordering::Release);
        data
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&mut OpData) -> R) -> Option<R> {
        self.data.lock().as_mut().map(f)
    }

    /// Sets `COMPLETED`; returns the status bits seen before.
    pub fn mark_completed(&self) -> u32 {
        self.status.fetch_or(COMPLETED, Ordering::AcqRel)
    }

    /// Sets `CANCELED`; returns the status bits seen before.
    pub fn mark_canceled(&self) -> u32 {
        self.status.fetch_or(CANCELED, Ordering::AcqRel)
    }

    pub fn start_completing(&self) -> Option<OpData> {
        self.state.store(OpState::Completing as u8, Ordering::Release);
        self.data.lock().take()
    }

    pub fn finish_completing(&self) {
        self.state.store(OpState::Completed as u8, Ordering::Release);
    }

    fn set_queued(&self) {
        self.status.fetch_or(QUEUED, Ordering::AcqRel);
    }

    fn clear_queued(&self) {
        self.status.fetch_and(!QUEUED, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedOp {
    pub id: OpId,
    pub op: Arc<Op>,
    pub addr: Option<AddrId>,
    pub tag: u32,
}

/// Outcome of claiming the head of the retry queue.
pub(crate) enum Claim {
    Taken(QueuedOp),
    /// Removed without posting; the claimer completes it as canceled.
    Canceled(QueuedOp),
    Gone,
}

#[derive(Debug, Default)]
pub(crate) struct OpQueue {
    inner: Mutex<VecDeque<QueuedOp>>,
}

impl OpQueue {
    pub fn push_back(&self, entry: QueuedOp) {
        let mut queue = self.inner.lock();
        entry.op.set_queued();
        queue.push_back(entry);
    }

    pub fn pop_front(&self) -> Option<QueuedOp> {
        let entry = self.inner.lock().pop_front()?;
        entry.op.clear_queued();
        Some(entry)
    }

    pub fn front(&self) -> Option<QueuedOp> {
        self.inner.lock().front().cloned()
    }

    /// Removes the first entry matching `pred`.
    pub fn take_first(&self, pred: impl Fn(&QueuedOp) -> bool) -> Option<QueuedOp> {
        let mut queue = self.inner.lock();
        let pos = queue.iter().position(pred)?;
        let entry = queue.remove(pos)?;
        entry.op.clear_queued();
        Some(entry)
    }

    /// Removes `id` if it is still queued, checking for cancellation under
    /// the same lock a canceler removes it with.
    pub fn claim(&self, id: OpId) -> Claim {
        let mut queue = self.inner.lock();
        let Some(pos) = queue.iter().position(|e| e.id == id) else {
            return Claim::Gone;
        };
        let Some(entry) = queue.remove(pos) else {
            return Claim::Gone;
        };
        entry.op.clear_queued();
        if entry.op.status() & CANCELED != 0 {
            Claim::Canceled(entry)
        } else {
            Claim::Taken(entry)
        }
    }

    /// Removes `id` if its `QUEUED` bit is still set.
    pub fn remove_if_queued(&self, id: OpId, op: &Op) -> Option<QueuedOp> {
        let mut queue = self.inner.lock();
        if op.status() & QUEUED == 0 {
            return None;
        }
        let pos = queue.iter().position(|e| e.id == id)?;
        let entry = queue.remove(pos)?;
        op.clear_queued();
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
