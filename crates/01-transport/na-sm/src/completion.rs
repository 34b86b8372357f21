use crossbeam_channel::{Sender, TrySendError};
use tracing::warn;

use crate::addr::AddrId;
use crate::error::NaError;
use crate::op::{OpId, OpKind};

/// Kind-specific payload of a completion.
#[derive(Debug)]
pub enum CompletionInfo {
    /// A send finished; the payload buffer is handed back.
    Send { buf: Vec<u8> },
    /// An unexpected message was received. The caller owns one reference on
    /// `source` and drops it with [`crate::SmEndpoint::addr_free`].
    RecvUnexpected {
        buf: Vec<u8>,
        actual_size: usize,
        tag: u32,
        source: Option<AddrId>,
    },
    RecvExpected {
        buf: Vec<u8>,
        actual_size: usize,
        tag: u32,
    },
    /// Put and get carry no payload.
    Rma,
}

#[derive(Debug)]
pub struct Completion {
    pub op: OpId,
    pub kind: OpKind,
    pub result: Result<(), NaError>,
    pub context: u64,
    pub info: CompletionInfo,
}

impl Completion {
    /// Payload buffer returned with the completion, if any.
    pub fn buf(&self) -> Option<&[u8]> {
        match &self.info {
            CompletionInfo::Send { buf }
            | CompletionInfo::RecvUnexpected { buf, .. }
            | CompletionInfo::RecvExpected { buf, .. } => Some(buf),
            CompletionInfo::Rma => None,
        }
    }

    /// Bytes actually delivered into a receive buffer.
    pub fn received(&self) -> Option<&[u8]> {
        match &self.info {
            CompletionInfo::RecvUnexpected {
                buf, actual_size, ..
            }
            | CompletionInfo::RecvExpected {
                buf, actual_size, ..
            } => Some(&buf[..*actual_size]),
            _ => None,
        }
    }
}

/// Receives completion records. Implementations must not block.
pub trait CompletionSink: Send + Sync {
    fn push(&self, completion: Completion);
}

impl CompletionSink for Sender<Completion> {
    fn push(&self, completion: Completion) {
        match self.try_send(completion) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(op = %dropped.op, kind = ?dropped.kind, "completion queue full; dropping record");
            }
            Err(TrySendError::Disconnected(dropped)) => {
                warn!(op = %dropped.op, kind = ?dropped.kind, "completion receiver gone; dropping record");
            }
        }
    }
}
