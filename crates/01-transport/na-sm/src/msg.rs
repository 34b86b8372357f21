//! Two-sided messaging through the copy buffers and message rings.

use std::sync::Arc;

use sm_transport::{MsgHeader, MsgType, COPY_BUF_SIZE};
use tracing::{debug, trace, warn};

use crate::addr::{AddrId, PeerAddr};
use crate::endpoint::SmEndpoint;
use crate::error::{NaError, NaResult};
use crate::op::{OpData, OpId, OpKind, QueuedOp};

impl SmEndpoint {
    pub fn msg_max_unexpected_size(&self) -> usize {
        COPY_BUF_SIZE
    }

    pub fn msg_max_expected_size(&self) -> usize {
        COPY_BUF_SIZE
    }

    pub fn msg_max_tag(&self) -> u32 {
        u32::MAX
    }

    /// Sends `buf` to `dest` as an unexpected message.
    ///
    /// Completes immediately when a copy buffer is free. Otherwise the op is
    /// queued and posted by a later progress call.
    pub fn msg_send_unexpected(
        &self,
        dest: AddrId,
        buf: Vec<u8>,
        tag: u32,
        context: u64,
        op: OpId,
    ) -> NaResult<()> {
        self.msg_send(OpKind::SendUnexpected, dest, buf, tag, context, op)
    }

    /// Sends `buf` to `dest`, to be matched by a pre-posted expected receive.
    pub fn msg_send_expected(
        &self,
        dest: AddrId,
        buf: Vec<u8>,
        tag: u32,
        context: u64,
        op: OpId,
    ) -> NaResult<()> {
        self.msg_send(OpKind::SendExpected, dest, buf, tag, context, op)
    }

    fn msg_send(
        &self,
        kind: OpKind,
        dest: AddrId,
        buf: Vec<u8>,
        tag: u32,
        context: u64,
        op_id: OpId,
    ) -> NaResult<()> {
        if buf.len() > COPY_BUF_SIZE {
            return Err(NaError::Overflow);
        }
        let op = self.op(op_id)?;
        let peer = self.addrs.get(dest)?;
        let pool = peer.copy_bufs().ok_or(NaError::InvalidArg)?;

        op.begin(OpData::new(kind, context, Some(dest), buf, tag))?;
        peer.acquire();

        let Some(buf_idx) = pool.reserve() else {
            debug!(op = %op_id, %dest, "no copy buffer available, deferring send");
            self.retry_ops.push_back(QueuedOp {
                id: op_id,
                op: Arc::clone(&op),
                addr: Some(dest),
                tag,
            });
            return Ok(());
        };

        let posted = op
            .with_data(|data| self.post_msg(&peer, buf_idx, kind, &data.buf, tag))
            .unwrap_or(Err(NaError::InvalidState));
        if let Err(err) = posted {
            op.abort();
            self.release_addr(dest, &peer);
            return Err(err);
        }
        self.complete(op_id, &op, Ok(()), true);
        Ok(())
    }

    /// Stages `payload` in copy buffer `buf_idx` of the peer's region and
    /// pushes its header. The buffer is given back when the ring is full.
    pub(crate) fn post_msg(
        &self,
        peer: &PeerAddr,
        buf_idx: usize,
        kind: OpKind,
        payload: &[u8],
        tag: u32,
    ) -> NaResult<()> {
        let (Some(pool), Some(ring)) = (peer.copy_bufs(), peer.tx_ring()) else {
            return Err(NaError::InvalidArg);
        };
        let msg_type = match kind {
            OpKind::SendUnexpected => MsgType::SendUnexpected,
            OpKind::SendExpected => MsgType::SendExpected,
            _ => {
                pool.release(buf_idx);
                return Err(NaError::InvalidArg);
            }
        };

        pool.copy_to(buf_idx, payload);
        let header = MsgHeader {
            msg_type,
            buf_idx: buf_idx as u8,
            buf_size: payload.len() as u16,
            tag,
        };
        if !ring.push(header.encode()) {
            pool.release(buf_idx);
            warn!(pid = peer.pid, id = peer.id, pair = peer.pair_idx, "message ring full");
            return Err(NaError::Again);
        }
        trace!(pid = peer.pid, id = peer.id, buf_idx, size = payload.len(), tag, "posted message");

        if let Some(tx) = &peer.tx_notify {
            if let Err(err) = tx.set() {
                warn!(%err, "failed to signal peer");
            }
        }
        Ok(())
    }

    /// Posts a receive for the next unexpected message from any peer.
    ///
    /// A message that is already buffered completes the op right away.
    pub fn msg_recv_unexpected(&self, buf: Vec<u8>, context: u64, op_id: OpId) -> NaResult<()> {
        let op = self.op(op_id)?;
        op.begin(OpData::new(OpKind::RecvUnexpected, context, None, buf, 0))?;

        let mut pending = self.unexpected_msgs.lock();
        match pending.pop_front() {
            Some(msg) => {
                drop(pending);
                op.with_data(|data| {
                    let len = msg.buf.len().min(data.buf.len());
                    data.buf[..len].copy_from_slice(&msg.buf[..len]);
                    data.actual_size = len;
                    data.tag = msg.tag;
                    data.addr = Some(msg.source);
                });
                self.complete(op_id, &op, Ok(()), true);
            }
            None => {
                self.unexpected_ops.push_back(QueuedOp {
                    id: op_id,
                    op: Arc::clone(&op),
                    addr: None,
                    tag: 0,
                });
            }
        }
        Ok(())
    }

    /// Posts a receive matched by the next expected message from `source`
    /// carrying `tag`.
    pub fn msg_recv_expected(
        &self,
        source: AddrId,
        buf: Vec<u8>,
        tag: u32,
        context: u64,
        op_id: OpId,
    ) -> NaResult<()> {
        let op = self.op(op_id)?;
        let peer = self.addrs.get(source)?;
        op.begin(OpData::new(OpKind::RecvExpected, context, Some(source), buf, tag))?;
        peer.acquire();
        self.expected_ops.push_back(QueuedOp {
            id: op_id,
            op: Arc::clone(&op),
            addr: Some(source),
            tag,
        });
        Ok(())
    }
}
