//! Progress engine, completion and cancellation.

use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use sm_transport::{CopyBufPool, MsgHeader, MsgType, PollSet, COPY_BUF_SIZE, NUM_BUFS};
use tracing::{error, trace, warn};

use crate::addr::{AddrId, PeerAddr};
use crate::arena::Handle;
use crate::completion::{Completion, CompletionInfo};
use crate::config::ProgressMode;
use crate::endpoint::{SmEndpoint, UnexpectedMsg};
use crate::error::{NaError, NaResult};
use crate::op::{Claim, Op, OpId, OpKind, CANCELED, COMPLETED};

/// What a poll token refers to. Stored in the low two bits of the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum PollKind {
    Sock = 0,
    TxNotify = 1,
    RxNotify = 2,
}

/// Packs `kind | index << 2 | generation << 32`.
pub(crate) fn token(kind: PollKind, addr: Option<AddrId>) -> u64 {
    let (index, generation) = addr.map_or((0, 0), |a| (a.0.index(), a.0.generation()));
    kind as u64 | (u64::from(index) & 0x3fff_ffff) << 2 | u64::from(generation) << 32
}

fn parse_token(token: u64) -> Option<(PollKind, AddrId)> {
    let kind = match token & 0b11 {
        0 => PollKind::Sock,
        1 => PollKind::TxNotify,
        2 => PollKind::RxNotify,
        _ => return None,
    };
    let handle = Handle::from_parts((token >> 2) as u32 & 0x3fff_ffff, (token >> 32) as u32);
    Some((kind, AddrId(handle)))
}

impl SmEndpoint {
    /// Makes progress for up to `timeout`.
    ///
    /// Returns `Ok` once anything was delivered, accepted or retried, and
    /// `Timeout` when the deadline passes without progress. A zero timeout
    /// runs exactly one non-blocking pass.
    pub fn progress(&self, timeout: Duration) -> NaResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut progressed = match &self.poll {
                Some(poll) if !remaining.is_zero() && self.poll_try_wait() => {
                    self.progress_wait(poll, remaining)?
                }
                _ => self.progress_pass()?,
            };
            progressed |= self.process_retries()?;

            if progressed {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NaError::Timeout);
            }
        }
    }

    /// `true` when nothing is pending locally, so blocking on the poll set
    /// cannot miss work.
    pub fn poll_try_wait(&self) -> bool {
        if !self.retry_ops.is_empty() {
            return false;
        }
        self.addrs
            .poll_snapshot()
            .iter()
            .all(|(_, addr)| addr.rx_ring().map_or(true, |ring| ring.is_empty()))
    }

    /// Descriptor an external event loop can wait on, in blocking mode.
    pub fn poll_get_fd(&self) -> Option<RawFd> {
        self.poll.as_ref().map(|poll| poll.as_raw_fd())
    }

    fn progress_wait(&self, poll: &PollSet, timeout: Duration) -> NaResult<bool> {
        let ready = poll.wait(timeout)?;
        let mut progressed = false;
        for raw in ready {
            let Some((kind, addr_id)) = parse_token(raw) else {
                warn!(token = raw, "unknown poll token");
                continue;
            };
            progressed |= match kind {
                PollKind::Sock => self.process_sock()?,
                PollKind::TxNotify => self.consume_tx_notify()?,
                PollKind::RxNotify => {
                    let Ok(addr) = self.addrs.get(addr_id) else {
                        trace!(addr = %addr_id, "event for a destroyed address");
                        continue;
                    };
                    if let Some(rx) = &addr.rx_notify {
                        rx.get()?;
                    }
                    let mut drained = false;
                    while self.progress_rx_queue(addr_id, &addr)? {
                        drained = true;
                    }
                    drained
                }
            };
        }
        Ok(progressed)
    }

    fn progress_pass(&self) -> NaResult<bool> {
        let mut progressed = false;
        for (addr_id, addr) in self.addrs.poll_snapshot() {
            if !self.progress_rx_queue(addr_id, &addr)? {
                continue;
            }
            progressed = true;
            // An emptied ring leaves nothing for its wakeup to report.
            if let (Some(rx), Some(ring)) = (&addr.rx_notify, addr.rx_ring()) {
                if ring.is_empty() {
                    rx.get()?;
                }
            }
        }

        match self.config.progress_mode {
            ProgressMode::Blocking => {
                progressed |= self.consume_tx_notify()?;
                if self.config.listen {
                    progressed |= self.process_sock()?;
                }
            }
            ProgressMode::NoBlock => {
                if let Some(region) = &self.region {
                    while let Some(raw) = region.layout().cmd_queue.pop() {
                        self.process_cmd(raw, None)?;
                        progressed = true;
                    }
                }
            }
        }
        Ok(progressed)
    }

    fn consume_tx_notify(&self) -> NaResult<bool> {
        match &self.source_addr.tx_notify {
            Some(tx) => Ok(tx.get()?),
            None => Ok(false),
        }
    }

    fn process_sock(&self) -> NaResult<bool> {
        let Some(sock) = &self.sock else {
            return Ok(false);
        };
        let mut progressed = false;
        while let Some((raw, fds)) = sock.recv_cmd()? {
            self.process_cmd(raw, fds)?;
            progressed = true;
        }
        Ok(progressed)
    }

    /// Handles at most one message from `addr`'s receive ring.
    fn progress_rx_queue(&self, addr_id: AddrId, addr: &PeerAddr) -> NaResult<bool> {
        let (Some(ring), Some(pool)) = (addr.rx_ring(), addr.copy_bufs()) else {
            return Ok(false);
        };
        let Some(raw) = ring.pop() else {
            return Ok(false);
        };
        let header = MsgHeader::decode(raw)?;
        let buf_idx = usize::from(header.buf_idx);
        if buf_idx >= NUM_BUFS || usize::from(header.buf_size) > COPY_BUF_SIZE {
            if buf_idx < NUM_BUFS {
                pool.release(buf_idx);
            }
            error!(
                addr = %addr_id,
                buf_idx,
                size = header.buf_size,
                "message header outside the copy buffer pool"
            );
            return Err(NaError::ProtocolError);
        }
        trace!(
            addr = %addr_id,
            kind = ?header.msg_type,
            buf_idx = header.buf_idx,
            size = header.buf_size,
            tag = header.tag,
            "received message"
        );
        match header.msg_type {
            MsgType::SendUnexpected => self.deliver_unexpected(addr_id, addr, pool, header),
            MsgType::SendExpected => self.deliver_expected(addr_id, pool, header)?,
        }
        Ok(true)
    }

    fn deliver_unexpected(
        &self,
        addr_id: AddrId,
        addr: &PeerAddr,
        pool: &CopyBufPool,
        header: MsgHeader,
    ) {
        let buf_idx = usize::from(header.buf_idx);
        let mut payload = vec![0; usize::from(header.buf_size)];
        pool.copy_from(buf_idx, &mut payload);
        pool.release(buf_idx);

        let mut pending = self.unexpected_msgs.lock();
        match self.unexpected_ops.pop_front() {
            Some(entry) => {
                drop(pending);
                entry.op.with_data(|data| {
                    let len = payload.len().min(data.buf.len());
                    data.buf[..len].copy_from_slice(&payload[..len]);
                    data.actual_size = len;
                    data.tag = header.tag;
                    addr.acquire();
                    data.addr = Some(addr_id);
                });
                self.complete(entry.id, &entry.op, Ok(()), false);
            }
            None => {
                addr.acquire();
                pending.push_back(UnexpectedMsg {
                    source: addr_id,
                    buf: payload,
                    tag: header.tag,
                });
            }
        }
    }

    fn deliver_expected(&self, addr_id: AddrId, pool: &CopyBufPool, header: MsgHeader) -> NaResult<()> {
        let buf_idx = usize::from(header.buf_idx);
        let matched = self
            .expected_ops
            .take_first(|entry| entry.addr == Some(addr_id) && entry.tag == header.tag);
        let Some(entry) = matched else {
            pool.release(buf_idx);
            error!(addr = %addr_id, tag = header.tag, "no expected receive posted for message");
            return Err(NaError::InvalidState);
        };

        entry.op.with_data(|data| {
            let len = usize::from(header.buf_size).min(data.buf.len());
            pool.copy_from(buf_idx, &mut data.buf[..len]);
            data.actual_size = len;
        });
        pool.release(buf_idx);
        self.complete(entry.id, &entry.op, Ok(()), false);
        Ok(())
    }

    /// Posts deferred sends, in order, while copy buffers are available.
    fn process_retries(&self) -> NaResult<bool> {
        let mut progressed = false;
        while let Some(head) = self.retry_ops.front() {
            let peer = head.addr.and_then(|id| self.addrs.get(id).ok());
            let Some((peer, pool)) = peer
                .as_ref()
                .and_then(|peer| peer.copy_bufs().map(|pool| (peer, pool)))
            else {
                match self.retry_ops.claim(head.id) {
                    Claim::Taken(entry) => {
                        self.complete(entry.id, &entry.op, Err(NaError::InvalidState), false);
                        progressed = true;
                    }
                    Claim::Canceled(entry) => {
                        self.complete(entry.id, &entry.op, Err(NaError::Canceled), false);
                        progressed = true;
                    }
                    Claim::Gone => {}
                }
                continue;
            };
            let Some(buf_idx) = pool.reserve() else {
                break;
            };

            match self.retry_ops.claim(head.id) {
                Claim::Taken(entry) => {
                    let posted = entry
                        .op
                        .with_data(|data| self.post_msg(peer, buf_idx, data.kind, &data.buf, data.tag));
                    let result = posted.unwrap_or_else(|| {
                        pool.release(buf_idx);
                        Err(NaError::InvalidState)
                    });
                    self.complete(entry.id, &entry.op, result, false);
                    progressed = true;
                }
                Claim::Canceled(entry) => {
                    pool.release(buf_idx);
                    self.complete(entry.id, &entry.op, Err(NaError::Canceled), false);
                    progressed = true;
                }
                Claim::Gone => pool.release(buf_idx),
            }
        }
        Ok(progressed)
    }

    /// Completes an operation exactly once and hands the record to the sink.
    ///
    /// A concurrent cancel turns the result into `Canceled`. `notify` wakes
    /// this endpoint's own poll set, for completions raised outside progress.
    pub(crate) fn complete(&self, id: OpId, op: &Op, result: NaResult<()>, notify: bool) {
        let prev = op.mark_completed();
        if prev & COMPLETED != 0 {
            return;
        }
        let result = if prev & CANCELED != 0 {
            Err(NaError::Canceled)
        } else {
            result
        };
        let Some(data) = op.start_completing() else {
            op.finish_completing();
            warn!(op = %id, "completing an op without data");
            return;
        };

        let source = match (data.kind, &result) {
            (OpKind::RecvUnexpected, Ok(())) => data.addr,
            _ => {
                if let Some(addr_id) = data.addr {
                    if let Ok(addr) = self.addrs.get(addr_id) {
                        self.release_addr(addr_id, &addr);
                    }
                }
                None
            }
        };
        let info = match data.kind {
            OpKind::SendUnexpected | OpKind::SendExpected => CompletionInfo::Send { buf: data.buf },
            OpKind::RecvUnexpected => CompletionInfo::RecvUnexpected {
                buf: data.buf,
                actual_size: data.actual_size,
                tag: data.tag,
                source,
            },
            OpKind::RecvExpected => CompletionInfo::RecvExpected {
                buf: data.buf,
                actual_size: data.actual_size,
                tag: data.tag,
            },
            OpKind::Put | OpKind::Get => CompletionInfo::Rma,
        };
        op.finish_completing();
        trace!(op = %id, kind = ?data.kind, ?result, "completed");

        self.sink.push(Completion {
            op: id,
            kind: data.kind,
            result,
            context: data.context,
            info,
        });

        if notify {
            if let Some(tx) = &self.source_addr.tx_notify {
                if let Err(err) = tx.set() {
                    warn!(%err, "failed to signal completion");
                }
            }
        }
    }

    /// Cancels an in-flight operation.
    ///
    /// Queued receives and deferred sends complete with `Canceled`. Put and
    /// get finish synchronously and are left alone. Canceling a completed
    /// op does nothing.
    pub fn cancel(&self, op_id: OpId) -> NaResult<()> {
        let op = self.op(op_id)?;
        if op.mark_canceled() & COMPLETED != 0 {
            return Ok(());
        }
        let Some(kind) = op.with_data(|data| data.kind) else {
            return Ok(());
        };
        let queue = match kind {
            OpKind::RecvUnexpected => &self.unexpected_ops,
            OpKind::RecvExpected => &self.expected_ops,
            OpKind::SendUnexpected | OpKind::SendExpected => &self.retry_ops,
            OpKind::Put | OpKind::Get => return Ok(()),
        };
        if queue.remove_if_queued(op_id, &op).is_some() {
            self.complete(op_id, &op, Err(NaError::Canceled), true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmConfig;
    use crate::registry::ProcessRegistry;
    use crossbeam_channel::Receiver;
    use tempfile::TempDir;

    struct Pair {
        _dir: TempDir,
        server: SmEndpoint,
        server_done: Receiver<Completion>,
        client: SmEndpoint,
        client_done: Receiver<Completion>,
        to_server: AddrId,
    }

    fn connected_pair() -> Pair {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProcessRegistry::new();
        let config = |listen| SmConfig {
            listen,
            username: Some("unit".into()),
            tmp_dir: dir.path().to_owned(),
            shm_dir: dir.path().to_owned(),
            ..SmConfig::default()
        };
        let (tx, server_done) = crossbeam_channel::unbounded();
        let server = SmEndpoint::open(config(true), &registry, tx).expect("open server");
        let (tx, client_done) = crossbeam_channel::unbounded();
        let client = SmEndpoint::open(config(false), &registry, tx).expect("open client");
        let name = format!("sm://{}/{}", server.pid(), server.instance_id());
        let to_server = client.addr_lookup(&name).expect("lookup");
        Pair {
            _dir: dir,
            server,
            server_done,
            client,
            client_done,
            to_server,
        }
    }

    /// Progresses `ep` until it reports an error other than a timeout.
    fn progress_until_err(ep: &SmEndpoint) -> NaError {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match ep.progress(Duration::from_millis(5)) {
                Ok(()) | Err(NaError::Timeout) => {}
                Err(err) => return err,
            }
            assert!(Instant::now() < deadline, "progress never failed");
        }
    }

    #[test]
    fn header_outside_pool_is_rejected() {
        let pair = connected_pair();
        let peer = pair.client.addrs.get(pair.to_server).expect("looked-up address");
        let (ring, pool) = (peer.tx_ring().expect("ring"), peer.copy_bufs().expect("pool"));

        let bad_index = MsgHeader {
            msg_type: MsgType::SendUnexpected,
            buf_idx: 200,
            buf_size: 16,
            tag: 1,
        };
        assert!(ring.push(bad_index.encode()));
        assert_eq!(progress_until_err(&pair.server), NaError::ProtocolError);

        let buf_idx = pool.reserve().expect("free buffer");
        let oversized = MsgHeader {
            msg_type: MsgType::SendExpected,
            buf_idx: buf_idx as u8,
            buf_size: 60_000,
            tag: 2,
        };
        assert!(ring.push(oversized.encode()));
        assert_eq!(progress_until_err(&pair.server), NaError::ProtocolError);
        assert_eq!(pool.available(), NUM_BUFS, "named buffer is returned to the pool");
        assert!(pair.server_done.try_recv().is_err(), "nothing is delivered");
    }

    #[test]
    fn canceled_retry_head_does_not_block_later_sends() {
        let pair = connected_pair();
        let client = &pair.client;
        let ops: Vec<OpId> = (0..NUM_BUFS as u32 + 2)
            .map(|tag| {
                let op = client.op_create();
                client
                    .msg_send_unexpected(pair.to_server, tag.to_ne_bytes().to_vec(), tag, 0, op)
                    .expect("send");
                op
            })
            .collect();
        assert_eq!(client.retry_ops.len(), 2);
        assert_eq!(pair.client_done.try_iter().count(), NUM_BUFS);

        // Canceled while the drain holds it; the drain completes it.
        let head = ops[NUM_BUFS];
        client.op(head).expect("op").mark_canceled();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pair.server.unexpected_msgs.lock().len() < NUM_BUFS {
            let _ = pair.server.progress(Duration::from_millis(5));
            assert!(Instant::now() < deadline, "server never drained the ring");
        }
        client.progress(Duration::ZERO).expect("retries progress");
        assert!(client.retry_ops.is_empty(), "live send behind the canceled one was posted");

        let done: Vec<_> = pair.client_done.try_iter().collect();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].op, head);
        assert_eq!(done[0].result, Err(NaError::Canceled));
        assert_eq!(done[1].op, ops[NUM_BUFS + 1]);
        assert_eq!(done[1].result, Ok(()));

        while pair.server.unexpected_msgs.lock().len() < NUM_BUFS + 1 {
            let _ = pair.server.progress(Duration::from_millis(5));
            assert!(Instant::now() < deadline, "deferred send never arrived");
        }
        let tags: Vec<u32> = pair.server.unexpected_msgs.lock().iter().map(|m| m.tag).collect();
        assert!(!tags.contains(&(NUM_BUFS as u32)), "canceled payload was not sent");
        assert_eq!(tags.last(), Some(&(NUM_BUFS as u32 + 1)));

        let peer = client.addrs.get(pair.to_server).expect("address");
        assert_eq!(peer.copy_bufs().expect("pool").available(), NUM_BUFS);
    }

    #[test]
    fn tokens_round_trip_kind_and_handle() {
        let addr = AddrId(Handle::from_parts(12_345, 7));
        for kind in [PollKind::Sock, PollKind::TxNotify, PollKind::RxNotify] {
            let (parsed_kind, parsed) = parse_token(token(kind, Some(addr))).expect("valid token");
            assert_eq!(parsed_kind, kind);
            assert_eq!(parsed, addr);
        }
        assert!(parse_token(3).is_none());
    }
}
