//! Endpoint lifecycle, address API and operation objects.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sm_transport::{naming, EventFd, PollSet, RendezvousSock, SharedRegion};
use tracing::{debug, info, warn};

use crate::addr::{addr_key, parse_addr, AddrId, AddrRole, AddrTable, PeerAddr};
use crate::arena::Arena;
use crate::cma::{CrossProcessCopy, ProcessVmCopy};
use crate::completion::CompletionSink;
use crate::config::{ProgressMode, SmConfig};
use crate::error::{NaError, NaResult};
use crate::op::{Op, OpId, OpQueue, OpState};
use crate::progress::{token, PollKind};
use crate::registry::ProcessRegistry;

/// Serialized address size: pid (4 bytes) and instance id (1 byte).
pub const ADDR_SERIALIZE_SIZE: usize = 5;

/// A message that arrived before any receive was posted for it.
pub(crate) struct UnexpectedMsg {
    /// Holds a reference on the sending address.
    pub source: AddrId,
    pub buf: Vec<u8>,
    pub tag: u32,
}

/// One shared-memory endpoint: the plugin instance of a process.
pub struct SmEndpoint {
    pub(crate) pid: u32,
    pub(crate) id: u8,
    pub(crate) config: SmConfig,
    pub(crate) username: String,
    pub(crate) region: Option<Arc<SharedRegion>>,
    pub(crate) source: AddrId,
    pub(crate) source_addr: Arc<PeerAddr>,
    pub(crate) poll: Option<PollSet>,
    pub(crate) sock: Option<RendezvousSock>,
    pub(crate) addrs: AddrTable,
    pub(crate) ops: RwLock<Arena<Op>>,
    pub(crate) unexpected_msgs: Mutex<VecDeque<UnexpectedMsg>>,
    pub(crate) unexpected_ops: OpQueue,
    pub(crate) expected_ops: OpQueue,
    pub(crate) retry_ops: OpQueue,
    pub(crate) sink: Box<dyn CompletionSink>,
    pub(crate) copier: Box<dyn CrossProcessCopy>,
    closed: bool,
}

impl SmEndpoint {
    /// Opens an endpoint.
    ///
    /// A listening endpoint creates its shared region and reserves a loopback
    /// pair in it. In blocking mode a poll set, a rendezvous socket (bound
    /// when listening) and a local tx event are created as well.
    pub fn open<S>(config: SmConfig, registry: &ProcessRegistry, sink: S) -> NaResult<Self>
    where
        S: CompletionSink + 'static,
    {
        let pid = std::process::id();
        let id = registry.next_instance_id()?;
        let username = config.resolve_username()?;
        let blocking = config.progress_mode == ProgressMode::Blocking;

        let mut region = None;
        let mut pair_idx = 0;
        if config.listen {
            let name = naming::shm_name(&config.prefix, &username, pid, id)?;
            let created = Arc::new(SharedRegion::open(&config.shm_dir, &name, true)?);
            pair_idx = created.layout().reserve_pair().ok_or(NaError::Again)?;
            region = Some(created);
        }

        let mut poll = None;
        let mut sock = None;
        let mut tx_notify = None;
        if blocking {
            let set = PollSet::new()?;
            let rendezvous = if config.listen {
                let path = naming::sock_path(&config.tmp_dir, &config.prefix, &username, pid, id)?;
                let bound = RendezvousSock::bind(&path, &config.tmp_dir)?;
                set.add(bound.as_raw_fd(), token(PollKind::Sock, None))?;
                bound
            } else {
                RendezvousSock::unbound()?
            };
            tx_notify = Some(EventFd::new()?);
            poll = Some(set);
            sock = Some(rendezvous);
        }

        let addrs = AddrTable::default();
        let (source, source_addr) = addrs.insert(PeerAddr::new(
            pid,
            id,
            pair_idx,
            region.clone(),
            AddrRole::Source,
            tx_notify,
            None,
        ));
        if let (Some(set), Some(tx)) = (&poll, &source_addr.tx_notify) {
            set.add(tx.as_raw_fd(), token(PollKind::TxNotify, Some(source)))?;
        }

        info!(pid, id, listen = config.listen, mode = ?config.progress_mode, "opened sm endpoint");
        Ok(Self {
            pid,
            id,
            config,
            username,
            region,
            source,
            source_addr,
            poll,
            sock,
            addrs,
            ops: RwLock::new(Arena::default()),
            unexpected_msgs: Mutex::new(VecDeque::new()),
            unexpected_ops: OpQueue::default(),
            expected_ops: OpQueue::default(),
            retry_ops: OpQueue::default(),
            sink: Box::new(sink),
            copier: Box::new(ProcessVmCopy),
            closed: false,
        })
    }

    /// Replaces the cross-process copy capability used by put/get.
    pub fn with_copier<C>(mut self, copier: C) -> Self
    where
        C: CrossProcessCopy + 'static,
    {
        self.copier = Box::new(copier);
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn instance_id(&self) -> u8 {
        self.id
    }

    pub fn is_listening(&self) -> bool {
        self.config.listen
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.config.progress_mode
    }

    /// Tears the endpoint down. Fails with `Busy` while messages or
    /// operations are still queued.
    pub fn close(&mut self) -> NaResult<()> {
        if self.closed {
            return Ok(());
        }
        let pending_msgs = self.unexpected_msgs.lock().len();
        if pending_msgs > 0
            || !self.unexpected_ops.is_empty()
            || !self.expected_ops.is_empty()
            || !self.retry_ops.is_empty()
        {
            warn!(
                pending_msgs,
                unexpected_ops = self.unexpected_ops.len(),
                expected_ops = self.expected_ops.len(),
                retry_ops = self.retry_ops.len(),
                "cannot close endpoint with queued work"
            );
            return Err(NaError::Busy);
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        for msg in self.unexpected_msgs.lock().drain(..) {
            if let Ok(addr) = self.addrs.get(msg.source) {
                addr.release();
            }
        }

        for addr in self.addrs.poll_drain() {
            self.addr_destroy(&addr);
        }

        if let Some(region) = &self.region {
            region.layout().release_pair(self.source_addr.pair_idx);
            if let Err(err) = region.unlink() {
                warn!(%err, "failed to unlink shared region");
            }
        }

        if let Some(poll) = &self.poll {
            if let Some(tx) = &self.source_addr.tx_notify {
                if let Err(err) = poll.remove(tx.as_raw_fd()) {
                    warn!(%err, "failed to deregister tx notify");
                }
            }
            if let (Some(sock), true) = (&self.sock, self.config.listen) {
                if let Err(err) = poll.remove(sock.as_raw_fd()) {
                    warn!(%err, "failed to deregister rendezvous socket");
                }
            }
        }
        if let Some(sock) = self.sock.take() {
            if let Err(err) = sock.close() {
                warn!(%err, "failed to close rendezvous socket");
            }
        }
        self.poll = None;
        self.addrs.remove(self.source);
        self.region = None;
        self.closed = true;
        info!(pid = self.pid, id = self.id, live_ops = self.ops.read().len(), "closed sm endpoint");
    }

    // Addresses

    /// Resolves `sm://<pid>/<id>`, performing the handshake on first use.
    pub fn addr_lookup(&self, name: &str) -> NaResult<AddrId> {
        let (pid, id) = parse_addr(name)?;
        debug!(pid, id, "looking up address");
        let (addr_id, addr, existed) = self.addrs.lookup_or_insert(
            addr_key(pid, id),
            || self.addr_connect(pid, id),
            |addr_id, addr| self.publish_addr(addr_id, addr),
        )?;
        if !existed {
            // One reference stays with the poll list, one goes to the caller.
            addr.acquire();
        }
        Ok(addr_id)
    }

    /// Drops one reference; the address is destroyed with the last one.
    pub fn addr_free(&self, addr: AddrId) -> NaResult<()> {
        let peer = self.addrs.get(addr)?;
        self.release_addr(addr, &peer);
        Ok(())
    }

    pub(crate) fn release_addr(&self, id: AddrId, peer: &PeerAddr) {
        if !peer.release() || peer.role == AddrRole::Source {
            return;
        }
        if let Some(addr) = self.addrs.unlink(id) {
            self.addr_destroy(&addr);
        }
    }

    pub fn addr_self(&self) -> AddrId {
        self.source_addr.acquire();
        self.source
    }

    pub fn addr_dup(&self, addr: AddrId) -> NaResult<AddrId> {
        self.addrs.get(addr)?.acquire();
        Ok(addr)
    }

    /// `true` when both handles name the same pid and instance.
    pub fn addr_cmp(&self, a: AddrId, b: AddrId) -> NaResult<bool> {
        let (a, b) = (self.addrs.get(a)?, self.addrs.get(b)?);
        Ok(a.pid == b.pid && a.id == b.id)
    }

    pub fn addr_is_self(&self, addr: AddrId) -> NaResult<bool> {
        let peer = self.addrs.get(addr)?;
        Ok(peer.pid == self.pid && peer.id == self.id)
    }

    pub fn addr_to_string(&self, addr: AddrId) -> NaResult<String> {
        let peer = self.addrs.get(addr)?;
        Ok(format!("sm://{}/{}", peer.pid, peer.id))
    }

    pub fn addr_serialize_size(&self, _addr: AddrId) -> usize {
        ADDR_SERIALIZE_SIZE
    }

    pub fn addr_serialize(&self, addr: AddrId, buf: &mut [u8]) -> NaResult<()> {
        if buf.len() < ADDR_SERIALIZE_SIZE {
            return Err(NaError::Overflow);
        }
        let peer = self.addrs.get(addr)?;
        buf[..4].copy_from_slice(&peer.pid.to_ne_bytes());
        buf[4] = peer.id;
        Ok(())
    }

    /// Resolves a serialized address against the known addresses.
    pub fn addr_deserialize(&self, buf: &[u8]) -> NaResult<AddrId> {
        if buf.len() < ADDR_SERIALIZE_SIZE {
            return Err(NaError::Overflow);
        }
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[..4]);
        let pid = u32::from_ne_bytes(pid);
        let id = buf[4];
        if pid == self.pid && id == self.id {
            return Ok(self.addr_self());
        }
        self.addrs
            .find(addr_key(pid, id))
            .map(|(addr_id, _)| addr_id)
            .ok_or(NaError::NoEntry)
    }

    // Operation objects

    pub fn op_create(&self) -> OpId {
        let (handle, _) = self.ops.write().insert(Op::new());
        OpId(handle)
    }

    /// Releases an operation object that is not in flight.
    pub fn op_destroy(&self, op: OpId) -> NaResult<()> {
        let mut ops = self.ops.write();
        let state = ops.get(op.0).ok_or(NaError::InvalidArg)?.state();
        if !matches!(state, OpState::Free | OpState::Completed) {
            return Err(NaError::Busy);
        }
        ops.remove(op.0);
        Ok(())
    }

    pub(crate) fn op(&self, op: OpId) -> NaResult<Arc<Op>> {
        self.ops.read().get(op.0).cloned().ok_or(NaError::InvalidArg)
    }
}

impl Drop for SmEndpoint {
    fn drop(&mut self) {
        if !self.closed {
            self.teardown();
        }
    }
}
