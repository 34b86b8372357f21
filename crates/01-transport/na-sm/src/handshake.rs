//! Connection setup and teardown between endpoints.
//!
//! A connecting endpoint reserves a queue pair in the listener's region and
//! announces it with a `Reserved` command, sent over the rendezvous socket
//! together with two event descriptors in blocking mode, or pushed onto the
//! listener's command ring otherwise. Destroying the address sends
//! `Released` the same way.

use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;

use sm_transport::{naming, CmdHeader, CmdType, EventFd, NotifyFds, SharedRegion};
use tracing::{debug, info, warn};

use crate::addr::{AddrId, AddrRole, PeerAddr};
use crate::config::ProgressMode;
use crate::endpoint::SmEndpoint;
use crate::error::{NaError, NaResult};
use crate::progress::{token, PollKind};

type Notify = (Option<EventFd>, Option<EventFd>);

impl SmEndpoint {
    /// Opens the peer's region, reserves a pair in it and announces it.
    pub(crate) fn addr_connect(&self, pid: u32, id: u8) -> NaResult<PeerAddr> {
        let name = naming::shm_name(&self.config.prefix, &self.username, pid, id)?;
        let region = Arc::new(SharedRegion::open(&self.config.shm_dir, &name, false)?);
        let layout = region.layout();
        let Some(pair_idx) = layout.reserve_pair() else {
            warn!(pid, id, "no queue pair left in peer region");
            return Err(NaError::Again);
        };
        layout.pair(pair_idx).tx.reset();
        layout.pair(pair_idx).rx.reset();

        let cmd = CmdHeader {
            cmd_type: CmdType::Reserved,
            pid: self.pid,
            id: self.id,
            pair_idx,
        };
        let (tx_notify, rx_notify) = self.announce(&region, pid, id, cmd).inspect_err(|_| {
            layout.release_pair(pair_idx);
        })?;

        info!(pid, id, pair = pair_idx, "connected to peer");
        Ok(PeerAddr::new(
            pid,
            id,
            pair_idx,
            Some(region),
            AddrRole::Lookup,
            tx_notify,
            rx_notify,
        ))
    }

    fn announce(
        &self,
        region: &SharedRegion,
        pid: u32,
        id: u8,
        cmd: CmdHeader,
    ) -> NaResult<Notify> {
        match (&self.sock, self.config.progress_mode) {
            (Some(sock), ProgressMode::Blocking) => {
                let tx = EventFd::new()?;
                let rx = EventFd::new()?;
                let dest = naming::sock_path(
                    &self.config.tmp_dir,
                    &self.config.prefix,
                    &self.username,
                    pid,
                    id,
                )?;
                sock.send_cmd(&dest, cmd.encode(), Some((tx.as_fd(), rx.as_fd())))?;
                Ok((Some(tx), Some(rx)))
            }
            _ => {
                if !region.layout().cmd_queue.push(cmd.encode()) {
                    warn!(pid, id, "peer command ring full");
                    return Err(NaError::Again);
                }
                Ok((None, None))
            }
        }
    }

    /// Registers the address for polling and puts it on the poll list.
    pub(crate) fn publish_addr(&self, id: AddrId, addr: &Arc<PeerAddr>) -> NaResult<()> {
        if let Err(err) = self.register_rx(id, addr) {
            self.addr_destroy(addr);
            return Err(err);
        }
        self.addrs.poll_push_front(id);
        Ok(())
    }

    fn register_rx(&self, id: AddrId, addr: &PeerAddr) -> NaResult<()> {
        if let (Some(poll), Some(rx)) = (&self.poll, &addr.rx_notify) {
            poll.add(rx.as_raw_fd(), token(PollKind::RxNotify, Some(id)))?;
        }
        Ok(())
    }

    /// Applies one command received from a peer.
    pub(crate) fn process_cmd(&self, raw: u64, fds: Option<NotifyFds>) -> NaResult<()> {
        let cmd = CmdHeader::decode(raw)?;
        match cmd.cmd_type {
            CmdType::Reserved => {
                let Some(region) = self.region.clone() else {
                    warn!(pid = cmd.pid, id = cmd.id, "reserve command on endpoint without a region");
                    return Err(NaError::InvalidState);
                };
                // The peer's tx event is what we wait on and vice versa.
                let (tx_notify, rx_notify) = match fds {
                    Some((peer_tx, peer_rx)) => (
                        Some(EventFd::from_owned(peer_rx)),
                        Some(EventFd::from_owned(peer_tx)),
                    ),
                    None => (None, None),
                };
                let (addr_id, addr) = self.addrs.insert(PeerAddr::new(
                    cmd.pid,
                    cmd.id,
                    cmd.pair_idx,
                    Some(region),
                    AddrRole::Unexpected,
                    tx_notify,
                    rx_notify,
                ));
                if let Err(err) = self.register_rx(addr_id, &addr) {
                    self.addrs.remove(addr_id);
                    return Err(err);
                }
                self.addrs.poll_push_front(addr_id);
                info!(pid = cmd.pid, id = cmd.id, pair = cmd.pair_idx, addr = %addr_id, "accepted peer");
            }
            CmdType::Released => match self.addrs.poll_find(cmd.pair_idx, cmd.pid, cmd.id) {
                Some((addr_id, addr)) => {
                    debug!(pid = cmd.pid, id = cmd.id, pair = cmd.pair_idx, "peer released pair");
                    self.release_addr(addr_id, &addr);
                }
                None => {
                    debug!(pid = cmd.pid, id = cmd.id, pair = cmd.pair_idx, "release for unknown pair");
                }
            },
        }
        Ok(())
    }

    /// Final teardown of an address whose last reference is gone.
    pub(crate) fn addr_destroy(&self, addr: &PeerAddr) {
        if let (Some(poll), Some(rx)) = (&self.poll, &addr.rx_notify) {
            if let Err(err) = poll.remove(rx.as_raw_fd()) {
                warn!(%err, "failed to deregister rx notify");
            }
        }

        match addr.role {
            AddrRole::Unexpected => {
                if let Some(region) = &addr.region {
                    region.layout().release_pair(addr.pair_idx);
                }
            }
            AddrRole::Lookup => {
                let cmd = CmdHeader {
                    cmd_type: CmdType::Released,
                    pid: self.pid,
                    id: self.id,
                    pair_idx: addr.pair_idx,
                };
                match (&self.sock, self.config.progress_mode) {
                    (Some(sock), ProgressMode::Blocking) => {
                        let sent = naming::sock_path(
                            &self.config.tmp_dir,
                            &self.config.prefix,
                            &self.username,
                            addr.pid,
                            addr.id,
                        )
                        .and_then(|dest| sock.send_cmd(&dest, cmd.encode(), None));
                        if let Err(err) = sent {
                            debug!(pid = addr.pid, id = addr.id, %err, "could not notify peer of release");
                        }
                    }
                    _ => {
                        let pushed = addr
                            .region
                            .as_ref()
                            .is_some_and(|region| region.layout().cmd_queue.push(cmd.encode()));
                        if !pushed {
                            warn!(pid = addr.pid, id = addr.id, "could not queue release command");
                        }
                    }
                }
            }
            AddrRole::Source => {}
        }
        debug!(pid = addr.pid, id = addr.id, role = ?addr.role, "destroyed address");
    }
}
