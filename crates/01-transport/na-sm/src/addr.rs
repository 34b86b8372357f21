//! Peer addresses and the endpoint's address table.
//!
//! Addresses live in an arena and are referred to by [`AddrId`]; the map and
//! the poll list only hold ids. Locks are always taken in the order
//! map → arena → poll list.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sm_transport::{CopyBufPool, EventFd, MsgRing, SharedRegion};
use tracing::debug;

use crate::arena::{Arena, Handle};
use crate::error::{NaError, NaResult};

/// Handle to an address owned by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrId(pub(crate) Handle);

impl fmt::Display for AddrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr#{}", self.0)
    }
}

/// How an address came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddrRole {
    /// This endpoint itself.
    Source,
    /// Resolved locally; we reserved a pair in the peer's region.
    Lookup,
    /// A peer reserved a pair in our region; queues are seen inverted.
    Unexpected,
}

pub(crate) struct PeerAddr {
    pub pid: u32,
    pub id: u8,
    pub pair_idx: u8,
    pub region: Option<Arc<SharedRegion>>,
    pub role: AddrRole,
    pub tx_notify: Option<EventFd>,
    pub rx_notify: Option<EventFd>,
    pub ref_count: AtomicU32,
}

impl PeerAddr {
    pub fn new(
        pid: u32,
        id: u8,
        pair_idx: u8,
        region: Option<Arc<SharedRegion>>,
        role: AddrRole,
        tx_notify: Option<EventFd>,
        rx_notify: Option<EventFd>,
    ) -> Self {
        Self {
            pid,
            id,
            pair_idx,
            region,
            role,
            tx_notify,
            rx_notify,
            ref_count: AtomicU32::new(1),
        }
    }

    pub fn key(&self) -> u64 {
        addr_key(self.pid, self.id)
    }

    /// Ring this side sends on.
    pub fn tx_ring(&self) -> Option<&MsgRing> {
        let pair = self.region.as_ref()?.layout().pair(self.pair_idx);
        Some(match self.role {
            AddrRole::Unexpected => &pair.rx,
            AddrRole::Source | AddrRole::Lookup => &pair.tx,
        })
    }

    /// Ring this side receives on.
    pub fn rx_ring(&self) -> Option<&MsgRing> {
        let pair = self.region.as_ref()?.layout().pair(self.pair_idx);
        Some(match self.role {
            AddrRole::Unexpected => &pair.tx,
            AddrRole::Source | AddrRole::Lookup => &pair.rx,
        })
    }

    /// Copy buffers of the region both sides stage payloads in.
    pub fn copy_bufs(&self) -> Option<&CopyBufPool> {
        self.region.as_ref().map(|r| &r.layout().copy_bufs)
    }

    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; `true` when it was the last one.
    pub fn release(&self) -> bool {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "address reference count underflow");
        prev == 1
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerAddr")
            .field("pid", &self.pid)
            .field("id", &self.id)
            .field("pair_idx", &self.pair_idx)
            .field("role", &self.role)
            .field("refs", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) fn addr_key(pid: u32, id: u8) -> u64 {
    (u64::from(pid) << 32) | u64::from(id)
}

/// Parses `sm://<pid>/<id>` or `<pid>/<id>`.
pub(crate) fn parse_addr(name: &str) -> NaResult<(u32, u8)> {
    let rest = name.strip_prefix("sm://").unwrap_or(name);
    let (pid, id) = rest.split_once('/').ok_or(NaError::InvalidArg)?;
    let pid = pid.parse::<u32>().map_err(|_| NaError::InvalidArg)?;
    let id = id.parse::<u8>().map_err(|_| NaError::InvalidArg)?;
    Ok((pid, id))
}

#[derive(Default)]
pub(crate) struct AddrTable {
    map: RwLock<HashMap<u64, AddrId>>,
    arena: RwLock<Arena<PeerAddr>>,
    poll_list: Mutex<VecDeque<AddrId>>,
}

impl AddrTable {
    pub fn get(&self, id: AddrId) -> NaResult<Arc<PeerAddr>> {
        self.arena.read().get(id.0).cloned().ok_or(NaError::InvalidArg)
    }

    /// Inserts an address that is not reachable through the key map.
    pub fn insert(&self, addr: PeerAddr) -> (AddrId, Arc<PeerAddr>) {
        let (handle, addr) = self.arena.write().insert(addr);
        (AddrId(handle), addr)
    }

    /// Returns the address registered under `key` with its count bumped.
    pub fn find(&self, key: u64) -> Option<(AddrId, Arc<PeerAddr>)> {
        let map = self.map.read();
        let id = *map.get(&key)?;
        let addr = self.arena.read().get(id.0).cloned()?;
        addr.acquire();
        Some((id, addr))
    }

    /// Looks `key` up, building the address with `create` when it is missing.
    ///
    /// `create` and `publish` both run under the map write lock, so at most
    /// one address per key is ever built and it becomes visible to other
    /// lookups only once `publish` (poll registration) succeeded. The
    /// returned flag tells whether the address already existed.
    pub fn lookup_or_insert<C, P>(
        &self,
        key: u64,
        create: C,
        publish: P,
    ) -> NaResult<(AddrId, Arc<PeerAddr>, bool)>
    where
        C: FnOnce() -> NaResult<PeerAddr>,
        P: FnOnce(AddrId, &Arc<PeerAddr>) -> NaResult<()>,
    {
        if let Some((id, addr)) = self.find(key) {
            return Ok((id, addr, true));
        }

        let mut map = self.map.write();
        if let Some(&id) = map.get(&key) {
            if let Some(addr) = self.arena.read().get(id.0).cloned() {
                addr.acquire();
                return Ok((id, addr, true));
            }
            return Err(NaError::Exist);
        }

        let addr = create()?;
        debug_assert_eq!(addr.key(), key);
        let (handle, addr) = self.arena.write().insert(addr);
        let id = AddrId(handle);
        if let Err(err) = publish(id, &addr) {
            self.arena.write().remove(handle);
            self.poll_remove(id);
            return Err(err);
        }
        map.insert(key, id);
        debug!(key = format_args!("{key:#x}"), %id, "registered address");
        Ok((id, addr, false))
    }

    /// Detaches an address whose count reached zero. Returns `None` when a
    /// concurrent lookup revived it.
    pub fn unlink(&self, id: AddrId) -> Option<Arc<PeerAddr>> {
        let addr = self.arena.read().get(id.0).cloned()?;
        if addr.role == AddrRole::Lookup {
            let mut map = self.map.write();
            if addr.ref_count.load(Ordering::Acquire) != 0 {
                return None;
            }
            if map.get(&addr.key()) == Some(&id) {
                map.remove(&addr.key());
            }
        }
        let removed = self.arena.write().remove(id.0);
        self.poll_remove(id);
        removed
    }

    pub fn poll_push_front(&self, id: AddrId) {
        self.poll_list.lock().push_front(id);
    }

    pub fn poll_remove(&self, id: AddrId) -> bool {
        let mut list = self.poll_list.lock();
        match list.iter().position(|entry| *entry == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn poll_snapshot(&self) -> Vec<(AddrId, Arc<PeerAddr>)> {
        let ids: Vec<AddrId> = self.poll_list.lock().iter().copied().collect();
        let arena = self.arena.read();
        ids.into_iter()
            .filter_map(|id| arena.get(id.0).cloned().map(|addr| (id, addr)))
            .collect()
    }

    /// Finds a polled unexpected address by pair index and remote identity.
    pub fn poll_find(&self, pair_idx: u8, pid: u32, id: u8) -> Option<(AddrId, Arc<PeerAddr>)> {
        self.poll_snapshot().into_iter().find(|(_, a)| {
            a.role == AddrRole::Unexpected && a.pair_idx == pair_idx && a.pid == pid && a.id == id
        })
    }

    /// Empties the poll list, detaching every address on it.
    pub fn poll_drain(&self) -> Vec<Arc<PeerAddr>> {
        let ids: Vec<AddrId> = self.poll_list.lock().drain(..).collect();
        let mut map = self.map.write();
        let mut arena = self.arena.write();
        ids.into_iter()
            .filter_map(|id| {
                let addr = arena.remove(id.0)?;
                if map.get(&addr.key()) == Some(&id) {
                    map.remove(&addr.key());
                }
                Some(addr)
            })
            .collect()
    }

    pub fn remove(&self, id: AddrId) -> Option<Arc<PeerAddr>> {
        self.arena.write().remove(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(pid: u32, id: u8, role: AddrRole) -> PeerAddr {
        PeerAddr::new(pid, id, 0, None, role, None, None)
    }

    #[test]
    fn parses_both_address_forms() {
        assert_eq!(parse_addr("sm://1234/7").unwrap(), (1234, 7));
        assert_eq!(parse_addr("99/0").unwrap(), (99, 0));
        for bad in ["", "sm://", "sm://12", "12/300", "x/1", "sm://1/2/3"] {
            assert_eq!(parse_addr(bad), Err(NaError::InvalidArg), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn lookup_or_insert_builds_once() {
        let table = AddrTable::default();
        let key = addr_key(10, 1);
        let (first, addr, existed) = table
            .lookup_or_insert(key, || Ok(bare(10, 1, AddrRole::Lookup)), |_, _| Ok(()))
            .unwrap();
        assert!(!existed);
        assert_eq!(addr.ref_count.load(Ordering::Relaxed), 1);

        let (second, again, existed) = table
            .lookup_or_insert(
                key,
                || panic!("must not rebuild an existing address"),
                |_, _| panic!("must not republish"),
            )
            .unwrap();
        assert!(existed);
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&addr, &again));
        assert_eq!(addr.ref_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn failed_create_publishes_nothing() {
        let table = AddrTable::default();
        let key = addr_key(5, 5);
        let err = table
            .lookup_or_insert(key, || Err(NaError::Again), |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err, NaError::Again);
        assert!(table.find(key).is_none());

        let err = table
            .lookup_or_insert(
                key,
                || Ok(bare(5, 5, AddrRole::Lookup)),
                |id, _| {
                    table.poll_push_front(id);
                    Err(NaError::NoDev)
                },
            )
            .unwrap_err();
        assert_eq!(err, NaError::NoDev);
        assert!(table.find(key).is_none(), "unpublished address must not be found");
        assert!(table.poll_snapshot().is_empty());
    }

    #[test]
    fn unlink_clears_map_and_poll_list() {
        let table = AddrTable::default();
        let key = addr_key(3, 2);
        let (id, addr, _) = table
            .lookup_or_insert(key, || Ok(bare(3, 2, AddrRole::Lookup)), |_, _| Ok(()))
            .unwrap();
        table.poll_push_front(id);
        assert!(addr.release());
        assert!(table.unlink(id).is_some());
        assert!(table.find(key).is_none());
        assert!(table.poll_snapshot().is_empty());
        assert_eq!(table.get(id).unwrap_err(), NaError::InvalidArg);
    }

    #[test]
    fn poll_find_matches_pair_and_identity() {
        let table = AddrTable::default();
        let mut a = bare(7, 1, AddrRole::Unexpected);
        a.pair_idx = 4;
        let (id, _) = table.insert(a);
        table.poll_push_front(id);
        assert_eq!(table.poll_find(4, 7, 1).map(|(found, _)| found), Some(id));
        assert!(table.poll_find(5, 7, 1).is_none());
        assert_eq!(table.poll_drain().len(), 1);
        assert!(table.poll_snapshot().is_empty());
    }
}
