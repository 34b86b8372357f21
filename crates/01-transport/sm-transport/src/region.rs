//! Named shared-memory regions.
//!
//! A region is a file of exactly [`RegionLayout::SIZE`] bytes under the shm
//! directory (normally `/dev/shm`), mapped shared into every process that
//! talks to its owner. The creating process initialises the layout and is the
//! only one that unlinks the name again.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::layout::RegionLayout;

#[derive(Debug)]
enum Backing {
    Named { path: PathBuf, owner: AtomicBool },
    Anonymous,
}

/// A mapped region holding one [`RegionLayout`].
#[derive(Debug)]
pub struct SharedRegion {
    name: String,
    map: MmapMut,
    backing: Backing,
}

impl SharedRegion {
    /// Maps `dir/name`. With `create` the object is created (or truncated),
    /// sized and initialised, and this handle becomes its owner.
    pub fn open(dir: &Path, name: &str, create: bool) -> TransportResult<Self> {
        let path = dir.join(name);
        let map_err = |source| TransportError::Map {
            name: name.to_owned(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .mode(0o600)
            .open(&path)
            .map_err(map_err)?;

        if create {
            file.set_len(RegionLayout::SIZE as u64).map_err(map_err)?;
        } else {
            let actual = file.metadata().map_err(map_err)?.len() as usize;
            if actual != RegionLayout::SIZE {
                return Err(TransportError::RegionSize {
                    expected: RegionLayout::SIZE,
                    actual,
                });
            }
        }

        // SAFETY: the file stays sized to the layout for the lifetime of the
        // mapping; every process only touches it through atomics and the
        // per-buffer spinlocks.
        let map = unsafe { MmapOptions::new().len(RegionLayout::SIZE).map_mut(&file) }
            .map_err(map_err)?;
        debug!(name, create, size = RegionLayout::SIZE, "mapped shared region");

        let region = Self {
            name: name.to_owned(),
            map,
            backing: Backing::Named {
                path,
                owner: AtomicBool::new(create),
            },
        };
        if create {
            region.layout().init();
        }
        Ok(region)
    }

    /// Maps a private, initialised region with no name. Used by tests and
    /// single-process setups.
    pub fn anonymous() -> TransportResult<Self> {
        let map = MmapOptions::new()
            .len(RegionLayout::SIZE)
            .map_anon()
            .map_err(|source| TransportError::Map {
                name: "<anonymous>".to_owned(),
                source,
            })?;
        let region = Self {
            name: String::new(),
            map,
            backing: Backing::Anonymous,
        };
        region.layout().init();
        Ok(region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &RegionLayout {
        // SAFETY: the mapping is page aligned, exactly `RegionLayout::SIZE`
        // bytes long and lives as long as `self`. The layout contains only
        // atomics and lock-guarded cells, so shared access is sound.
        unsafe { &*(self.map.as_ptr() as *const RegionLayout) }
    }

    /// Removes the backing name if this handle owns it. The mapping stays
    /// valid until the handle is dropped.
    pub fn unlink(&self) -> TransportResult<()> {
        if let Backing::Named { path, owner } = &self.backing {
            if owner.swap(false, Ordering::AcqRel) {
                debug!(name = %self.name, "unlinking shared region");
                fs::remove_file(path).map_err(|source| TransportError::os("unlink", source))?;
            }
        }
        Ok(())
    }

    /// Unmaps the region, unlinking it first when `unlink` is set.
    pub fn close(self, unlink: bool) -> TransportResult<()> {
        if unlink {
            self.unlink()?;
        } else if let Backing::Named { owner, .. } = &self.backing {
            owner.store(false, Ordering::Release);
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(err) = self.unlink() {
            warn!(name = %self.name, %err, "failed to unlink shared region");
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_shares_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let owner = SharedRegion::open(dir.path(), "na_sm_test-1-0", true).expect("create");
        let peer = SharedRegion::open(dir.path(), "na_sm_test-1-0", false).expect("open");

        let idx = peer.layout().reserve_pair().expect("pair");
        assert!(peer.layout().pair(idx).tx.push(0xabc));
        assert_eq!(owner.layout().pair(idx).tx.pop(), Some(0xabc));
        assert_eq!(owner.layout().available_pairs(), 255);
    }

    #[test]
    fn owner_drop_unlinks_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("na_sm_test-2-0");
        {
            let _owner = SharedRegion::open(dir.path(), "na_sm_test-2-0", true).expect("create");
            let peer = SharedRegion::open(dir.path(), "na_sm_test-2-0", false).expect("open");
            drop(peer);
            assert!(path.exists(), "non-owner drop must not unlink");
        }
        assert!(!path.exists(), "owner drop should unlink");
    }

    #[test]
    fn open_missing_region_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SharedRegion::open(dir.path(), "absent", false).expect_err("missing region");
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn size_mismatch_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("short"), [0u8; 16]).expect("write");
        match SharedRegion::open(dir.path(), "short", false) {
            Err(TransportError::RegionSize { actual, .. }) => assert_eq!(actual, 16),
            other => panic!("expected size mismatch, got {other:?}"),
        }
    }

    #[test]
    fn close_without_unlink_keeps_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let region = SharedRegion::open(dir.path(), "kept", true).expect("create");
        region.close(false).expect("close");
        assert!(dir.path().join("kept").exists());
    }
}
