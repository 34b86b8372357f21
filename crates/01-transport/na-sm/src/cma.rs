//! Cross-process memory copy capability used by put/get.

use std::io;

use crate::rma::Segment;

/// Copies between local memory and another process's address space.
pub trait CrossProcessCopy: Send + Sync {
    /// Writes `local` into `remote` of process `pid`; returns bytes moved.
    fn write(&self, pid: u32, local: &[Segment], remote: &[Segment]) -> io::Result<usize>;
    /// Reads `remote` of process `pid` into `local`; returns bytes moved.
    fn read(&self, pid: u32, local: &[Segment], remote: &[Segment]) -> io::Result<usize>;
}

/// `process_vm_writev(2)` / `process_vm_readv(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessVmCopy;

fn iovecs(segments: &[Segment]) -> Vec<libc::iovec> {
    segments
        .iter()
        .map(|s| libc::iovec {
            iov_base: s.base as *mut libc::c_void,
            iov_len: s.len,
        })
        .collect()
}

impl CrossProcessCopy for ProcessVmCopy {
    fn write(&self, pid: u32, local: &[Segment], remote: &[Segment]) -> io::Result<usize> {
        let local = iovecs(local);
        let remote = iovecs(remote);
        // SAFETY: the iovec arrays are live for the call; the kernel checks
        // the remote ranges and only reads the local ones.
        let rc = unsafe {
            libc::process_vm_writev(
                pid as libc::pid_t,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn read(&self, pid: u32, local: &[Segment], remote: &[Segment]) -> io::Result<usize> {
        let local = iovecs(local);
        let remote = iovecs(remote);
        // SAFETY: as above; the local ranges are writable memory described by
        // the caller's handle.
        let rc = unsafe {
            libc::process_vm_readv(
                pid as libc::pid_t,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}
