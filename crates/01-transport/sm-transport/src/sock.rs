//! Rendezvous socket: a non-blocking Unix datagram socket carrying one packed
//! command header per datagram, optionally with two descriptors attached as
//! `SCM_RIGHTS` ancillary data.

use std::fs::{self, DirBuilder};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// Descriptors attached to a command: `(tx notify, rx notify)`.
pub type NotifyFds = (OwnedFd, OwnedFd);

#[derive(Debug)]
struct Bound {
    path: PathBuf,
    root: PathBuf,
}

#[derive(Debug)]
pub struct RendezvousSock {
    sock: UnixDatagram,
    bound: Option<Bound>,
}

impl RendezvousSock {
    /// Binds at `path`, creating missing parent directories. On close, the
    /// socket file and any emptied directories are removed back up to `root`.
    pub fn bind(path: &Path, root: &Path) -> TransportResult<Self> {
        if let Some(dir) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o775)
                .create(dir)
                .map_err(|source| TransportError::os("mkdir", source))?;
        }
        let sock =
            UnixDatagram::bind(path).map_err(|source| TransportError::os("bind", source))?;
        sock.set_nonblocking(true)
            .map_err(|source| TransportError::os("fcntl", source))?;
        debug!(path = %path.display(), "bound rendezvous socket");
        Ok(Self {
            sock,
            bound: Some(Bound {
                path: path.to_owned(),
                root: root.to_owned(),
            }),
        })
    }

    /// Creates a send-only socket.
    pub fn unbound() -> TransportResult<Self> {
        let sock =
            UnixDatagram::unbound().map_err(|source| TransportError::os("socket", source))?;
        sock.set_nonblocking(true)
            .map_err(|source| TransportError::os("fcntl", source))?;
        Ok(Self { sock, bound: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.bound.as_ref().map(|b| b.path.as_path())
    }

    /// Sends `cmd` to the socket bound at `dest`.
    pub fn send_cmd(
        &self,
        dest: &Path,
        cmd: u64,
        fds: Option<(BorrowedFd<'_>, BorrowedFd<'_>)>,
    ) -> TransportResult<()> {
        let (mut addr, addr_len) = sockaddr_un(dest)?;
        let mut payload = cmd;
        let mut iov = libc::iovec {
            iov_base: (&mut payload as *mut u64).cast(),
            iov_len: mem::size_of::<u64>(),
        };
        let mut control = [0u64; 8];

        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = (&mut addr as *mut libc::sockaddr_un).cast();
        msg.msg_namelen = addr_len;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if let Some((tx, rx)) = fds {
            let fd_bytes = (2 * mem::size_of::<RawFd>()) as u32;
            // SAFETY: `control` is 64 bytes, enough for one two-descriptor
            // cmsg, and outlives the sendmsg call.
            unsafe {
                msg.msg_control = control.as_mut_ptr().cast();
                msg.msg_controllen = libc::CMSG_SPACE(fd_bytes) as _;
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes) as _;
                let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
                data.write_unaligned(tx.as_raw_fd());
                data.add(1).write_unaligned(rx.as_raw_fd());
            }
        }

        // SAFETY: every pointer in `msg` refers to a live local.
        let rc = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msg, 0) };
        if rc < 0 {
            return Err(TransportError::last_os_error("sendmsg"));
        }
        Ok(())
    }

    /// Receives one pending command, if any.
    pub fn recv_cmd(&self) -> TransportResult<Option<(u64, Option<NotifyFds>)>> {
        let mut payload: u64 = 0;
        let mut iov = libc::iovec {
            iov_base: (&mut payload as *mut u64).cast(),
            iov_len: mem::size_of::<u64>(),
        };
        let mut control = [0u64; 8];

        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        // SAFETY: `msg` points at live locals sized as declared.
        let rc = unsafe { libc::recvmsg(self.sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(TransportError::os("recvmsg", err));
        }

        let mut fds: SmallVec<[OwnedFd; 2]> = SmallVec::new();
        // SAFETY: the kernel filled `control`; the CMSG_* helpers walk it
        // within `msg_controllen`.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / mem::size_of::<RawFd>();
                    for i in 0..count {
                        fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if rc as usize != mem::size_of::<u64>() {
            return Err(TransportError::os(
                "recvmsg",
                io::Error::new(io::ErrorKind::InvalidData, "truncated command datagram"),
            ));
        }

        let notify = match fds.len() {
            2 => {
                let rx = fds.pop();
                let tx = fds.pop();
                tx.zip(rx)
            }
            0 => None,
            n => {
                warn!(count = n, "dropping unexpected descriptor count");
                None
            }
        };
        Ok(Some((payload, notify)))
    }

    /// Closes the socket and removes its path.
    pub fn close(mut self) -> TransportResult<()> {
        match self.bound.take() {
            Some(bound) => remove_bound(&bound),
            None => Ok(()),
        }
    }
}

impl AsRawFd for RendezvousSock {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl Drop for RendezvousSock {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.take() {
            if let Err(err) = remove_bound(&bound) {
                warn!(path = %bound.path.display(), %err, "failed to remove rendezvous socket");
            }
        }
    }
}

fn remove_bound(bound: &Bound) -> TransportResult<()> {
    debug!(path = %bound.path.display(), "removing rendezvous socket");
    fs::remove_file(&bound.path).map_err(|source| TransportError::os("unlink", source))?;
    let mut dir = bound.path.parent();
    while let Some(current) = dir {
        if current == bound.root || !current.starts_with(&bound.root) {
            break;
        }
        // Stops at the first directory still used by another socket.
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}

fn sockaddr_un(path: &Path) -> TransportResult<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: an all-zero sockaddr_un is valid.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(TransportError::NameTooLong {
            name: path.display().to_string(),
            limit: addr.sun_path.len() - 1,
        });
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFd;
    use std::os::fd::AsFd;

    #[test]
    fn command_with_descriptors_crosses_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("na_sm_test");
        let path = root.join("10").join("0").join("sock");
        let server = RendezvousSock::bind(&path, dir.path()).expect("bind");
        let client = RendezvousSock::unbound().expect("client");

        let tx = EventFd::new().expect("tx");
        let rx = EventFd::new().expect("rx");
        client
            .send_cmd(&path, 0x0001_0203_0000_002a, Some((tx.as_fd(), rx.as_fd())))
            .expect("send");

        let (cmd, fds) = server.recv_cmd().expect("recv").expect("pending command");
        assert_eq!(cmd, 0x0001_0203_0000_002a);
        let (tx_peer, rx_peer) = fds.expect("descriptors attached");

        EventFd::from_owned(tx_peer).set().expect("set via received fd");
        assert!(tx.get().expect("get"), "received tx fd aliases the sender's event");
        EventFd::from_owned(rx_peer).set().expect("set");
        assert!(rx.get().expect("get"));

        assert!(server.recv_cmd().expect("recv").is_none(), "queue drained");
    }

    #[test]
    fn command_without_descriptors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a").join("sock");
        let server = RendezvousSock::bind(&path, dir.path()).expect("bind");
        let client = RendezvousSock::unbound().expect("client");
        client.send_cmd(&path, 77, None).expect("send");
        assert_eq!(server.recv_cmd().expect("recv").map(|(c, f)| (c, f.is_none())), Some((77, true)));
    }

    #[test]
    fn close_removes_socket_and_empty_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("na_sm_u").join("5").join("1").join("sock");
        let sibling = dir.path().join("na_sm_u").join("5").join("2").join("sock");
        let a = RendezvousSock::bind(&path, dir.path()).expect("bind a");
        let b = RendezvousSock::bind(&sibling, dir.path()).expect("bind b");

        a.close().expect("close a");
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists(), "id dir removed");
        assert!(sibling.exists(), "shared parents kept while in use");

        drop(b);
        assert!(!dir.path().join("na_sm_u").exists(), "all dirs removed");
        assert!(dir.path().exists(), "root is never removed");
    }

    #[test]
    fn send_to_missing_peer_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = RendezvousSock::unbound().expect("client");
        let err = client
            .send_cmd(&dir.path().join("nobody"), 1, None)
            .expect_err("no listener");
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
