//! Notification events backed by `eventfd(2)`.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{TransportError, TransportResult};

/// Non-blocking counter descriptor used purely as a wakeup signal.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> TransportResult<Self> {
        // SAFETY: plain syscall; the returned descriptor is checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(TransportError::last_os_error("eventfd"));
        }
        // SAFETY: `fd` is a fresh descriptor owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adopts a descriptor received from a peer.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Signals the event.
    pub fn set(&self) -> TransportResult<()> {
        let one: u64 = 1;
        // SAFETY: writes eight bytes from a live local.
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the peer is already signalled.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(TransportError::os("write", err));
        }
        Ok(())
    }

    /// Consumes the event; `false` when it was not signalled.
    pub fn get(&self) -> TransportResult<bool> {
        let mut count: u64 = 0;
        // SAFETY: reads eight bytes into a live local.
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut count as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(TransportError::os("read", err));
        }
        Ok(count > 0)
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_consumes_once() {
        let event = EventFd::new().expect("eventfd");
        assert!(!event.get().expect("get"), "fresh event is not signalled");
        event.set().expect("set");
        event.set().expect("set");
        assert!(event.get().expect("get"));
        assert!(!event.get().expect("get"), "reading clears the counter");
    }

    #[test]
    fn duplicated_descriptor_sees_signal() {
        let event = EventFd::new().expect("eventfd");
        let dup = EventFd::from_owned(event.as_fd().try_clone_to_owned().expect("dup"));
        dup.set().expect("set");
        assert!(event.get().expect("get"));
    }
}
