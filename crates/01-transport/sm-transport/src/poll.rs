//! Thin `epoll(7)` wrapper keyed by caller-chosen tokens.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use smallvec::SmallVec;

use crate::error::{TransportError, TransportResult};

/// Most events returned by one wait.
pub const MAX_EVENTS: usize = 16;

pub type Ready = SmallVec<[u64; MAX_EVENTS]>;

#[derive(Debug)]
pub struct PollSet {
    epfd: OwnedFd,
}

impl PollSet {
    pub fn new() -> TransportResult<Self> {
        // SAFETY: plain syscall; the result is checked.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(TransportError::last_os_error("epoll_create1"));
        }
        // SAFETY: fresh descriptor owned only by us.
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Watches `fd` for readability, reporting `token` when it fires.
    pub fn add(&self, fd: RawFd, token: u64) -> TransportResult<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: `event` outlives the call.
        let rc = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if rc < 0 {
            return Err(TransportError::last_os_error("epoll_ctl"));
        }
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> TransportResult<()> {
        // SAFETY: a null event is accepted for EPOLL_CTL_DEL.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(TransportError::last_os_error("epoll_ctl"));
        }
        Ok(())
    }

    /// Waits up to `timeout` and returns the tokens of ready descriptors.
    /// An interrupted wait returns no tokens.
    pub fn wait(&self, timeout: Duration) -> TransportResult<Ready> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: `events` holds MAX_EVENTS entries.
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                millis,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Ready::new());
            }
            return Err(TransportError::os("epoll_wait", err));
        }
        Ok(events[..rc as usize].iter().map(|e| e.u64).collect())
    }
}

impl AsRawFd for PollSet {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFd;

    #[test]
    fn reports_token_of_signalled_event() {
        let poll = PollSet::new().expect("epoll");
        let a = EventFd::new().expect("eventfd");
        let b = EventFd::new().expect("eventfd");
        poll.add(a.as_raw_fd(), 11).expect("add a");
        poll.add(b.as_raw_fd(), 22).expect("add b");

        assert!(poll.wait(Duration::ZERO).expect("wait").is_empty());

        b.set().expect("set");
        let ready = poll.wait(Duration::from_millis(100)).expect("wait");
        assert_eq!(ready.as_slice(), &[22]);

        poll.remove(b.as_raw_fd()).expect("remove");
        assert!(poll.wait(Duration::ZERO).expect("wait").is_empty());
    }
}
