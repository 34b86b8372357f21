use std::ffi::CStr;
use std::path::PathBuf;

use crate::error::{NaError, NaResult};

/// How the endpoint waits for peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// Poll set, event descriptors and a rendezvous socket.
    #[default]
    Blocking,
    /// No descriptors; handshakes go through the peer's command ring.
    NoBlock,
}

#[derive(Debug, Clone)]
pub struct SmConfig {
    /// Create a shared region and accept incoming peers.
    pub listen: bool,
    pub progress_mode: ProgressMode,
    /// Overrides the effective user's login name in generated names.
    pub username: Option<String>,
    pub prefix: String,
    pub tmp_dir: PathBuf,
    pub shm_dir: PathBuf,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            listen: false,
            progress_mode: ProgressMode::Blocking,
            username: None,
            prefix: "na_sm".to_owned(),
            tmp_dir: PathBuf::from("/tmp"),
            shm_dir: PathBuf::from("/dev/shm"),
        }
    }
}

impl SmConfig {
    /// Configured username, falling back to the effective user's login name.
    pub fn resolve_username(&self) -> NaResult<String> {
        match &self.username {
            Some(name) => Ok(name.clone()),
            None => effective_username(),
        }
    }
}

fn effective_username() -> NaResult<String> {
    let mut buf = vec![0 as libc::c_char; 1024];
    // SAFETY: all-zero passwd is a valid output slot.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        // SAFETY: `buf`, `pwd` and `result` are live for the call.
        let rc = unsafe {
            libc::getpwuid_r(
                libc::geteuid(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < 1 << 16 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(NaError::from_errno(rc));
        }
        break;
    }
    if result.is_null() {
        return Err(NaError::NoEntry);
    }
    // SAFETY: getpwuid_r succeeded, so `pw_name` points into `buf`.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Ok(name.to_string_lossy().into_owned())
}
