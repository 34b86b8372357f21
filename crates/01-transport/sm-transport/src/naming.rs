//! Deterministic names for regions and rendezvous sockets.

use std::path::{Path, PathBuf};

use crate::error::{TransportError, TransportResult};

/// Longest shm object name or socket directory accepted.
pub const MAX_FILENAME: usize = 64;
/// File name of the rendezvous socket inside its directory.
pub const SOCK_NAME: &str = "sock";
/// Capacity of `sockaddr_un::sun_path`, terminator included.
const SUN_PATH_MAX: usize = 108;

/// `{prefix}_{user}-{pid}-{id}`.
pub fn shm_name(prefix: &str, user: &str, pid: u32, id: u8) -> TransportResult<String> {
    let name = format!("{prefix}_{user}-{pid}-{id}");
    check_len(name, MAX_FILENAME)
}

/// `{tmp}/{prefix}_{user}`: root shared by every socket of one user.
pub fn sock_root(tmp_dir: &Path, prefix: &str, user: &str) -> PathBuf {
    tmp_dir.join(format!("{prefix}_{user}"))
}

/// `{tmp}/{prefix}_{user}/{pid}/{id}`.
pub fn sock_dir(
    tmp_dir: &Path,
    prefix: &str,
    user: &str,
    pid: u32,
    id: u8,
) -> TransportResult<PathBuf> {
    let dir = sock_root(tmp_dir, prefix, user)
        .join(pid.to_string())
        .join(id.to_string());
    let checked = check_len(dir.to_string_lossy().into_owned(), MAX_FILENAME)?;
    Ok(PathBuf::from(checked))
}

/// Full socket path, checked against the `sun_path` limit.
pub fn sock_path(
    tmp_dir: &Path,
    prefix: &str,
    user: &str,
    pid: u32,
    id: u8,
) -> TransportResult<PathBuf> {
    let path = sock_dir(tmp_dir, prefix, user, pid, id)?.join(SOCK_NAME);
    let checked = check_len(path.to_string_lossy().into_owned(), SUN_PATH_MAX - 1)?;
    Ok(PathBuf::from(checked))
}

fn check_len(name: String, limit: usize) -> TransportResult<String> {
    if name.len() > limit {
        return Err(TransportError::NameTooLong { name, limit });
    }
    Ok(name)
}
