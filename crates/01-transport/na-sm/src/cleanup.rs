use std::fs;
use std::io;

use sm_transport::naming;
use tracing::{debug, info, warn};

use crate::config::SmConfig;
use crate::error::NaResult;

/// Removes sockets and regions left behind by dead processes of this user.
///
/// Deletes the whole socket tree under `tmp_dir` and every entry of `shm_dir`
/// named `{prefix}_{user}-…`. Individual failures are logged and skipped.
pub fn cleanup(config: &SmConfig) -> NaResult<()> {
    let user = config.resolve_username()?;

    let root = naming::sock_root(&config.tmp_dir, &config.prefix, &user);
    match fs::remove_dir_all(&root) {
        Ok(()) => info!(path = %root.display(), "removed socket tree"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %root.display(), %err, "failed to remove socket tree"),
    }

    let stem = format!("{}_{}-", config.prefix, user);
    let entries = match fs::read_dir(&config.shm_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %config.shm_dir.display(), %err, "cannot scan shared memory directory");
            return Ok(());
        }
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(&stem) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale region"),
            Err(err) => warn!(path = %path.display(), %err, "failed to remove stale region"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_only_matching_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let shm = tempfile::tempdir().unwrap();
        let config = SmConfig {
            username: Some("bob".into()),
            tmp_dir: tmp.path().to_owned(),
            shm_dir: shm.path().to_owned(),
            ..SmConfig::default()
        };

        let sock_dir = tmp.path().join("na_sm_bob").join("42").join("0");
        fs::create_dir_all(&sock_dir).unwrap();
        fs::write(sock_dir.join("sock"), b"").unwrap();
        fs::write(shm.path().join("na_sm_bob-42-0"), b"").unwrap();
        fs::write(shm.path().join("na_sm_bobby-42-0"), b"").unwrap();
        fs::write(shm.path().join("other"), b"").unwrap();

        cleanup(&config).unwrap();
        assert!(!tmp.path().join("na_sm_bob").exists());
        assert!(!shm.path().join("na_sm_bob-42-0").exists());
        assert!(shm.path().join("na_sm_bobby-42-0").exists(), "other users are left alone");
        assert!(shm.path().join("other").exists());

        cleanup(&config).expect("cleanup is idempotent");
    }
}
