//! Single-writer lock for the state file, held through a Unix socket.
//!
//! The daemon and the offline admin commands both write the registry's state
//! file. Whoever holds the lock owns the file; the other side is refused. The
//! OS releases the socket when the process dies, so a crash never leaves a
//! stale lock behind.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceLockError {
    /// Another process owns the state file.
    #[error("state file is in use by another bridge process (socket {0:?})")]
    AlreadyRunning(PathBuf),

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock the state file at `store_path`.
    pub fn acquire(store_path: &Path) -> Result<Self, InstanceLockError> {
        let path = Self::socket_path(store_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            // A live owner accepts connections; a dead one left a stale socket
            if UnixStream::connect(&path).is_ok() {
                return Err(InstanceLockError::AlreadyRunning(path));
            }
            let _ = std::fs::remove_file(&path);
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                Err(InstanceLockError::AlreadyRunning(path))
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    /// Socket next to the state file: `state.json` → `state.lock`.
    pub fn socket_path(store_path: &Path) -> PathBuf {
        store_path.with_extension("lock")
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_sits_next_to_state_file() {
        assert_eq!(
            InstanceLock::socket_path(Path::new("/var/lib/hw/state.json")),
            PathBuf::from("/var/lib/hw/state.lock")
        );
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("state.json");

        let lock = InstanceLock::acquire(&store).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&store),
            Err(InstanceLockError::AlreadyRunning(_))
        ));

        drop(lock);
        assert!(!InstanceLock::socket_path(&store).exists());
        assert!(InstanceLock::acquire(&store).is_ok());
    }
}
