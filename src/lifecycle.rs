//! Startup/shutdown lifecycle (spec §1.1, §4.H): PID lock acquisition with
//! stale-lock reclamation, socket bind-after-validate, graceful teardown.
//!
//! The lock-first-then-bind-last ordering and the "don't clean up what you
//! don't own" failure handling are grounded in the daemon lifecycle pattern
//! from `oddjobs`'s `crates/daemon/src/lifecycle.rs` (`startup_inner`); that
//! example relies on `fs2::try_lock_exclusive` alone to settle ownership.
//! This engine additionally probes the PID found in an already-locked file
//! via `libc::kill(pid, 0)`, since flock semantics on some platforms release
//! silently on process crash without a concurrent locker around to observe it.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;

pub struct DaemonHandle {
    pub lock_file: File,
    pub lock_path: PathBuf,
    pub socket_path: PathBuf,
}

/// Acquires the single-instance PID lock, reclaiming it if the PID inside
/// belongs to a dead process, then binds the socket. Ordered per §1.1: lock
/// first (settles ownership), directories next, bind last (only once
/// everything else has validated).
pub async fn startup(lock_path: &Path, socket_path: &Path) -> Result<(DaemonHandle, UnixListener)> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).context("creating state directory")?;
    }

    let lock_file = acquire_lock(lock_path)?;

    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent).context("creating socket directory")?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path).context("removing stale socket")?;
    }

    let std_listener =
        StdUnixListener::bind(socket_path).with_context(|| format!("binding {socket_path:?}"))?;
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;

    Ok((
        DaemonHandle {
            lock_file,
            lock_path: lock_path.to_path_buf(),
            socket_path: socket_path.to_path_buf(),
        },
        listener,
    ))
}

fn acquire_lock(lock_path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("opening {lock_path:?}"))?;

    if file.try_lock_exclusive().is_err() {
        if is_stale(&mut file) {
            crate::logging::warn(&format!(
                "reclaiming stale lock at {lock_path:?} (owner process is gone)"
            ));
            file.try_lock_exclusive()
                .context("reclaiming stale lock failed unexpectedly")?;
        } else {
            bail!("another clai-engine instance is already running ({lock_path:?} is locked)");
        }
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

/// Reads the PID recorded in an exclusively-locked-by-someone-else file and
/// probes it with a signal-0 `kill` — delivers no signal, just checks
/// existence/permission (a dead PID, or one since reused by an unrelated
/// process outside our permission, both read as "not alive" here; the latter
/// is an acceptable false negative, matching typical PID-lock daemon practice).
fn is_stale(file: &mut File) -> bool {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() {
        return false;
    }
    let pid: libc::pid_t = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => return false,
    };
    let alive = unsafe { libc::kill(pid, 0) == 0 };
    !alive
}

/// Flushes, removes the socket, and removes the lock file. Called on
/// `shutdown{}`, SIGINT/SIGTERM, or idle timeout — never on a failed lock
/// acquisition, since those files belong to the daemon that is still running.
pub fn shutdown(handle: &DaemonHandle) {
    if let Err(e) = fs::remove_file(&handle.socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            crate::logging::warn(&format!("failed to remove socket: {e}"));
        }
    }
    FileExt::unlock(&handle.lock_file).ok();
    if let Err(e) = fs::remove_file(&handle.lock_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            crate::logging::warn(&format!("failed to remove lock file: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn startup_binds_socket_and_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("clai.lock");
        let socket_path = dir.path().join("clai.sock");

        let (handle, _listener) = startup(&lock_path, &socket_path).await.unwrap();
        let contents = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        assert!(socket_path.exists());

        shutdown(&handle);
        assert!(!socket_path.exists());
        assert!(!lock_path.exists());
    }

    #[test]
    fn stale_lock_with_garbage_pid_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("clai.lock");
        fs::write(&lock_path, "not-a-pid\n").unwrap();
        let mut file = OpenOptions::new().read(true).open(&lock_path).unwrap();
        assert!(!is_stale(&mut file));
    }
}
