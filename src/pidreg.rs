//! PID Registry: pure functions over the filesystem (spec §4.1).
//!
//! No shared memory; the supervisor learns everything about a worker's
//! identity and liveness by looking at `<pid_dir>/<kind>-<slot>.pid`.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::HadcError;

/// The three states a worker's pid file basename can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Transient: written between fork and first lock acquisition.
    Unknown,
    Standby,
    Main,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Unknown => "unknown",
            Kind::Standby => "standby",
            Kind::Main => "main",
        };
        write!(f, "{s}")
    }
}

/// Path for `<kind>-<slot>.pid` (or `unknown-<pid>.pid` when slot doubles
/// as the raw process id, per spec §4.3 step 2).
pub fn pid_path(pid_dir: &Path, kind: Kind, slot: u32) -> PathBuf {
    pid_dir.join(format!("{kind}-{slot}.pid"))
}

/// Create-or-truncate, write the PID as decimal text, close. Fatal on I/O error.
pub fn write_pid(path: &Path, pid: i32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| HadcError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| HadcError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    write!(file, "{pid}").map_err(|source| HadcError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Read the PID stored at `path`. `None` if the file doesn't exist or is
/// unparseable garbage left by a crashed writer mid-write.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse::<i32>().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(HadcError::Io {
            path: path.to_path_buf(),
            source,
        }
        .into()),
    }
}

/// Atomic rename of a pid file as a worker transitions identity
/// (unknown -> standby -> main). Fatal on failure; must be same filesystem.
pub fn rename_pid(old: &Path, new: &Path) -> Result<()> {
    fs::rename(old, new).map_err(|source| {
        HadcError::Io {
            path: new.to_path_buf(),
            source,
        }
        .into()
    })
}

/// No-op when the file is already absent.
pub fn unlink_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(HadcError::Io {
            path: path.to_path_buf(),
            source,
        }
        .into()),
    }
}

/// `kill(pid, 0)` liveness probe. Success => running. `ESRCH` => not
/// running. `EPERM` => running (owned by another uid; we can't signal it
/// but it exists) with a caller-surfaced warning. Any other errno is fatal.
#[cfg(unix)]
pub fn is_alive(pid: i32) -> Result<bool> {
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return Ok(true);
    }
    let errno = std::io::Error::last_os_error();
    match errno.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => {
            tracing::warn!(pid, "kill(pid, 0) returned EPERM — process exists but we lack privileges to signal it");
            Ok(true)
        }
        other => Err(HadcError::Signal {
            pid,
            reason: format!("kill(.., 0) liveness probe failed unexpectedly: errno {other:?}"),
        }
        .into()),
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: i32) -> Result<bool> {
    anyhow::bail!("process liveness probing requires a unix target")
}

/// Read the pid file for `kind-slot`. Returns `None` if absent or the PID
/// it names is not live (spec §3 invariant 4: stale pid files read as absent).
pub fn pid_of(pid_dir: &Path, kind: Kind, slot: u32) -> Result<Option<i32>> {
    let path = pid_path(pid_dir, kind, slot);
    match read_pid(&path)? {
        Some(pid) if is_alive(pid)? => Ok(Some(pid)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    #[test]
    fn write_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("main-1.pid");
        write_pid(&path, 4242).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(4242));
    }

    #[test]
    fn read_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("main-1.pid");
        assert_eq!(read_pid(&path).unwrap(), None);
    }

    #[test]
    fn rename_moves_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("unknown-1.pid");
        let new = tmp.path().join("standby-1.pid");
        write_pid(&old, 1).unwrap();
        rename_pid(&old, &new).unwrap();
        assert!(!old.exists());
        assert_eq!(read_pid(&new).unwrap(), Some(1));
    }

    #[test]
    fn unlink_missing_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ghost.pid");
        unlink_if_present(&path).unwrap();
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(process::id() as i32).unwrap());
    }

    #[test]
    fn bogus_pid_is_not_alive() {
        assert!(!is_alive(i32::MAX - 1).unwrap());
    }

    #[test]
    fn pid_of_treats_stale_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        write_pid(&pid_path(tmp.path(), Kind::Main, 1), i32::MAX - 1).unwrap();
        assert_eq!(pid_of(tmp.path(), Kind::Main, 1).unwrap(), None);
    }

    #[test]
    fn pid_of_finds_live_pid() {
        let tmp = tempfile::tempdir().unwrap();
        write_pid(&pid_path(tmp.path(), Kind::Main, 1), process::id() as i32).unwrap();
        assert_eq!(
            pid_of(tmp.path(), Kind::Main, 1).unwrap(),
            Some(process::id() as i32)
        );
    }
}
