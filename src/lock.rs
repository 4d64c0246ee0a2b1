//! Slot Allocator (spec §4.2): a two-level concurrency limiter backed by
//! non-blocking `flock` advisory locks, one numbered lock file per slot
//! under `main/N.lock` or `standby/N.lock`.
//!
//! Grounded in the flock-iteration pattern used for tool concurrency
//! slots elsewhere in the pack (`try_acquire_slot`/`ToolSlot`): open or
//! create each numbered file, try an exclusive non-blocking `flock`, and
//! move to the next index on contention.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Main,
    Standby,
}

/// RAII guard over one held `flock`. Dropping releases the lock by closing
/// the descriptor, unless `into_raw_fd` has been called to hand ownership
/// to a payload that must inherit it across `exec`.
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
    slot: u32,
    kind: SlotKind,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Consume the guard and return the raw fd, clearing `FD_CLOEXEC` so a
    /// subsequent `exec` in the same process inherits the held lock (spec
    /// §4.3 step 4, §9 design note on `HADC_lock_fd`).
    pub fn into_inheritable_raw_fd(mut self) -> Result<RawFd> {
        let file = self.file.take().expect("file present until drop");
        let fd = file.into_raw_fd();
        clear_cloexec(fd).context("failed to clear FD_CLOEXEC on inherited lock fd")?;
        Ok(fd)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Dropping `self.file` closes the fd, which releases the flock.
        // Nothing else to do: lock files persist across worker lifetimes
        // per spec §3, only the lock state (held/not) varies.
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        let ret = libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Try a single non-blocking exclusive flock on `dir/slot.lock`. `Ok(None)`
/// means the slot is already held by someone else; never blocks.
fn try_lock_slot(dir: &Path, slot: u32, kind: SlotKind) -> Result<Option<LockGuard>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create lock directory: {}", dir.display()))?;
    let path = dir.join(format!("{slot}.lock"));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(Some(LockGuard {
            file: Some(file),
            path,
            slot,
            kind,
        }))
    } else {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) | Some(libc::EAGAIN) => Ok(None),
            _ => Err(crate::error::HadcError::LockBackend(format!(
                "flock failed on {}: {err}",
                path.display()
            ))
            .into()),
        }
    }
}

/// Iterate slot ids `1..=max` attempting a non-blocking exclusive lock on
/// each; return the first success.
fn try_acquire_any(dir: &Path, max: u32, kind: SlotKind) -> Result<Option<LockGuard>> {
    for slot in 1..=max {
        if let Some(guard) = try_lock_slot(dir, slot, kind)? {
            return Ok(Some(guard));
        }
    }
    Ok(None)
}

/// Decision returned by the per-attempt hook (spec §9: "coroutine-style
/// retries" modeled as a first-class callback, no green threads needed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Stop,
}

/// Context passed to the hook before each retry round. The standby slot id
/// is passed explicitly rather than via a closure capturing the allocator,
/// eliminating the reference cycle the original implementation avoided with
/// a weak reference (spec §9).
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext {
    pub attempt: u32,
    pub standby_slot: u32,
}

/// Outcome of `SlotAllocator::acquire`.
pub enum Outcome {
    Main { guard: LockGuard, slot: u32 },
    NoSlot,
}

pub struct SlotAllocator {
    pub main_lock_dir: PathBuf,
    pub standby_lock_dir: PathBuf,
    pub max_procs: u32,
    pub standby_max_procs: u32,
    pub interval: Duration,
}

impl SlotAllocator {
    pub fn new(
        main_lock_dir: PathBuf,
        standby_lock_dir: PathBuf,
        max_procs: u32,
        standby_max_procs: u32,
        interval: Duration,
    ) -> Self {
        Self {
            main_lock_dir,
            standby_lock_dir,
            max_procs,
            standby_max_procs,
            interval,
        }
    }

    /// One-shot attempt at a main slot, no standby fallback and no retry
    /// loop. Used by the supervisor's reconciliation path, which spawns a
    /// fresh worker process per slot rather than polling within one.
    pub fn try_main_once(&self) -> Result<Option<LockGuard>> {
        try_acquire_any(&self.main_lock_dir, self.max_procs, SlotKind::Main)
    }

    pub fn try_standby_once(&self) -> Result<Option<LockGuard>> {
        try_acquire_any(
            &self.standby_lock_dir,
            self.standby_max_procs,
            SlotKind::Standby,
        )
    }

    /// Full allocation protocol (spec §4.2): try a main slot; if none free,
    /// fall back to a standby slot and poll for a main slot to open up,
    /// running `hook` before each retry round. The hook alone governs
    /// whether retrying continues (spec §4.3: it checks the stop file and
    /// otherwise delegates to the caller's retry predicate) — the
    /// allocator itself has no opinion on retry policy.
    pub fn acquire(
        &self,
        mut hook: impl FnMut(AttemptContext) -> HookDecision,
    ) -> Result<Outcome> {
        if let Some(guard) = self.try_main_once()? {
            return Ok(Outcome::Main {
                slot: guard.slot(),
                guard,
            });
        }

        let standby_guard = match self.try_standby_once()? {
            Some(g) => g,
            None => return Ok(Outcome::NoSlot),
        };
        let standby_slot = standby_guard.slot();

        let mut attempt: u32 = 1;
        loop {
            let ctx = AttemptContext {
                attempt,
                standby_slot,
            };
            if hook(ctx) == HookDecision::Stop {
                return Ok(Outcome::NoSlot);
            }

            thread::sleep(self.interval);

            if let Some(main_guard) = self.try_main_once()? {
                // standby_guard drops here, releasing it — the caller is
                // guaranteed to observe holding exactly a main slot.
                drop(standby_guard);
                return Ok(Outcome::Main {
                    slot: main_guard.slot(),
                    guard: main_guard,
                });
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_first_free_main_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = SlotAllocator::new(
            tmp.path().join("main"),
            tmp.path().join("standby"),
            2,
            1,
            Duration::from_millis(10),
        );
        let outcome = alloc.acquire(|_| HookDecision::Continue).unwrap();
        match outcome {
            Outcome::Main { slot, .. } => assert_eq!(slot, 1),
            Outcome::NoSlot => panic!("expected a main slot"),
        }
    }

    #[test]
    fn second_worker_gets_second_main_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = SlotAllocator::new(
            tmp.path().join("main"),
            tmp.path().join("standby"),
            2,
            1,
            Duration::from_millis(10),
        );
        let _first = alloc.try_main_once().unwrap().unwrap();
        let second = alloc.try_main_once().unwrap().unwrap();
        assert_eq!(second.slot(), 2);
    }

    #[test]
    fn falls_back_to_standby_when_mains_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = SlotAllocator::new(
            tmp.path().join("main"),
            tmp.path().join("standby"),
            1,
            1,
            Duration::from_millis(5),
        );
        let _held_main = alloc.try_main_once().unwrap().unwrap();

        let mut hook_calls = 0;
        let outcome = alloc
            .acquire(|_ctx| {
                hook_calls += 1;
                HookDecision::Stop
            })
            .unwrap();
        assert!(matches!(outcome, Outcome::NoSlot));
        assert_eq!(hook_calls, 1);
    }

    #[test]
    fn promotes_when_main_frees_during_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = SlotAllocator::new(
            tmp.path().join("main"),
            tmp.path().join("standby"),
            1,
            1,
            Duration::from_millis(5),
        );
        let held_main = alloc.try_main_once().unwrap().unwrap();

        // Release the main slot from a separate thread shortly after the
        // retry loop starts, simulating the holder's process exiting.
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let released2 = released.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            drop(held_main);
            released2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        let outcome = alloc.acquire(|_| HookDecision::Continue).unwrap();
        match outcome {
            Outcome::Main { slot, .. } => assert_eq!(slot, 1),
            Outcome::NoSlot => panic!("expected promotion to a main slot"),
        }
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn no_slot_when_both_levels_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = SlotAllocator::new(
            tmp.path().join("main"),
            tmp.path().join("standby"),
            1,
            1,
            Duration::from_millis(5),
        );
        let _m = alloc.try_main_once().unwrap().unwrap();
        let _s = alloc.try_standby_once().unwrap().unwrap();
        let outcome = alloc
            .acquire(|ctx| {
                if ctx.attempt >= 3 {
                    HookDecision::Stop
                } else {
                    HookDecision::Continue
                }
            })
            .unwrap();
        assert!(matches!(outcome, Outcome::NoSlot));
    }
}
