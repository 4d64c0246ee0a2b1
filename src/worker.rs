//! Worker Lifecycle (spec §4.3): runs inside the grandchild process
//! produced by the supervisor's double-fork. Every step here is a design
//! contract, not a suggestion — deviating breaks the pid-registry
//! invariants the supervisor depends on.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::lock::{AttemptContext, HookDecision, Outcome, SlotAllocator};
use crate::pidreg::{self, Kind};

/// Environment variable the core sets in the payload's environment to the
/// integer fd of the held main lock, so the payload can inherit it across
/// `exec` for re-exec patterns (spec §6, §9).
pub const LOCK_FD_ENV: &str = "HADC_lock_fd";

/// A handle passed to the payload: configuration accessors and logging
/// helpers, standing in for "the opaque callable's" collaborator (spec §1
/// scopes the payload itself out, but its interface is in scope).
pub struct WorkerHandle<'a> {
    config: &'a Config,
    slot: u32,
}

impl<'a> WorkerHandle<'a> {
    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn main_slot(&self) -> u32 {
        self.slot
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(worker = %self.config.name, slot = self.slot, "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(worker = %self.config.name, slot = self.slot, "{msg}");
    }
}

/// The worker payload contract: invoked with `(handle, user_args)` once a
/// main slot is held; the return value becomes the worker's exit code.
pub trait Payload: Send + Sync {
    fn run(&self, handle: &WorkerHandle<'_>, args: &[String]) -> i32;
}

/// Default payload: execs `config.program` with `config.program_args`,
/// inheriting the lock fd via `HADC_lock_fd` (spec §11: a concrete default
/// payload grounded in the fd-inheritance-across-exec technique used for
/// daemon re-exec elsewhere in the pack).
pub struct ExecPayload;

impl Payload for ExecPayload {
    fn run(&self, handle: &WorkerHandle<'_>, args: &[String]) -> i32 {
        let program = &handle.config().program;
        let mut all_args: Vec<String> = vec![program.display().to_string()];
        all_args.extend(handle.config().program_args.iter().cloned());
        all_args.extend(args.iter().cloned());

        let c_program = match CString::new(program.display().to_string()) {
            Ok(c) => c,
            Err(_) => return 127,
        };
        let c_args: Vec<CString> = all_args
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok())
            .collect();
        let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        unsafe {
            libc::execvp(c_program.as_ptr(), argv.as_ptr());
        }
        // execvp only returns on failure.
        handle.warn(&format!(
            "execvp({}) failed: {}",
            program.display(),
            std::io::Error::last_os_error()
        ));
        127
    }
}

fn stop_file_present(config: &Config) -> bool {
    config.stop_file.exists()
}

/// Process hygiene applied before the grandchild can reach payload
/// invocation (spec §4.3 step 5): session, uid/gid, umask, cwd, fd
/// closing (3..OPEN_MAX, preserving the log fd), stdin from `/dev/null`,
/// stdout/stderr to configured files.
pub fn apply_process_hygiene(config: &Config, preserved_fd: Option<RawFd>) -> Result<()> {
    unsafe {
        if libc::setsid() == -1 {
            anyhow::bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
    }

    if let Some(group) = &config.group {
        set_gid_by_name(group)?;
    }
    if let Some(user) = &config.user {
        set_uid_by_name(user)?;
        std::env::set_var("USER", user);
        if let Some(home) = dirs::home_dir() {
            std::env::set_var("HOME", home);
        }
    }

    unsafe {
        libc::umask(config.umask as libc::mode_t);
    }

    // §9 Open Question resolution: a failed chdir is fatal.
    std::env::set_current_dir(&config.chdir)
        .with_context(|| format!("chdir to {} failed", config.chdir.display()))?;

    close_fds_except(preserved_fd)?;
    redirect_standard_streams(&config.stdout_file, &config.stderr_file)?;

    Ok(())
}

fn set_uid_by_name(user: &str) -> Result<()> {
    let uid = lookup_uid(user)?;
    if unsafe { libc::setuid(uid) } != 0 {
        anyhow::bail!("setuid({user}) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_gid_by_name(group: &str) -> Result<()> {
    let gid = lookup_gid(group)?;
    if unsafe { libc::setgid(gid) } != 0 {
        anyhow::bail!("setgid({group}) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn lookup_uid(user: &str) -> Result<libc::uid_t> {
    if let Ok(uid) = user.parse::<libc::uid_t>() {
        return Ok(uid);
    }
    let c_user = CString::new(user).context("invalid user name")?;
    let pwd = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pwd.is_null() {
        anyhow::bail!("no such user: {user}");
    }
    Ok(unsafe { (*pwd).pw_uid })
}

fn lookup_gid(group: &str) -> Result<libc::gid_t> {
    if let Ok(gid) = group.parse::<libc::gid_t>() {
        return Ok(gid);
    }
    let c_group = CString::new(group).context("invalid group name")?;
    let grp = unsafe { libc::getgrnam(c_group.as_ptr()) };
    if grp.is_null() {
        anyhow::bail!("no such group: {group}");
    }
    Ok(unsafe { (*grp).gr_gid })
}

fn close_fds_except(preserved: Option<RawFd>) -> Result<()> {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd < 0 { 1024 } else { max_fd as RawFd };
    for fd in 3..max_fd {
        if Some(fd) == preserved {
            continue;
        }
        unsafe {
            libc::close(fd);
        }
    }
    Ok(())
}

fn redirect_standard_streams(stdout_file: &Path, stderr_file: &Path) -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let devnull =
        std::fs::File::open("/dev/null").context("failed to open /dev/null for stdin")?;
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stdout_file)
        .with_context(|| format!("failed to open stdout file: {}", stdout_file.display()))?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stderr_file)
        .with_context(|| format!("failed to open stderr file: {}", stderr_file.display()))?;

    unsafe {
        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(stdout.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(stderr.as_raw_fd(), libc::STDERR_FILENO);
    }
    Ok(())
}

/// Runs the full worker lifecycle contract and returns the process exit
/// code the caller should terminate with. Never panics on expected
/// outcomes (no slot, stop file hit); I/O failures during setup remain
/// fatal per spec §7.
pub fn enter_worker_lifecycle(
    config: &Config,
    payload: Arc<dyn Payload>,
    program_args: &[String],
) -> Result<i32> {
    // Step 1: pre-payload guard.
    if stop_file_present(config) {
        return Ok(0);
    }

    // Step 2: identity bootstrap.
    let pid = std::process::id() as i32;
    let unknown_path = pidreg::pid_path(&config.pid_dir, Kind::Unknown, pid as u32);
    pidreg::write_pid(&unknown_path, pid)?;

    let allocator = SlotAllocator::new(
        config.lock_dir.clone(),
        config.standby_lock_dir.clone(),
        config.max_procs,
        config.standby_max_procs,
        config.interval,
    );

    let mut current_pid_path = unknown_path.clone();
    let retries = config.retries.clone();
    let pid_dir = config.pid_dir.clone();
    let stop_file = config.stop_file.clone();

    let hook = move |ctx: AttemptContext| -> HookDecision {
        if ctx.attempt == 1 {
            let standby_path = pidreg::pid_path(&pid_dir, Kind::Standby, ctx.standby_slot);
            if pidreg::rename_pid(&current_pid_path, &standby_path).is_ok() {
                current_pid_path = standby_path;
            }
        }
        if stop_file.exists() {
            return HookDecision::Stop;
        }
        if retries.should_retry(ctx.attempt) {
            HookDecision::Continue
        } else {
            HookDecision::Stop
        }
    };

    let outcome = allocator.acquire(hook)?;

    match outcome {
        Outcome::NoSlot => {
            // Whichever identity the pid file currently has (unknown or
            // standby), unlink it: no slot was ever held.
            cleanup_any_pid_for(config, pid)?;
            Ok(1)
        }
        Outcome::Main { guard, slot } => {
            if stop_file_present(config) {
                cleanup_any_pid_for(config, pid)?;
                return Ok(0);
            }

            let main_path = pidreg::pid_path(&config.pid_dir, Kind::Main, slot);
            // Whatever path currently names this worker (unknown or a
            // standby slot it never got to rename past attempt 1 — e.g.
            // it won on its very first try) gets renamed to main-<slot>.
            let prior = find_current_pid_path(config, pid, slot)
                .unwrap_or(unknown_path.clone());
            if prior != main_path {
                pidreg::rename_pid(&prior, &main_path)?;
            }

            let lock_fd = guard.into_inheritable_raw_fd()?;
            std::env::set_var(LOCK_FD_ENV, lock_fd.to_string());

            let handle = WorkerHandle {
                config,
                slot,
            };
            let code = payload.run(&handle, program_args);

            pidreg::unlink_if_present(&main_path)?;
            Ok(code)
        }
    }
}

fn find_current_pid_path(config: &Config, pid: i32, main_slot: u32) -> Option<std::path::PathBuf> {
    let unknown = pidreg::pid_path(&config.pid_dir, Kind::Unknown, pid as u32);
    if unknown.exists() {
        return Some(unknown);
    }
    for slot in 1..=config.standby_max_procs.max(main_slot) {
        let p = pidreg::pid_path(&config.pid_dir, Kind::Standby, slot);
        if pidreg::read_pid(&p).ok().flatten() == Some(pid) {
            return Some(p);
        }
    }
    None
}

fn cleanup_any_pid_for(config: &Config, pid: i32) -> Result<()> {
    let unknown = pidreg::pid_path(&config.pid_dir, Kind::Unknown, pid as u32);
    pidreg::unlink_if_present(&unknown)?;
    for slot in 1..=config.standby_max_procs {
        let p = pidreg::pid_path(&config.pid_dir, Kind::Standby, slot);
        if pidreg::read_pid(&p)?.map(|v| v == pid).unwrap_or(false) {
            pidreg::unlink_if_present(&p)?;
        }
    }
    Ok(())
}
