//! Supervisor (spec §4.4): owns the reconciliation loop for each CLI
//! command. Runs per invocation and exits — it is not itself a daemon.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::error::HadcError;
use crate::pidreg::{self, Kind};
use crate::worker::{self, Payload};

/// Outcome of a command, carrying both the exit code and whatever detail
/// `control::pretty_print`/logging wants to surface.
pub struct CommandResult {
    pub exit_code: i32,
    pub message: Option<String>,
}

impl CommandResult {
    fn ok() -> Self {
        Self {
            exit_code: 0,
            message: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: Some(message.into()),
        }
    }
}

/// `kill(pid, sig)` with spec §4.4's signal handling policy: `ESRCH` is
/// treated as success (process already gone), `EPERM` is fatal, anything
/// else is fatal.
fn send_signal(pid: i32, sig: i32) -> Result<()> {
    let ret = unsafe { libc::kill(pid, sig) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        Some(libc::EPERM) => Err(HadcError::Signal {
            pid,
            reason: "permission denied — this daemon needs root".to_string(),
        }
        .into()),
        _ => Err(HadcError::Signal {
            pid,
            reason: format!("kill(.., {sig}) failed: {err}"),
        }
        .into()),
    }
}

fn currently_running(config: &Config, kind: Kind, expected: u32) -> Result<u32> {
    let mut count = 0;
    for slot in 1..=expected {
        if pidreg::pid_of(&config.pid_dir, kind, slot)?.is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// Double-fork launch (spec §4.4): fork once, the intermediate child calls
/// `setsid` and forks again; the grandchild runs the worker lifecycle and
/// the intermediate child exits immediately, orphaning the grandchild to
/// init. The supervisor `waitpid`s the intermediate child to avoid
/// zombies. Any fork failure is fatal.
pub fn spawn_worker(config: Arc<Config>, payload: Arc<dyn Payload>) -> Result<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        anyhow::bail!("fork failed: {}", std::io::Error::last_os_error());
    }
    if pid == 0 {
        // Intermediate child.
        if unsafe { libc::setsid() } == -1 {
            std::process::exit(1);
        }
        let pid2 = unsafe { libc::fork() };
        if pid2 < 0 {
            std::process::exit(1);
        }
        if pid2 == 0 {
            // Grandchild: becomes the worker. A failed chdir/setuid/setgid
            // during hygiene is fatal (spec §9 Open Question: failed chdir
            // is fatal) — never fall through into the lifecycle half-set-up.
            if let Err(e) = worker::apply_process_hygiene(&config, None) {
                tracing::error!("{e:#}");
                std::process::exit(1);
            }
            let code = worker::enter_worker_lifecycle(&config, payload, &[])
                .unwrap_or(1);
            std::process::exit(code);
        }
        // Intermediate child exits immediately, orphaning the grandchild.
        std::process::exit(0);
    }

    // Supervisor: wait for the intermediate child only, never the grandchild.
    let mut status = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    Ok(())
}

/// Reconciliation primitive used for both mains and standbys (spec §4.4).
/// Up to 3 rounds; each round computes the deficit, spawns that many
/// workers, then polls up to `timeout` once per second for the expected
/// population to appear.
pub fn fork_until(
    config: &Arc<Config>,
    payload: &Arc<dyn Payload>,
    kind: Kind,
    expected: u32,
    timeout: Duration,
) -> Result<bool> {
    for _round in 0..3 {
        let running = currently_running(config, kind, expected)?;
        let deficit = expected.saturating_sub(running);
        for _ in 0..deficit {
            spawn_worker(config.clone(), payload.clone())?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if currently_running(config, kind, expected)? == expected {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(currently_running(config, kind, expected)? == expected)
}

fn unlink_stop_file(config: &Config) -> Result<()> {
    pidreg::unlink_if_present(&config.stop_file)
}

fn write_stop_file(config: &Config) -> Result<()> {
    if let Some(parent) = config.stop_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&config.stop_file, "")
        .with_context(|| format!("failed to write stop file: {}", config.stop_file.display()))
}

fn wait_for_zero(config: &Config, kind: Kind, expected_slots: u32, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if currently_running(config, kind, expected_slots)? == 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(currently_running(config, kind, expected_slots)? == 0);
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// Escalating kill sequence: TERM, TERM, INT, KILL, each followed by up to
/// `kill_timeout` one-second polls (spec §4.4).
const ESCALATION: &[i32] = &[libc::SIGTERM, libc::SIGTERM, libc::SIGINT, libc::SIGKILL];

fn kill_until_dead(pid: i32, kill_timeout: Duration) -> Result<bool> {
    for sig in ESCALATION {
        send_signal(pid, *sig)?;
        let deadline = Instant::now() + kill_timeout;
        loop {
            if !pidreg::is_alive(pid)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(!pidreg::is_alive(pid)?)
}

/// `restart_main(slot)`: escalating signals until a *different* live PID
/// appears in `main-<slot>.pid` — i.e. a standby promoted into the freed
/// slot (spec §4.4).
fn restart_main(config: &Config, slot: u32) -> Result<bool> {
    let path = pidreg::pid_path(&config.pid_dir, Kind::Main, slot);
    let original_pid = match pidreg::read_pid(&path)? {
        Some(p) if pidreg::is_alive(p)? => p,
        _ => return Ok(true), // absent or already dead: nothing to restart
    };

    for sig in ESCALATION {
        send_signal(original_pid, *sig)?;
        let deadline = Instant::now() + config.kill_timeout;
        loop {
            if let Some(new_pid) = pidreg::read_pid(&path)? {
                if new_pid != original_pid && pidreg::is_alive(new_pid)? {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    if let Some(new_pid) = pidreg::read_pid(&path)? {
        Ok(new_pid != original_pid && pidreg::is_alive(new_pid)?)
    } else {
        Ok(false)
    }
}

/// Stolen-lock detection (spec §4.4): after a failed start, if mains are
/// short but standbys reached their full count, an external process is
/// likely holding a main lock outside our control.
fn detect_stolen_lock(config: &Config, mains: u32) -> Option<String> {
    let standbys = currently_running(config, Kind::Standby, config.standby_max_procs).ok()?;
    if mains < config.max_procs && standbys == config.standby_max_procs {
        Some(format!(
            "only {mains}/{} main slots running while all {} standby slots are up — \
             something is possibly holding it (an external process may hold a main lock)",
            config.max_procs, config.standby_max_procs
        ))
    } else {
        None
    }
}

pub fn do_start(config: &Arc<Config>, payload: &Arc<dyn Payload>) -> Result<CommandResult> {
    unlink_stop_file(config)?;
    let mains_ok = fork_until(
        config,
        payload,
        Kind::Main,
        config.max_procs,
        config.main_timeout,
    )?;
    let standbys_ok = fork_until(
        config,
        payload,
        Kind::Standby,
        config.standby_max_procs,
        config.standby_timeout,
    )?;

    if mains_ok && standbys_ok {
        Ok(CommandResult::ok())
    } else {
        let mains = currently_running(config, Kind::Main, config.max_procs)?;
        let standbys = currently_running(config, Kind::Standby, config.standby_max_procs)?;
        let warning = detect_stolen_lock(config, mains);
        if let Some(w) = &warning {
            tracing::warn!("{w}");
        }
        let kind = if !mains_ok { "main" } else { "standby" };
        let (expected, actual) = if !mains_ok {
            (config.max_procs, mains)
        } else {
            (config.standby_max_procs, standbys)
        };
        let reconciliation = HadcError::Reconciliation {
            kind,
            expected,
            actual,
        };
        Ok(CommandResult::fail(
            warning.unwrap_or_else(|| reconciliation.to_string()),
        ))
    }
}

pub fn do_stop(config: &Arc<Config>) -> Result<CommandResult> {
    let mains_running = currently_running(config, Kind::Main, config.max_procs)?;
    let standbys_running = currently_running(config, Kind::Standby, config.standby_max_procs)?;
    if mains_running == 0 && standbys_running == 0 {
        return Ok(CommandResult {
            exit_code: 0,
            message: Some("nothing running".to_string()),
        });
    }

    write_stop_file(config)?;
    wait_for_zero(config, Kind::Standby, config.standby_max_procs, config.standby_timeout)?;

    for slot in 1..=config.max_procs {
        let path = pidreg::pid_path(&config.pid_dir, Kind::Main, slot);
        if let Some(pid) = pidreg::read_pid(&path)? {
            if pidreg::is_alive(pid)? {
                kill_until_dead(pid, config.kill_timeout)?;
            }
            pidreg::unlink_if_present(&path)?;
        }
    }

    let mains = currently_running(config, Kind::Main, config.max_procs)?;
    let standbys = currently_running(config, Kind::Standby, config.standby_max_procs)?;
    if mains == 0 && standbys == 0 {
        Ok(CommandResult::ok())
    } else {
        let kind = if mains > 0 { "main" } else { "standby" };
        let actual = if mains > 0 { mains } else { standbys };
        Ok(CommandResult::fail(
            HadcError::Reconciliation {
                kind,
                expected: 0,
                actual,
            }
            .to_string(),
        ))
    }
}

pub fn do_hard_restart(config: &Arc<Config>, payload: &Arc<dyn Payload>) -> Result<CommandResult> {
    let stop_result = do_stop(config)?;
    let start_result = do_start(config, payload)?;
    if stop_result.exit_code != 0 {
        Ok(stop_result)
    } else {
        Ok(start_result)
    }
}

pub fn do_restart(config: &Arc<Config>, payload: &Arc<dyn Payload>) -> Result<CommandResult> {
    let mains_running = currently_running(config, Kind::Main, config.max_procs)?;
    let standbys_running = currently_running(config, Kind::Standby, config.standby_max_procs)?;
    if mains_running == 0 && standbys_running == 0 {
        return do_start(config, payload);
    }
    if config.standby_max_procs == 0 {
        return do_hard_restart(config, payload);
    }

    write_stop_file(config)?;
    wait_for_zero(config, Kind::Standby, config.standby_max_procs, config.standby_timeout)?;

    unlink_stop_file(config)?;
    fork_until(
        config,
        payload,
        Kind::Standby,
        config.standby_max_procs,
        config.standby_timeout,
    )?;

    let mut all_promoted = true;
    for slot in 1..=config.max_procs {
        if !restart_main(config, slot)? {
            all_promoted = false;
        }
    }

    let mains_ok = fork_until(
        config,
        payload,
        Kind::Main,
        config.max_procs,
        config.main_timeout,
    )?;
    let standbys_ok = fork_until(
        config,
        payload,
        Kind::Standby,
        config.standby_max_procs,
        config.standby_timeout,
    )?;

    if all_promoted && mains_ok && standbys_ok {
        Ok(CommandResult::ok())
    } else {
        let mains = currently_running(config, Kind::Main, config.max_procs)?;
        let standbys = currently_running(config, Kind::Standby, config.standby_max_procs)?;
        let kind = if !all_promoted || !mains_ok {
            "main"
        } else {
            "standby"
        };
        let (expected, actual) = if kind == "main" {
            (config.max_procs, mains)
        } else {
            (config.standby_max_procs, standbys)
        };
        Ok(CommandResult::fail(
            HadcError::Reconciliation {
                kind,
                expected,
                actual,
            }
            .to_string(),
        ))
    }
}

pub fn do_status(config: &Config) -> Result<Vec<(String, Kind, u32, bool)>> {
    let mut rows = Vec::new();
    for slot in 1..=config.max_procs {
        let running = pidreg::pid_of(&config.pid_dir, Kind::Main, slot)?.is_some();
        rows.push((config.name.clone(), Kind::Main, slot, running));
    }
    for slot in 1..=config.standby_max_procs {
        let running = pidreg::pid_of(&config.pid_dir, Kind::Standby, slot)?.is_some();
        rows.push((config.name.clone(), Kind::Standby, slot, running));
    }
    Ok(rows)
}

pub fn status_exit_code(rows: &[(String, Kind, u32, bool)]) -> i32 {
    if rows.iter().all(|(_, _, _, running)| *running) {
        0
    } else {
        1
    }
}

pub fn do_reload(config: &Config) -> Result<CommandResult> {
    for slot in 1..=config.max_procs {
        let path = pidreg::pid_path(&config.pid_dir, Kind::Main, slot);
        if let Some(pid) = pidreg::read_pid(&path)? {
            if pidreg::is_alive(pid)? {
                send_signal(pid, libc::SIGHUP)?;
            }
        }
    }
    Ok(CommandResult::ok())
}

pub fn do_fork(config: &Arc<Config>, payload: &Arc<dyn Payload>) -> Result<CommandResult> {
    if config.stop_file.exists() {
        return Ok(CommandResult::fail("stop file present, refusing to fork"));
    }
    fork_until(
        config,
        payload,
        Kind::Main,
        config.max_procs,
        config.main_timeout,
    )?;
    fork_until(
        config,
        payload,
        Kind::Standby,
        config.standby_max_procs,
        config.standby_timeout,
    )?;
    Ok(CommandResult::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBuilder, ConfigFile};
    use std::path::{Path, PathBuf};
    use std::process::Command;

    fn base_config(dir: &Path) -> Config {
        ConfigBuilder::new()
            .overlay_file(ConfigFile {
                name: Some("demo".into()),
                program: Some(PathBuf::from("/bin/true")),
                pid_dir: Some(dir.to_path_buf()),
                max_procs: Some(2),
                standby_max_procs: Some(1),
                interval_secs: Some(0),
                kill_timeout_secs: Some(1),
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawning a real child process for liveness tests")
    }

    #[test]
    fn currently_running_counts_only_live_pids() {
        let tmp = tempfile::tempdir().unwrap();
        let config = base_config(tmp.path());

        assert_eq!(currently_running(&config, Kind::Main, 2).unwrap(), 0);

        let mut child = spawn_sleeper();
        pidreg::write_pid(
            &pidreg::pid_path(&config.pid_dir, Kind::Main, 1),
            child.id() as i32,
        )
        .unwrap();
        pidreg::write_pid(
            &pidreg::pid_path(&config.pid_dir, Kind::Main, 2),
            999_999_999,
        )
        .unwrap();

        assert_eq!(currently_running(&config, Kind::Main, 2).unwrap(), 1);
        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn status_exit_code_zero_only_when_all_running() {
        let rows = vec![
            ("demo".to_string(), Kind::Main, 1, true),
            ("demo".to_string(), Kind::Standby, 1, true),
        ];
        assert_eq!(status_exit_code(&rows), 0);

        let rows = vec![
            ("demo".to_string(), Kind::Main, 1, true),
            ("demo".to_string(), Kind::Standby, 1, false),
        ];
        assert_eq!(status_exit_code(&rows), 1);
    }

    #[test]
    fn detect_stolen_lock_fires_when_standbys_full_but_mains_short() {
        let tmp = tempfile::tempdir().unwrap();
        let config = base_config(tmp.path());

        assert!(detect_stolen_lock(&config, 2).is_none());

        pidreg::write_pid(
            &pidreg::pid_path(&config.pid_dir, Kind::Standby, 1),
            std::process::id() as i32,
        )
        .unwrap();
        assert!(detect_stolen_lock(&config, 0).is_some());
    }

    #[test]
    fn kill_until_dead_kills_a_real_process() {
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        assert!(pidreg::is_alive(pid).unwrap());

        let dead = kill_until_dead(pid, Duration::from_millis(200)).unwrap();
        assert!(dead);
        child.wait().ok();
    }

    #[test]
    fn restart_main_reports_success_when_slot_already_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let config = base_config(tmp.path());
        assert!(restart_main(&config, 1).unwrap());
    }

    #[test]
    fn do_stop_reports_nothing_running_when_pid_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(base_config(tmp.path()));
        let result = do_stop(&config).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.message.as_deref(), Some("nothing running"));
    }

    #[test]
    fn do_status_reports_expected_slot_count() {
        let tmp = tempfile::tempdir().unwrap();
        let config = base_config(tmp.path());
        let rows = do_status(&config).unwrap();
        // 2 main slots + 1 standby slot, per base_config.
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|(_, _, _, running)| !running));
    }
}
