//! Supervisor configuration: a single immutable record built once at
//! command entry (spec §9 "accessor soup" design note — no per-field
//! accessor generation, validation centralized in one place).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::HadcError;

/// How many times (or under what predicate) a standby keeps retrying
/// for a free main slot. Spec §9 Open Question: a bare count `N` means
/// "the retry predicate returns true for attempts 1..=N".
#[derive(Clone)]
pub enum RetryPolicy {
    Count(u32),
    Predicate(Arc<dyn Fn(u32) -> bool + Send + Sync>),
}

impl RetryPolicy {
    /// Whether attempt number `attempt` (1-based) should be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self {
            RetryPolicy::Count(n) => attempt <= *n,
            RetryPolicy::Predicate(f) => f(attempt),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Count(n) => write!(f, "RetryPolicy::Count({n})"),
            RetryPolicy::Predicate(_) => write!(f, "RetryPolicy::Predicate(..)"),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // Unbounded from the allocator's point of view; the supervisor
        // governs overall wall-clock budget via fork_until's own retry cap.
        RetryPolicy::Count(u32::MAX)
    }
}

/// On-disk / env-var layer deserialized before being folded into `Config`.
/// Every field optional — this is the overlay, not the final record.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub name: Option<String>,
    pub program: Option<PathBuf>,
    pub program_args: Option<Vec<String>>,
    pub pid_dir: Option<PathBuf>,
    pub max_procs: Option<u32>,
    pub standby_max_procs: Option<u32>,
    pub lock_dir: Option<PathBuf>,
    pub standby_lock_dir: Option<PathBuf>,
    pub stop_file: Option<PathBuf>,
    pub interval_secs: Option<u64>,
    pub main_timeout_secs: Option<u64>,
    pub standby_timeout_secs: Option<u64>,
    pub kill_timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<u32>,
    pub chdir: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
}

impl ConfigFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("failed to parse config file as TOML")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Overlay `HADC_CONFIG_*` environment variables for container/init-script
    /// deployments, applied after the file layer and before CLI flags.
    pub fn merge_env(mut self) -> Self {
        macro_rules! env_str {
            ($key:literal, $field:ident) => {
                if let Ok(v) = std::env::var(concat!("HADC_CONFIG_", $key)) {
                    self.$field = Some(v.into());
                }
            };
        }
        macro_rules! env_num {
            ($key:literal, $field:ident, $ty:ty) => {
                if let Ok(v) = std::env::var(concat!("HADC_CONFIG_", $key)) {
                    if let Ok(n) = v.parse::<$ty>() {
                        self.$field = Some(n);
                    }
                }
            };
        }
        env_str!("NAME", name);
        env_str!("PID_DIR", pid_dir);
        env_str!("PROGRAM", program);
        env_num!("MAX_PROCS", max_procs, u32);
        env_num!("STANDBY_MAX_PROCS", standby_max_procs, u32);
        env_num!("INTERVAL_SECS", interval_secs, u64);
        self
    }
}

/// The fully-validated, immutable supervisor configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub name: String,
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub pid_dir: PathBuf,
    pub max_procs: u32,
    pub standby_max_procs: u32,
    pub lock_dir: PathBuf,
    pub standby_lock_dir: PathBuf,
    pub stop_file: PathBuf,
    pub interval: Duration,
    pub main_timeout: Duration,
    pub standby_timeout: Duration,
    pub kill_timeout: Duration,
    pub retries: RetryPolicy,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: u32,
    pub chdir: PathBuf,
    pub stdout_file: PathBuf,
    pub stderr_file: PathBuf,
}

pub struct ConfigBuilder {
    file: ConfigFile,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            file: ConfigFile::default(),
        }
    }

    pub fn overlay_file(mut self, file: ConfigFile) -> Self {
        merge_opt(&mut self.file.name, file.name);
        merge_opt(&mut self.file.program, file.program);
        merge_opt(&mut self.file.program_args, file.program_args);
        merge_opt(&mut self.file.pid_dir, file.pid_dir);
        merge_opt(&mut self.file.max_procs, file.max_procs);
        merge_opt(&mut self.file.standby_max_procs, file.standby_max_procs);
        merge_opt(&mut self.file.lock_dir, file.lock_dir);
        merge_opt(&mut self.file.standby_lock_dir, file.standby_lock_dir);
        merge_opt(&mut self.file.stop_file, file.stop_file);
        merge_opt(&mut self.file.interval_secs, file.interval_secs);
        merge_opt(&mut self.file.main_timeout_secs, file.main_timeout_secs);
        merge_opt(&mut self.file.standby_timeout_secs, file.standby_timeout_secs);
        merge_opt(&mut self.file.kill_timeout_secs, file.kill_timeout_secs);
        merge_opt(&mut self.file.retries, file.retries);
        merge_opt(&mut self.file.user, file.user);
        merge_opt(&mut self.file.group, file.group);
        merge_opt(&mut self.file.umask, file.umask);
        merge_opt(&mut self.file.chdir, file.chdir);
        merge_opt(&mut self.file.stdout_file, file.stdout_file);
        merge_opt(&mut self.file.stderr_file, file.stderr_file);
        self
    }

    pub fn build(self) -> Result<Config> {
        let f = self.file;
        let name = f
            .name
            .ok_or_else(|| HadcError::Config("missing required field: name".into()))?;
        let program = f
            .program
            .ok_or_else(|| HadcError::Config("missing required field: program".into()))?;
        let pid_dir = f
            .pid_dir
            .ok_or_else(|| HadcError::Config("missing required field: pid_dir".into()))?;
        let max_procs = f.max_procs.unwrap_or(1);
        if max_procs == 0 {
            return Err(HadcError::Config(
                "max_procs must be >= 1 (a supervisor with zero main slots is nonsensical)".into(),
            )
            .into());
        }
        let standby_max_procs = f.standby_max_procs.unwrap_or(0);
        let lock_dir = f.lock_dir.unwrap_or_else(|| pid_dir.join("lock"));
        let standby_lock_dir = f
            .standby_lock_dir
            .unwrap_or_else(|| pid_dir.join("lock-standby"));
        if lock_dir == standby_lock_dir {
            return Err(HadcError::Config(
                "lock_dir and standby_lock_dir must differ — aliasing the two slot spaces breaks the main/standby invariant".into(),
            )
            .into());
        }
        let stop_file = f
            .stop_file
            .unwrap_or_else(|| pid_dir.join("standby-stop-file"));
        let interval = Duration::from_secs(f.interval_secs.unwrap_or(5));
        let standby_timeout = Duration::from_secs(
            f.standby_timeout_secs
                .unwrap_or_else(|| interval.as_secs() + 3),
        );
        let main_timeout =
            Duration::from_secs(f.main_timeout_secs.unwrap_or(standby_timeout.as_secs()));
        let kill_timeout = Duration::from_secs(f.kill_timeout_secs.unwrap_or(3));
        let retries = match f.retries {
            Some(n) => RetryPolicy::Count(n),
            None => RetryPolicy::default(),
        };

        Ok(Config {
            name,
            program,
            program_args: f.program_args.unwrap_or_default(),
            pid_dir,
            max_procs,
            standby_max_procs,
            lock_dir,
            standby_lock_dir,
            stop_file,
            interval,
            main_timeout,
            standby_timeout,
            kill_timeout,
            retries,
            user: f.user,
            group: f.group,
            umask: f.umask.unwrap_or(0o022),
            chdir: f.chdir.unwrap_or_else(|| PathBuf::from("/")),
            stdout_file: f.stdout_file.unwrap_or_else(|| PathBuf::from("/dev/null")),
            stderr_file: f.stderr_file.unwrap_or_else(|| PathBuf::from("/dev/null")),
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_opt<T>(base: &mut Option<T>, overlay: Option<T>) {
    if overlay.is_some() {
        *base = overlay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file() -> ConfigFile {
        ConfigFile {
            name: Some("demo".into()),
            program: Some(PathBuf::from("/bin/sleep")),
            pid_dir: Some(PathBuf::from("/tmp/hadc-demo")),
            max_procs: Some(2),
            standby_max_procs: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn builds_with_defaults() {
        let cfg = ConfigBuilder::new()
            .overlay_file(minimal_file())
            .build()
            .unwrap();
        assert_eq!(cfg.max_procs, 2);
        assert_eq!(cfg.standby_max_procs, 1);
        assert_eq!(cfg.lock_dir, PathBuf::from("/tmp/hadc-demo/lock"));
        assert_eq!(cfg.standby_timeout, cfg.main_timeout);
        assert_eq!(cfg.standby_timeout, Duration::from_secs(8));
    }

    #[test]
    fn missing_name_is_fatal() {
        let mut f = minimal_file();
        f.name = None;
        let err = ConfigBuilder::new().overlay_file(f).build();
        assert!(err.is_err());
    }

    #[test]
    fn zero_max_procs_is_fatal() {
        let mut f = minimal_file();
        f.max_procs = Some(0);
        let err = ConfigBuilder::new().overlay_file(f).build();
        assert!(err.is_err());
    }

    #[test]
    fn aliased_lock_dirs_rejected() {
        let mut f = minimal_file();
        f.lock_dir = Some(PathBuf::from("/tmp/hadc-demo/shared"));
        f.standby_lock_dir = Some(PathBuf::from("/tmp/hadc-demo/shared"));
        let err = ConfigBuilder::new().overlay_file(f).build();
        assert!(err.is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let toml_src = r#"
            name = "demo"
            program = "/bin/sleep"
            pid_dir = "/tmp/hadc-demo"
            max_procs = 3
        "#;
        let f = ConfigFile::from_toml_str(toml_src).unwrap();
        assert_eq!(f.name.as_deref(), Some("demo"));
        assert_eq!(f.max_procs, Some(3));
    }
}
