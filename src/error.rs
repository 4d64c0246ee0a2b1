//! Typed error taxonomy for fatal conditions.
//!
//! Most internal functions return `anyhow::Result` with `.context(...)`
//! for ergonomic propagation. `HadcError` exists at the boundary where a
//! fatal condition needs to be classified (spec §7: configuration,
//! filesystem, and signal errors are all fatal) or where the CLI needs
//! to map a failure to a specific process exit code.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HadcError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signal delivery to pid {pid} failed: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("lock backend error: {0}")]
    LockBackend(String),

    #[error("reconciliation of {kind} failed: expected {expected}, reached {actual}")]
    Reconciliation {
        kind: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("unknown action {action:?}, valid actions are: {valid}")]
    UnknownAction { action: String, valid: String },
}
