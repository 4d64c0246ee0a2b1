//! `hadc` — high-availability process supervisor.
//!
//! Controls a fixed population of *main* worker processes and a fixed
//! population of *standby* worker processes on a single host. Standbys
//! poll for the opportunity to become main; when a main worker exits, a
//! standby atomically promotes itself so the configured main population
//! is continuously maintained without an external controller.
//!
//! Module layout mirrors the dependency order leaves-first:
//! - [`pidreg`] — PID Registry: naming, renaming, reading, liveness probes
//! - [`lock`] — Slot Allocator: flock-based main/standby slot assignment
//! - [`worker`] — Worker Lifecycle: daemonize, acquire a slot, run the payload
//! - [`supervisor`] — reconciliation and the start/stop/restart/status state machine
//! - [`control`] — CLI dispatch, pretty-printing, init-script emission

pub mod config;
pub mod control;
pub mod error;
pub mod lock;
pub mod pidreg;
pub mod supervisor;
pub mod template;
pub mod worker;

pub use config::{Config, ConfigBuilder, ConfigFile, RetryPolicy};
pub use error::HadcError;
