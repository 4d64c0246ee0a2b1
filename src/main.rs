use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hadc::config::{ConfigBuilder, ConfigFile};
use hadc::control::{self, InitFileOptions};
use hadc::worker::{ExecPayload, Payload};

/// High-availability process supervisor: main/standby worker pool with
/// hot failover via file-lock slot allocation.
#[derive(Parser, Debug)]
#[command(name = "hadc", version, about)]
struct Cli {
    /// One of: start, stop, restart, hard_restart, status, reload, fork, get_init_file
    #[arg(allow_hyphen_values = true)]
    action: String,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    program: Option<PathBuf>,

    #[arg(long = "program-arg")]
    program_args: Vec<String>,

    #[arg(long = "pid-dir")]
    pid_dir: Option<PathBuf>,

    #[arg(long = "max-procs")]
    max_procs: Option<u32>,

    #[arg(long = "standby-max-procs")]
    standby_max_procs: Option<u32>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    group: Option<String>,
}

fn init_logging() {
    let truthy = std::env::var("HADC_TRACE")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false);
    let default_filter = if truthy { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(cli: &Cli) -> Result<hadc::Config> {
    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_path(path)?,
        None => ConfigFile::default(),
    }
    .merge_env();

    if cli.name.is_some() {
        file.name = cli.name.clone();
    }
    if cli.program.is_some() {
        file.program = cli.program.clone();
    }
    if !cli.program_args.is_empty() {
        file.program_args = Some(cli.program_args.clone());
    }
    if cli.pid_dir.is_some() {
        file.pid_dir = cli.pid_dir.clone();
    }
    if cli.max_procs.is_some() {
        file.max_procs = cli.max_procs;
    }
    if cli.standby_max_procs.is_some() {
        file.standby_max_procs = cli.standby_max_procs;
    }
    if cli.user.is_some() {
        file.user = cli.user.clone();
    }
    if cli.group.is_some() {
        file.group = cli.group.clone();
    }

    ConfigBuilder::new().overlay_file(file).build()
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    };

    let payload: Arc<dyn Payload> = Arc::new(ExecPayload);
    let hadc_bin = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "hadc".to_string());
    let config_path = cli
        .config
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let init_opts = InitFileOptions {
        hadc_bin: hadc_bin.as_str(),
        config_path: config_path.as_str(),
        user_code: "",
    };

    match control::dispatch(&cli.action, &config, &payload, &init_opts) {
        Ok(result) => {
            if let Some(msg) = result.message {
                eprintln!("{msg}");
            }
            std::process::exit(result.exit_code);
        }
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    }
}
