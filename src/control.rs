//! Control Surface (spec §4.5): command dispatch, status pretty-printing,
//! init-script emission.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::error::HadcError;
use crate::pidreg::Kind;
use crate::supervisor::{self, CommandResult};
use crate::template;
use crate::worker::Payload;

/// The set of valid action tokens, one per `do_*` handler (spec §4.5).
pub const ACTIONS: &[&str] = &[
    "start",
    "stop",
    "restart",
    "hard_restart",
    "status",
    "reload",
    "fork",
    "get_init_file",
];

/// Strip leading `-`/`--` from the action token (spec §4.5, §6).
pub fn normalize_action(raw: &str) -> &str {
    raw.trim_start_matches('-')
}

pub struct InitFileOptions<'a> {
    pub hadc_bin: &'a str,
    pub config_path: &'a str,
    pub user_code: &'a str,
}

/// Dispatch one CLI action. Unknown actions are a fatal `HadcError`
/// listing the valid set.
pub fn dispatch(
    action: &str,
    config: &Arc<Config>,
    payload: &Arc<dyn Payload>,
    init_opts: &InitFileOptions<'_>,
) -> Result<CommandResult> {
    let action = normalize_action(action);
    match action {
        "start" => supervisor::do_start(config, payload),
        "stop" => supervisor::do_stop(config),
        "restart" => supervisor::do_restart(config, payload),
        "hard_restart" => supervisor::do_hard_restart(config, payload),
        "status" => {
            let rows = supervisor::do_status(config)?;
            let exit_code = supervisor::status_exit_code(&rows);
            for (name, kind, slot, running) in &rows {
                println!("{}", pretty_print(name, *kind, *slot, *running, false));
            }
            Ok(CommandResult {
                exit_code,
                message: None,
            })
        }
        "reload" => supervisor::do_reload(config),
        "fork" => supervisor::do_fork(config, payload),
        "get_init_file" => {
            let vars = template::init_script_vars(
                &config.name,
                init_opts.hadc_bin,
                init_opts.config_path,
                init_opts.user_code,
            );
            print!("{}", template::render_init_script(&vars));
            Ok(CommandResult {
                exit_code: 0,
                message: None,
            })
        }
        other => Err(HadcError::UnknownAction {
            action: other.to_string(),
            valid: ACTIONS.join(", "),
        }
        .into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Green,
    Red,
}

fn colorize(text: &str, color: Color, enabled: bool) -> String {
    if !enabled {
        return text.to_string();
    }
    let code = match color {
        Color::Green => "32",
        Color::Red => "31",
    };
    format!("\x1b[{code}m{text}\x1b[0m")
}

/// `"<name>: <type-with-first-dash-replaced-by-space-hash>  [<status>]"`
/// (spec §4.5). e.g. `demo: main #1  [OK]`. Colors suppressed when
/// `HADC_NO_COLORS` is set or `quiet` is true; unknown status colors
/// default to green.
pub fn pretty_print(name: &str, kind: Kind, slot: u32, running: bool, quiet: bool) -> String {
    let type_label = format!("{kind}-{slot}");
    let type_label = match type_label.find('-') {
        Some(idx) => format!("{} #{}", &type_label[..idx], &type_label[idx + 1..]),
        None => type_label,
    };

    let colors_enabled = !quiet && std::env::var("HADC_NO_COLORS").is_err();
    let (status, color) = if running {
        ("OK", Color::Green)
    } else {
        ("FAILED", Color::Red)
    };

    format!(
        "{name}: {type_label}  [{}]",
        colorize(status, color, colors_enabled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_dashes() {
        assert_eq!(normalize_action("--start"), "start");
        assert_eq!(normalize_action("-status"), "status");
        assert_eq!(normalize_action("reload"), "reload");
    }

    #[test]
    fn pretty_print_formats_main_slot() {
        std::env::set_var("HADC_NO_COLORS", "1");
        let line = pretty_print("demo", Kind::Main, 1, true, false);
        assert_eq!(line, "demo: main #1  [OK]");
        std::env::remove_var("HADC_NO_COLORS");
    }

    #[test]
    fn pretty_print_reports_failure() {
        std::env::set_var("HADC_NO_COLORS", "1");
        let line = pretty_print("demo", Kind::Standby, 2, false, false);
        assert_eq!(line, "demo: standby #2  [FAILED]");
        std::env::remove_var("HADC_NO_COLORS");
    }

    #[test]
    fn unknown_action_lists_valid_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(
            crate::config::ConfigBuilder::new()
                .overlay_file(crate::config::ConfigFile {
                    name: Some("demo".into()),
                    program: Some("/bin/true".into()),
                    pid_dir: Some(tmp.path().to_path_buf()),
                    max_procs: Some(1),
                    ..Default::default()
                })
                .build()
                .unwrap(),
        );
        let payload: Arc<dyn Payload> = Arc::new(crate::worker::ExecPayload);
        let opts = InitFileOptions {
            hadc_bin: "hadc",
            config_path: "/etc/demo.toml",
            user_code: "",
        };
        let err = dispatch("bogus", &config, &payload, &opts).unwrap_err();
        assert!(err.to_string().contains("start"));
    }
}
