//! Init-script emission (spec §4.5, §6): a trivial `[% KEY %]` substitution
//! over a built-in template. No conditionals in the template engine —
//! conditional content (the user code block) is pre-rendered by the caller
//! before substitution runs.

use std::collections::HashMap;

const INIT_TEMPLATE: &str = include_str!("../templates/init.sh.tpl");

/// Render `INIT_TEMPLATE`, replacing every `[% KEY %]` occurrence with the
/// value from `vars`. Keys present in the template but absent from `vars`
/// are replaced with the empty string.
pub fn render_init_script(vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(INIT_TEMPLATE.len());
    let mut rest = INIT_TEMPLATE;

    while let Some(start) = rest.find("[%") {
        out.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        match rest.find("%]") {
            Some(end) => {
                let key = rest[..end].trim();
                out.push_str(vars.get(key).map(String::as_str).unwrap_or(""));
                rest = &rest[end + 2..];
            }
            None => {
                // Unterminated tag: emit verbatim and stop substituting.
                out.push_str("[%");
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Build the substitution map for a given config, following spec §6's
/// described structure: LSB headers, optional `CONFIG` sourcing, optional
/// user code block, `SCRIPT $1` dispatch.
pub fn init_script_vars<'a>(
    name: &'a str,
    hadc_bin: &'a str,
    config_path: &'a str,
    user_code: &'a str,
) -> HashMap<&'static str, String> {
    let mut vars = HashMap::new();
    vars.insert("NAME", name.to_string());
    vars.insert("HADC_BIN", hadc_bin.to_string());
    vars.insert("CONFIG", config_path.to_string());
    vars.insert("USER_CODE", user_code.to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_all_keys() {
        let vars = init_script_vars("demo", "/usr/bin/hadc", "/etc/demo.toml", "");
        let rendered = render_init_script(&vars);
        assert!(rendered.contains("NAME=\"demo\""));
        assert!(rendered.contains("HADC_BIN=\"/usr/bin/hadc\""));
        assert!(rendered.contains("CONFIG=\"/etc/demo.toml\""));
        assert!(!rendered.contains("[%"));
    }

    #[test]
    fn missing_key_becomes_empty_string() {
        let vars = HashMap::new();
        let rendered = render_init_script(&vars);
        assert!(rendered.contains("NAME=\"\""));
    }
}
