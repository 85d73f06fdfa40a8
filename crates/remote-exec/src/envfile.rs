//! Local `KEY=value` files handed to remote subcommands.
//!
//! Format: one assignment per line, blank lines and `#` comments ignored,
//! an optional `export ` prefix, and one pair of surrounding single or
//! double quotes stripped from the value. `${VAR}` in unquoted and
//! double-quoted values expands once, against keys loaded earlier in the
//! file and then the process environment; unknown names expand to nothing.
//! Single-quoted values are taken literally.

use std::path::{Path, PathBuf};

use system_utils::shell::{is_shell_identifier, shell_escape};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("failed to read env file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected KEY=value")]
    MissingEquals { line: usize },

    #[error("line {line}: {key:?} is not a valid variable name")]
    InvalidKey { line: usize, key: String },
}

/// Reads and parses `path`, expanding against the process environment.
pub fn load(path: &Path) -> Result<Vec<(String, String)>, EnvFileError> {
    let contents = std::fs::read_to_string(path).map_err(|source| EnvFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents, |name| std::env::var(name).ok())
}

/// Parses env-file text. Later assignments to the same key replace earlier
/// ones but keep the first position.
pub fn parse<F>(contents: &str, process_env: F) -> Result<Vec<(String, String)>, EnvFileError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut vars: Vec<(String, String)> = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(EnvFileError::MissingEquals { line: line_no });
        };
        let key = key.trim();
        if !is_shell_identifier(key) {
            return Err(EnvFileError::InvalidKey {
                line: line_no,
                key: key.to_string(),
            });
        }
        let value = value.trim();
        let value = match unquote(value) {
            (inner, Quote::Single) => inner.to_string(),
            (inner, _) => expand(inner, &vars, &process_env),
        };
        match vars.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1 = value,
            None => vars.push((key.to_string(), value)),
        }
    }
    Ok(vars)
}

/// One `KEY='value'` line per variable, safe to `source` from bash.
pub fn render(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(key, value)| format!("{key}={}\n", shell_escape(value)))
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

fn unquote(value: &str) -> (&str, Quote) {
    if value.len() >= 2 {
        if value.starts_with('\'') && value.ends_with('\'') {
            return (&value[1..value.len() - 1], Quote::Single);
        }
        if value.starts_with('"') && value.ends_with('"') {
            return (&value[1..value.len() - 1], Quote::Double);
        }
    }
    (value, Quote::None)
}

fn expand<F>(value: &str, loaded: &[(String, String)], process_env: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        let resolved = loaded
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .or_else(|| process_env(name))
            .unwrap_or_default();
        out.push_str(&resolved);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
