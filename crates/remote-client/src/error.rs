use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote side ran but exited non-zero.
    #[error("{label} failed{}{}{}", exit_suffix(.code), detail_suffix(.detail), hint_suffix(.detail))]
    CommandFailed {
        label: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("cannot reach {destination}{}{}", detail_suffix(.detail), hint_suffix(.detail))]
    Unreachable { destination: String, detail: String },
}

impl RemoteError {
    pub fn is_auth_failure(&self) -> bool {
        let detail = match self {
            RemoteError::CommandFailed { detail, .. } => detail,
            RemoteError::Unreachable { detail, .. } => detail,
        };
        auth_hint(detail).is_some()
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit {code})"),
        None => " (terminated by signal)".to_string(),
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

fn hint_suffix(detail: &str) -> String {
    match auth_hint(detail) {
        Some(hint) => format!("\n{hint}"),
        None => String::new(),
    }
}

/// True when ssh output reads like a rejected login rather than a network
/// or remote command failure.
pub fn looks_like_auth_failure(detail: &str) -> bool {
    auth_hint(detail).is_some()
}

/// Maps ssh's authentication chatter to an actionable hint.
pub(crate) fn auth_hint(detail: &str) -> Option<&'static str> {
    let detail = detail.to_lowercase();
    if detail.contains("keyboard-interactive")
        || detail.contains("verification code")
        || detail.contains("two-factor")
    {
        return Some(
            "ssh requires keyboard-interactive/2FA, which rigger cannot answer. Use key authentication.",
        );
    }
    if detail.contains("permission denied")
        || detail.contains("authentication failed")
        || detail.contains("no supported authentication methods available")
        || detail.contains("too many authentication failures")
    {
        return Some(
            "ssh authentication failed. Pass --identity or run `rigger provision` to install your key.",
        );
    }
    None
}
