//! POSIX shell quoting for strings that cross the ssh boundary.

/// Wraps `value` in single quotes so a POSIX shell reads it back as exactly
/// one word with no expansion. An embedded `'` becomes `'\''`.
pub fn shell_escape(value: &str) -> String {
    let escaped = value.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// Escapes every part individually and joins them with spaces.
pub fn join_escaped<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|part| shell_escape(part.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// True for names a shell accepts on the left of an assignment.
pub fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

/// Renders `KEY='value'` assignments for use in front of a remote command.
pub fn build_env_prefix<'a, I>(pairs: I) -> anyhow::Result<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parts = Vec::new();
    for (key, value) in pairs {
        if !is_shell_identifier(key) {
            anyhow::bail!("invalid environment variable name: {key:?}");
        }
        parts.push(format!("{key}={}", shell_escape(value)));
    }
    Ok(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::process::Command;

    fn shell_echo(word: &str) -> String {
        let script = format!("printf '%s' {word}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .output()
            .expect("sh");
        assert!(output.status.success());
        String::from_utf8(output.stdout).expect("utf8")
    }

    #[test]
    fn escapes_plain_and_quoted_values() {
        assert_eq!(shell_escape("abc"), "'abc'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn hostile_values_survive_the_shell() {
        for value in [
            "a b",
            "semi;colon",
            "$(whoami)",
            "`id`",
            "*",
            "it's",
            "'''",
            "back\\slash",
            "new\nline",
            "${HOME}",
        ] {
            assert_eq!(shell_echo(&shell_escape(value)), value);
        }
    }

    #[test]
    fn join_escaped_keeps_word_boundaries() {
        let joined = join_escaped(["ls", "-la", "my dir"]);
        assert_eq!(joined, "'ls' '-la' 'my dir'");
    }

    #[test]
    fn identifiers() {
        assert!(is_shell_identifier("RIGGER_DRY_RUN"));
        assert!(is_shell_identifier("_x1"));
        assert!(!is_shell_identifier("1X"));
        assert!(!is_shell_identifier("A-B"));
        assert!(!is_shell_identifier(""));
        assert!(!is_shell_identifier("A;rm"));
    }

    #[test]
    fn env_prefix_quotes_values_and_rejects_bad_keys() {
        let prefix = build_env_prefix([("A", "1"), ("B", "x y")]).expect("prefix");
        assert_eq!(prefix, "A='1' B='x y'");
        assert!(build_env_prefix([("A B", "1")]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn escape_round_trips_through_sh(value in "[^\\x00]{0,32}") {
            prop_assert_eq!(shell_echo(&shell_escape(&value)), value);
        }
    }
}
