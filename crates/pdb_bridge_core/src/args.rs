//! Validation and tokenizing of the free-form argument string passed through to
//! the debuggee (or pytest).

use crate::{DebugError, Result};

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '<', '>', '\n', '\r'];

/// Rejects shell metacharacters, then splits with POSIX shell quoting rules.
pub fn sanitize_args(raw: &str) -> Result<Vec<String>> {
    if let Some(c) = raw.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(DebugError::InvalidArgument(format!(
            "argument string contains disallowed character {c:?}"
        )));
    }

    shlex::split(raw).ok_or_else(|| {
        DebugError::InvalidArgument(format!("unbalanced quotes in arguments: {raw}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_with_shell_quoting() {
        let args = sanitize_args(r#"--name "hello world" -k 'test_a or test_b' -v"#)
            .expect("quoted args should parse");
        assert_eq!(
            args,
            vec!["--name", "hello world", "-k", "test_a or test_b", "-v"]
        );
    }

    #[test]
    fn empty_input_yields_no_arguments() {
        assert!(sanitize_args("").expect("empty is valid").is_empty());
        assert!(sanitize_args("   ").expect("blank is valid").is_empty());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for raw in ["a; rm -rf /", "x && y", "a | b", "$(whoami)", "`id`", "> out", "a\nb"] {
            let err = sanitize_args(raw).expect_err("metacharacters must be rejected");
            assert!(matches!(err, DebugError::InvalidArgument(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn rejects_unbalanced_quotes() {
        let err = sanitize_args("--name 'open").expect_err("unbalanced quote must fail");
        assert!(err.to_string().contains("unbalanced quotes"), "unexpected error: {err}");
    }
}
