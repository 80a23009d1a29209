//! Maps shell command text onto destructive operation types.

use regex::Regex;
use std::sync::LazyLock;

struct Pattern {
    operation_type: &'static str,
    regex: Regex,
}

static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    [
        (
            "terminal_recursive_remove",
            r#"(?:^|[;&|(`'"]|\s)(?:sudo\s+)?(?:\S*/)?rm['"]?\s+(?:[^;&|]*\s)?-[a-zA-Z]*[rR]"#,
        ),
        (
            "terminal_recursive_remove",
            r#"(?:^|[;&|(`'"]|\s)(?:sudo\s+)?(?:\S*/)?rm['"]?\s+(?:[^;&|]*\s)?--recursive\b"#,
        ),
        (
            "git_force_push",
            r"\bgit\s+(?:[^;&|]*\s)?push\s+(?:[^;&|]*\s)?(?:-[a-zA-Z]*f\b|--force\b|--force-with-lease\b|\+\S)",
        ),
        ("git_reset_hard", r"\bgit\s+(?:[^;&|]*\s)?reset\s+(?:[^;&|]*\s)?--hard\b"),
    ]
    .into_iter()
    .filter_map(|(operation_type, pattern)| match Regex::new(pattern) {
        Ok(regex) => Some(Pattern {
            operation_type,
            regex,
        }),
        Err(e) => {
            tracing::error!(operation_type, error = %e, "invalid destructive command pattern");
            None
        }
    })
    .collect()
});

/// Returns the destructive operation type `command` amounts to, if any.
pub fn classify_command(command: &str) -> Option<&'static str> {
    PATTERNS
        .iter()
        .find(|p| p.regex.is_match(command))
        .map(|p| p.operation_type)
}

/// Operation type a terminal command should be checked under.
pub fn terminal_operation_type(command: &str) -> &'static str {
    classify_command(command).unwrap_or("terminal_command")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_removes_are_destructive() {
        for cmd in [
            "rm -rf build",
            "rm -r target",
            "sudo rm -Rf /tmp/x",
            "cd app && rm -fr node_modules",
            "rm --recursive dist",
            "rm -v -r out",
            "/bin/rm -rf build",
            "bash -c 'rm -rf build'",
            "\"rm\" -rf build",
            "sh -c \"/usr/bin/rm --recursive cache\"",
        ] {
            assert_eq!(
                classify_command(cmd),
                Some("terminal_recursive_remove"),
                "{cmd}"
            );
        }
    }

    #[test]
    fn git_history_rewrites_are_destructive() {
        assert_eq!(classify_command("git push -f origin main"), Some("git_force_push"));
        assert_eq!(
            classify_command("git push origin main --force-with-lease"),
            Some("git_force_push")
        );
        assert_eq!(classify_command("git push origin +main"), Some("git_force_push"));
        assert_eq!(classify_command("git push -uf origin main"), Some("git_force_push"));
        assert_eq!(classify_command("git reset --hard HEAD~1"), Some("git_reset_hard"));
    }

    #[test]
    fn ordinary_commands_are_not_flagged() {
        for cmd in [
            "rm notes.txt",
            "cargo test",
            "git push origin main",
            "git push --follow-tags origin main",
            "/usr/bin/rm notes.txt",
            "npm run format",
            "git reset --soft HEAD~1",
            "echo firm",
        ] {
            assert_eq!(classify_command(cmd), None, "{cmd}");
        }
        assert_eq!(terminal_operation_type("ls -la"), "terminal_command");
    }
}
