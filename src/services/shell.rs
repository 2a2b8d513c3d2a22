//! Shell quoting for commands sent to an environment.

use uuid::Uuid;

/// Quote `s` for a POSIX shell.
///
/// Plain words pass through; anything else is wrapped in single quotes with
/// embedded quotes written as `'\''`.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Command that writes `contents` to `path` through a quoted heredoc.
///
/// The delimiter is random so patch text cannot terminate it early.
pub fn write_file_command(path: &str, contents: &str) -> String {
    let delimiter = format!("PATCHGRADE_EOF_{}", Uuid::new_v4().simple());
    let mut body = contents.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!("cat > {} <<'{delimiter}'\n{body}{delimiter}\n", quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_unquoted() {
        assert_eq!(quote("tests/test_x.py::test_a"), "tests/test_x.py::test_a");
    }

    #[test]
    fn test_special_chars_quoted() {
        assert_eq!(quote("test_a[1-2]"), "'test_a[1-2]'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("test_x (mod.Class)"), "'test_x (mod.Class)'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_write_file_command_terminates_body() {
        let cmd = write_file_command("/tmp/s/model.patch", "--- a/x\n+++ b/x");
        let first = cmd.lines().next().unwrap();
        assert!(first.starts_with("cat > /tmp/s/model.patch <<'PATCHGRADE_EOF_"));
        let delimiter = first.rsplit("<<'").next().unwrap().trim_end_matches('\'');
        assert!(cmd.ends_with(&format!("+++ b/x\n{delimiter}\n")));
    }
}
