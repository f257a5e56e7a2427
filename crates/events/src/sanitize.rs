//! Log line sanitising.
//!
//! Job bodies and child processes emit terminal-flavored output (ANSI color,
//! carriage-return progress bars). Lines are cleaned before they enter the
//! bus so records and the persisted log stay plain text.

use std::sync::LazyLock;

use regex::Regex;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI regex"));

static CTRL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0B-\x1F\u{7F}-\u{9F}]").expect("valid control-char regex")
});

/// Strip ANSI escape sequences and control characters, then trim.
///
/// Returns an empty string for lines that were pure decoration.
pub fn clean_log_line(line: &str) -> String {
    let without_ansi = ANSI_RE.replace_all(line, "");
    CTRL_RE.replace_all(&without_ansi, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_pass_through() {
        assert_eq!(clean_log_line("epoch 3/10 loss=0.52"), "epoch 3/10 loss=0.52");
    }

    #[test]
    fn strips_ansi_color_codes() {
        assert_eq!(clean_log_line("\x1b[32mok\x1b[0m done"), "ok done");
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(clean_log_line("a\rb\x07c"), "abc");
    }

    #[test]
    fn keeps_tabs() {
        assert_eq!(clean_log_line("col1\tcol2"), "col1\tcol2");
    }

    #[test]
    fn decoration_only_line_becomes_empty() {
        assert_eq!(clean_log_line("\x1b[2K\r"), "");
    }
}
