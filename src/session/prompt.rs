use once_cell::sync::Lazy;
use regex::Regex;

/// Only this many trailing lines of a screen count as "current"
pub const PROMPT_WINDOW_LINES: usize = 30;

/// ANSI escape sequences: CSI, OSC (BEL or ST terminated), charset selection,
/// single-character escapes, then any stray ESC
static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()][A-Za-z0-9]",
        r"|\x1b[=>MNOP78c]",
        r"|\x1b",
    ))
    .unwrap()
});

/// Interactive approval prompts printed by agent CLIs
static RE_PERMISSION_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?mi)(^\s*(?:\S{1,3}\s+)?\S{0,3}\s*1\.\s*Yes\b",
        r"|Do you want to proceed\?",
        r"|Do you want to make this edit",
        r"|Do you want to create",
        r"|Do you want to allow",
        r"|Would you like to run the following command",
        r"|Allow (?:once|always)\b",
        r"|\[y/n\]",
        r"|\(y/n\)",
        r"|Press Enter to confirm)",
    ))
    .unwrap()
});

/// Remove ANSI escape sequences from terminal output
pub fn strip_ansi(text: &str) -> String {
    RE_ANSI.replace_all(text, "").into_owned()
}

/// Whether the recent part of a screen shows a permission prompt
pub fn detects_permission_prompt(screen: &str) -> bool {
    let clean = strip_ansi(screen);
    let lines: Vec<&str> = clean.trim_end().lines().rev().take(PROMPT_WINDOW_LINES).collect();
    let recent = lines.into_iter().rev().collect::<Vec<_>>().join("\n");

    RE_PERMISSION_PROMPT.is_match(&recent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_prompts_with_ansi_escapes() {
        let content = ["some output", "\u{1b}[31m❯ 1. Yes\u{1b}[0m", "2. No"].join("\n");
        assert!(detects_permission_prompt(&content));

        let mangled = ["some output", "\u{1b}[31mâ¯ 1. Yes\u{1b}[0m", "2. No"].join("\n");
        assert!(detects_permission_prompt(&mangled));
    }

    #[test]
    fn test_matches_styles_inside_a_phrase() {
        let content = "Do you \u{1b}[1mwant\u{1b}[22m to proceed?\n";
        assert!(detects_permission_prompt(content));
    }

    #[test]
    fn test_ignores_prompts_outside_recent_window() {
        let lines: Vec<String> = (0..31)
            .map(|i| {
                if i == 0 {
                    "Do you want to proceed?".to_string()
                } else {
                    format!("line-{i}")
                }
            })
            .collect();
        assert!(!detects_permission_prompt(&lines.join("\n")));

        // Still inside the window one line earlier
        assert!(detects_permission_prompt(&lines[..30].join("\n")));
    }

    #[test]
    fn test_trailing_blank_screen_rows_do_not_push_prompts_out() {
        let screen = format!("Do you want to proceed?\n❯ 1. Yes\n{}", "\n".repeat(40));
        assert!(detects_permission_prompt(&screen));
    }

    #[test]
    fn test_matches_choices_inside_a_box() {
        let content = [
            "╭──────────────────────────────╮",
            "│ Do you want to run tests?     │",
            "│ ❯ 1. Yes                      │",
            "│   2. No                       │",
            "╰──────────────────────────────╯",
        ]
        .join("\n");
        assert!(detects_permission_prompt(&content));
        assert!(detects_permission_prompt("│ > 1. Yes, and don't ask again"));
    }

    #[test]
    fn test_no_prompt() {
        let content = ["hello", "world", "done"].join("\n");
        assert!(!detects_permission_prompt(&content));
    }

    #[test]
    fn test_codex_and_yes_no_prompts() {
        assert!(detects_permission_prompt(
            "Would you like to run the following command?\n  cargo test"
        ));
        assert!(detects_permission_prompt("Overwrite config? [y/N]"));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[1;32mok\u{1b}[0m"), "ok");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}text"), "text");
    }
}
