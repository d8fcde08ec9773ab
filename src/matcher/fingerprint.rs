use crate::session::strip_ansi;

/// Shorter fragments are too common to tell windows apart
pub const MIN_FRAGMENT_CHARS: usize = 24;
const MAX_FRAGMENT_CHARS: usize = 160;
const MAX_FRAGMENTS: usize = 6;

/// Distinguishing fragments of a window's scrollback, newest first.
///
/// Logs store terminal text JSON-encoded, so each fragment is the longest
/// run of a line containing nothing JSON would escape (quotes, backslashes,
/// control characters). Leading prompt glyphs and bullets are dropped.
pub fn extract_fragments(scrollback: &str) -> Vec<String> {
    let clean = strip_ansi(scrollback);
    let mut fragments: Vec<String> = Vec::new();

    for line in clean.lines().rev() {
        let Some(run) = longest_literal_run(line) else {
            continue;
        };
        if run.chars().count() < MIN_FRAGMENT_CHARS || !is_mostly_text(run) {
            continue;
        }

        let fragment: String = run.chars().take(MAX_FRAGMENT_CHARS).collect();
        let fragment = fragment.trim_end().to_string();
        if !fragments.contains(&fragment) {
            fragments.push(fragment);
        }
        if fragments.len() == MAX_FRAGMENTS {
            break;
        }
    }

    fragments
}

fn longest_literal_run(line: &str) -> Option<&str> {
    line.split(|c: char| c == '"' || c == '\\' || c.is_control())
        .map(|run| run.trim_start_matches(|c: char| !c.is_alphanumeric()).trim_end())
        .max_by_key(|run| run.chars().count())
}

/// Rejects box drawing, spinners and other terminal chrome
fn is_mostly_text(run: &str) -> bool {
    let total = run.chars().count();
    let wordy = run
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .count();
    wordy * 2 >= total
}
