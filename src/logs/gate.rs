use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::LogEntrySnapshot;

/// What the gate knows about a session that already owns a log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub log_file_path: PathBuf,
    /// Window the session is currently bound to
    pub current_window: Option<String>,
    /// Log mtime at the last confirmed match
    pub last_matched_mtime: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GateOptions {
    pub min_tokens: u64,
}

/// Pick the entries that deserve a matching attempt this cycle
pub fn select_entries_needing_match(
    entries: &[LogEntrySnapshot],
    known_sessions: &[SessionSnapshot],
    options: GateOptions,
) -> Vec<LogEntrySnapshot> {
    let by_log: HashMap<&PathBuf, &SessionSnapshot> = known_sessions
        .iter()
        .map(|session| (&session.log_file_path, session))
        .collect();

    entries
        .iter()
        .filter(|entry| !entry.is_subagent)
        .filter(|entry| options.min_tokens == 0 || entry.log_token_count >= options.min_tokens)
        .filter(|entry| match by_log.get(&entry.log_path) {
            None => true,
            Some(session) => is_stale(session, entry),
        })
        .cloned()
        .collect()
}

fn is_stale(session: &SessionSnapshot, entry: &LogEntrySnapshot) -> bool {
    if session.current_window.is_none() {
        return true;
    }
    match session.last_matched_mtime {
        Some(matched) => entry.mtime > matched,
        None => true,
    }
}
