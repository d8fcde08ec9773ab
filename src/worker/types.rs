use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::logs::{AgentType, LogEntrySnapshot, SessionSnapshot};
use crate::matcher::ExactMatchProfiler;
use crate::tmux::TmuxWindow;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWorkerSearchOptions {
    pub tail_bytes: Option<u64>,
    pub rg_threads: Option<usize>,
    #[serde(default)]
    pub profile: bool,
}

/// A session with a log but no trustworthy window binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCandidate {
    pub session_id: String,
    pub log_file_path: PathBuf,
    pub project_path: Option<String>,
    pub agent_type: AgentType,
    /// Window the session was bound to before it went stale
    pub current_window: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWorkerRequest {
    pub id: String,
    pub windows: Vec<TmuxWindow>,
    pub max_logs_per_poll: usize,
    #[serde(default)]
    pub log_dirs: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub sessions: Vec<SessionSnapshot>,
    pub scrollback_lines: usize,
    #[serde(default)]
    pub min_tokens_for_match: Option<u64>,
    #[serde(default)]
    pub force_orphan_rematch: bool,
    #[serde(default)]
    pub orphan_candidates: Vec<OrphanCandidate>,
    #[serde(default)]
    pub search: Option<MatchWorkerSearchOptions>,
}

/// A log resolved to the key of the window it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMatch {
    pub log_path: PathBuf,
    pub tmux_window: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWorkerResult {
    pub id: String,
    pub entries: Vec<LogEntrySnapshot>,
    pub orphan_entries: Vec<LogEntrySnapshot>,
    pub scan_ms: f64,
    pub sort_ms: f64,
    pub match_ms: f64,
    pub match_window_count: usize,
    pub match_log_count: usize,
    /// Nothing needed matching, so the search never ran
    pub match_skipped: bool,
    pub matches: Vec<ResolvedMatch>,
    pub orphan_matches: Vec<ResolvedMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ExactMatchProfiler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchWorkerResponse {
    Result(MatchWorkerResult),
    Error { id: String, error: String },
}

impl MatchWorkerResponse {
    pub fn id(&self) -> &str {
        match self {
            MatchWorkerResponse::Result(result) => &result.id,
            MatchWorkerResponse::Error { id, .. } => id,
        }
    }
}
