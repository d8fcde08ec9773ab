mod discovery;
mod gate;
mod poll;

pub use discovery::{
    classify_agent, is_subagent_log, list_log_files, log_times, read_log_head, LogDirectories,
    LogHead, LogTimes,
};
pub use gate::{select_entries_needing_match, GateOptions, SessionSnapshot};
pub use poll::{collect_batch, estimate_tokens, LogBatch};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which agent CLI wrote a log or runs in a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    Unknown,
    Claude,
    Codex,
    Other,
}

impl AgentType {
    /// Guess the agent from the command running in a pane
    pub fn from_command(command: &str) -> Self {
        let base = command.rsplit('/').next().unwrap_or(command).to_lowercase();
        match base.as_str() {
            "claude" => AgentType::Claude,
            "codex" => AgentType::Codex,
            "gemini" | "opencode" | "aider" | "amp" | "cursor-agent" => AgentType::Other,
            _ => AgentType::Unknown,
        }
    }
}

/// One log file as seen by a single poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntrySnapshot {
    pub log_path: PathBuf,
    /// Modification time, ms since epoch
    pub mtime: u64,
    /// Creation time, ms since epoch (mtime where unsupported)
    pub birthtime: u64,
    pub session_id: Option<String>,
    pub project_path: Option<String>,
    pub agent_type: AgentType,
    pub is_subagent: bool,
    pub log_token_count: u64,
}

/// Milliseconds since the unix epoch
pub fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current time in milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    epoch_ms(SystemTime::now())
}
