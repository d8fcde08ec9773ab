mod manager;
mod prompt;
mod terminal;

pub use manager::SessionManager;
pub use prompt::{detects_permission_prompt, strip_ansi, PROMPT_WINDOW_LINES};
pub use terminal::{PtyBridge, TerminalBridge, TerminalProxy};

#[cfg(test)]
pub(crate) use manager::tests::FakeBridge;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::logs::AgentType;
use crate::tmux::TmuxWindow;

/// Derived state of a tracked agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Not observed yet
    #[default]
    Unknown,
    /// Output seen within the inactivity period
    Working,
    /// A permission prompt is on screen
    NeedsInput,
    /// Quiet for longer than the inactivity period
    Idle,
    /// The bound window has closed
    Orphaned,
}

/// How the board came to know about a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// Window lives in the board's own tmux session
    Managed,
    /// Window lives in some other tmux session
    External,
    /// Created from a log that has no window
    Discovered,
}

/// Canonical record for one agent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// Live window the session is bound to
    pub window: Option<TmuxWindow>,
    /// Key of the window the session had before it was orphaned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_window: Option<String>,
    pub name: String,
    pub project_path: String,
    pub agent_type: AgentType,
    pub log_file_path: Option<PathBuf>,
    /// ms since epoch
    pub last_activity: u64,
    pub status: SessionStatus,
    /// ms since epoch
    pub created_at: u64,
    pub source: SessionSource,
    /// Log mtime at the last confirmed match
    pub last_matched_mtime: Option<u64>,
    /// Last output seen through a terminal attachment
    pub last_output_at: Option<u64>,
}

impl Session {
    /// Stable key of the bound window, if any
    pub fn window_key(&self) -> Option<&str> {
        self.window.as_ref().map(TmuxWindow::key)
    }

    fn touch(&mut self, at: u64) {
        self.last_activity = self.last_activity.max(at);
    }
}

/// Recompute a session's status from what the latest tick observed
pub fn derive_status(session: &Session, prompt_visible: bool, now: u64, idle_after_ms: u64) -> SessionStatus {
    if session.window.is_none() {
        return SessionStatus::Orphaned;
    }
    if prompt_visible {
        return SessionStatus::NeedsInput;
    }
    if session.last_activity == 0 {
        return SessionStatus::Unknown;
    }
    if now.saturating_sub(session.last_activity) < idle_after_ms {
        SessionStatus::Working
    } else {
        SessionStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(window: Option<&str>, last_activity: u64) -> Session {
        Session {
            id: "s1".to_string(),
            window: window.map(TmuxWindow::new),
            last_window: None,
            name: "api".to_string(),
            project_path: String::new(),
            agent_type: AgentType::Claude,
            log_file_path: None,
            last_activity,
            status: SessionStatus::Unknown,
            created_at: 0,
            source: SessionSource::External,
            last_matched_mtime: None,
            last_output_at: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        let live = session(Some("main:1"), 10_000);
        assert_eq!(derive_status(&live, false, 12_000, 5_000), SessionStatus::Working);
        assert_eq!(derive_status(&live, true, 12_000, 5_000), SessionStatus::NeedsInput);
        assert_eq!(derive_status(&live, false, 20_000, 5_000), SessionStatus::Idle);

        let closed = session(None, 10_000);
        assert_eq!(derive_status(&closed, true, 12_000, 5_000), SessionStatus::Orphaned);

        let unseen = session(Some("main:2"), 0);
        assert_eq!(derive_status(&unseen, false, 12_000, 5_000), SessionStatus::Unknown);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::NeedsInput).unwrap();
        assert_eq!(json, "\"needs_input\"");
    }
}
