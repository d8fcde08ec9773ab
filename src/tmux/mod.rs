mod client;

pub use client::TmuxClient;

use serde::{Deserialize, Serialize};

/// A live tmux window, as listed on one poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TmuxWindow {
    /// Target usable with `-t` (e.g. "agentboard:3")
    pub target: String,
    /// Window ID (e.g. "@12")
    pub window_id: String,
    /// Owning tmux session name
    pub session_name: String,
    /// Window name
    pub name: String,
    /// Working directory of the active pane
    pub pane_path: String,
    /// Command running in the active pane
    pub command: String,
    /// Last activity, ms since epoch
    pub activity: u64,
}

impl TmuxWindow {
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let session_name = target.split(':').next().unwrap_or_default().to_string();
        Self {
            window_id: String::new(),
            name: target.clone(),
            session_name,
            target,
            pane_path: String::new(),
            command: String::new(),
            activity: 0,
        }
    }

    /// Stable identity: the window ID survives renumbering, the target is the fallback
    pub fn key(&self) -> &str {
        if self.window_id.is_empty() {
            &self.target
        } else {
            &self.window_id
        }
    }
}
