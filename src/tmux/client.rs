use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::process::Command;

use super::TmuxWindow;
use crate::matcher::ScrollbackSource;

/// Fields requested from `list-windows`, tab separated
const WINDOW_FORMAT: &str = "#{session_name}\t#{window_index}\t#{window_id}\t#{window_name}\t#{pane_current_path}\t#{window_activity}\t#{pane_current_command}";

/// Client for interacting with tmux via CLI
#[derive(Debug, Clone)]
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self {
            tmux_path: "tmux".to_string(),
        }
    }

    /// Check if tmux server is running
    pub async fn is_server_running(&self) -> bool {
        Command::new(&self.tmux_path)
            .arg("list-sessions")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// List every window across all tmux sessions
    pub async fn list_windows(&self) -> Result<Vec<TmuxWindow>> {
        let output = Command::new(&self.tmux_path)
            .args(["list-windows", "-a", "-F", WINDOW_FORMAT])
            .output()
            .await
            .context("Failed to execute tmux list-windows")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            anyhow::bail!("tmux list-windows failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_window_line).collect())
    }

    /// Capture the visible screen of a window's active pane
    pub async fn capture_screen(&self, target: &str) -> Result<String> {
        let output = Command::new(&self.tmux_path)
            .args(["capture-pane", "-p", "-J", "-t", target])
            .output()
            .await
            .context("Failed to capture pane")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("tmux capture-pane failed for {}: {}", target, stderr);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Get the command to attach to a window (for external execution)
    pub fn attach_command(&self, target: &str) -> Vec<String> {
        vec![
            self.tmux_path.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            target.to_string(),
        ]
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrollbackSource for TmuxClient {
    /// Blocking capture of the trailing `lines` of history, used off the control loop
    fn capture(&self, target: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines);
        let output = std::process::Command::new(&self.tmux_path)
            .args(["capture-pane", "-p", "-J", "-S", &start, "-t", target])
            .stderr(Stdio::piped())
            .output()
            .context("Failed to capture pane history")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("tmux capture-pane failed for {}: {}", target, stderr);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_window_line(line: &str) -> Option<TmuxWindow> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 7 {
        return None;
    }

    let session_name = parts[0].to_string();
    let target = format!("{}:{}", session_name, parts[1]);
    // tmux reports activity in seconds
    let activity = parts[5].parse::<u64>().unwrap_or(0) * 1000;

    Some(TmuxWindow {
        target,
        window_id: parts[2].to_string(),
        session_name,
        name: parts[3].to_string(),
        pane_path: parts[4].to_string(),
        command: parts[6].to_string(),
        activity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_line() {
        let line = "agentboard\t2\t@7\tapi\t/work/api\t1700000000\tclaude";
        let window = parse_window_line(line).unwrap();
        assert_eq!(window.target, "agentboard:2");
        assert_eq!(window.window_id, "@7");
        assert_eq!(window.session_name, "agentboard");
        assert_eq!(window.pane_path, "/work/api");
        assert_eq!(window.command, "claude");
        assert_eq!(window.activity, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(parse_window_line("agentboard\t2").is_none());
    }

    #[test]
    fn test_attach_command() {
        let client = TmuxClient::new();
        assert_eq!(
            client.attach_command("agentboard:1"),
            vec!["tmux", "attach-session", "-t", "agentboard:1"]
        );
    }
}
