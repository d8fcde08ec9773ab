use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime configuration, read once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// tmux session that holds windows created by the board itself
    pub tmux_session: String,
    /// Interval between poll ticks
    pub refresh_interval: Duration,
    /// Root of Claude Code's per-project transcripts
    pub claude_projects_dir: PathBuf,
    /// Root of Codex rollout files
    pub codex_sessions_dir: PathBuf,
    /// Maximum number of log files considered per poll
    pub log_poll_max: usize,
    /// Trailing scrollback lines captured per window for matching
    pub scrollback_lines: usize,
    /// Logs with a smaller token estimate are never matched
    pub min_tokens_for_match: u64,
    /// Thread budget handed to ripgrep; `None` derives one from the CPU count
    pub rg_threads: Option<usize>,
    /// Trailing bytes of each log searched for a fingerprint
    pub tail_bytes: Option<u64>,
    /// Collect per-pass matcher timings
    pub match_profile: bool,
    /// A worker response arriving later than this is ignored
    pub worker_timeout: Duration,
    /// Sessions without activity for this long are idle
    pub idle_after: Duration,
    /// Orphaned sessions are dropped after this long without activity
    pub orphan_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self {
            tmux_session: "agentboard".to_string(),
            refresh_interval: Duration::from_millis(2_000),
            claude_projects_dir: home.join(".claude").join("projects"),
            codex_sessions_dir: home.join(".codex").join("sessions"),
            log_poll_max: 25,
            scrollback_lines: 500,
            min_tokens_for_match: 10,
            rg_threads: None,
            tail_bytes: None,
            match_profile: false,
            worker_timeout: Duration::from_millis(15_000),
            idle_after: Duration::from_millis(30_000),
            orphan_grace: Duration::from_millis(600_000),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(session) = lookup("AGENT_BOARD_TMUX_SESSION").filter(|s| !s.trim().is_empty()) {
            config.tmux_session = session.trim().to_string();
        }
        if let Some(dir) = lookup("CLAUDE_CONFIG_DIR").filter(|s| !s.is_empty()) {
            config.claude_projects_dir = PathBuf::from(dir).join("projects");
        }
        if let Some(dir) = lookup("CODEX_HOME").filter(|s| !s.is_empty()) {
            config.codex_sessions_dir = PathBuf::from(dir).join("sessions");
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "AGENT_BOARD_REFRESH_MS") {
            config.refresh_interval = Duration::from_millis(ms.max(250));
        }
        if let Some(max) = parse_var::<usize>(&lookup, "AGENT_BOARD_LOG_POLL_MAX") {
            config.log_poll_max = max.max(1);
        }
        if let Some(lines) = parse_var::<usize>(&lookup, "AGENT_BOARD_SCROLLBACK_LINES") {
            config.scrollback_lines = lines.max(1);
        }
        if let Some(tokens) = parse_var::<u64>(&lookup, "AGENT_BOARD_MIN_TOKENS") {
            config.min_tokens_for_match = tokens;
        }
        if let Some(threads) = parse_var::<usize>(&lookup, "AGENT_BOARD_RG_THREADS") {
            config.rg_threads = Some(threads.max(1));
        }
        if let Some(bytes) = parse_var::<u64>(&lookup, "AGENT_BOARD_TAIL_BYTES") {
            config.tail_bytes = Some(bytes.max(1));
        }
        if let Some(profile) = lookup("AGENT_BOARD_MATCH_PROFILE") {
            config.match_profile = matches!(profile.trim(), "1" | "true" | "yes");
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "AGENT_BOARD_WORKER_TIMEOUT_MS") {
            config.worker_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "AGENT_BOARD_IDLE_AFTER_MS") {
            config.idle_after = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "AGENT_BOARD_ORPHAN_GRACE_MS") {
            config.orphan_grace = Duration::from_millis(ms);
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}
