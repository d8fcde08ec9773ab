use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use super::{epoch_ms, AgentType};
use crate::config::Config;

/// Path conventions each agent writes its transcripts under, checked in order
const AGENT_PATH_CONVENTIONS: &[(&str, AgentType)] = &[
    ("/.claude/projects/", AgentType::Claude),
    ("/.codex/sessions/", AgentType::Codex),
];

const HEAD_MAX_LINES: usize = 64;
const HEAD_MAX_BYTES: u64 = 64 * 1024;
const MAX_WALK_DEPTH: usize = 6;

/// The per-agent log roots the board knows about
#[derive(Debug, Clone)]
pub struct LogDirectories {
    roots: Vec<(PathBuf, AgentType)>,
    overrides: Option<Vec<PathBuf>>,
}

impl LogDirectories {
    pub fn new(claude_projects_dir: PathBuf, codex_sessions_dir: PathBuf) -> Self {
        Self {
            roots: vec![
                (claude_projects_dir, AgentType::Claude),
                (codex_sessions_dir, AgentType::Codex),
            ],
            overrides: None,
        }
    }

    /// Search an explicit set of directories instead of the agent roots
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.overrides = Some(dirs);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.claude_projects_dir.clone(),
            config.codex_sessions_dir.clone(),
        )
    }

    /// Directories to search for session logs, one per supported agent
    pub fn search_directories(&self) -> Vec<PathBuf> {
        if let Some(overrides) = &self.overrides {
            return overrides.clone();
        }
        let mut dirs: Vec<PathBuf> = Vec::with_capacity(self.roots.len());
        for (root, _) in &self.roots {
            if !dirs.contains(root) {
                dirs.push(root.clone());
            }
        }
        dirs
    }

    /// Classify a log path, preferring configured roots over naming conventions
    pub fn classify(&self, path: &Path) -> AgentType {
        for (root, agent) in &self.roots {
            if !root.as_os_str().is_empty() && path.starts_with(root) {
                return *agent;
            }
        }
        classify_agent(path)
    }
}

/// Classify a log path by the agent's directory convention; first match wins
pub fn classify_agent(path: &Path) -> AgentType {
    let normalized = path.to_string_lossy().replace('\\', "/").to_lowercase();
    AGENT_PATH_CONVENTIONS
        .iter()
        .find(|(pattern, _)| normalized.contains(pattern))
        .map(|(_, agent)| *agent)
        .unwrap_or(AgentType::Unknown)
}

/// Whether a log belongs to a sub-agent spawned by a parent session
pub fn is_subagent_log(path: &Path, agent: AgentType) -> bool {
    match agent {
        AgentType::Claude => is_claude_subagent(path),
        AgentType::Codex => read_log_head(path, AgentType::Codex)
            .map(|head| head.is_subagent)
            .unwrap_or(false),
        _ => false,
    }
}

fn is_claude_subagent(path: &Path) -> bool {
    let in_subagents_dir = path
        .components()
        .any(|c| c.as_os_str() == "subagents");
    let agent_named = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with("agent-"))
        .unwrap_or(false);
    in_subagents_dir || agent_named
}

/// File times in ms since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTimes {
    pub mtime: u64,
    pub birthtime: u64,
}

/// Stat a log file; `None` if it has vanished or cannot be read
pub fn log_times(path: &Path) -> Option<LogTimes> {
    let metadata = std::fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    let mtime = epoch_ms(metadata.modified().ok()?);
    let birthtime = metadata.created().map(epoch_ms).unwrap_or(mtime);
    Some(LogTimes { mtime, birthtime })
}

/// Every `*.jsonl` file below the given directories; missing directories yield nothing
pub fn list_log_files(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "log directory missing, skipping");
            continue;
        }
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .max_depth(MAX_WALK_DEPTH)
            .into_iter()
            .filter_map(|entry| entry.ok());
        for entry in walker {
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "jsonl")
            {
                files.push(entry.into_path());
            }
        }
    }
    files
}

/// Identity details found near the top of a log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHead {
    pub session_id: Option<String>,
    pub project_path: Option<String>,
    pub is_subagent: bool,
}

/// Read the first records of a log for its session id and working directory
pub fn read_log_head(path: &Path, agent: AgentType) -> Option<LogHead> {
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file.take(HEAD_MAX_BYTES));
    let mut head = LogHead::default();

    for line in reader.lines().take(HEAD_MAX_LINES) {
        let Ok(line) = line else { break };
        let Ok(record) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        match agent {
            AgentType::Codex => {
                if record.get("type").and_then(Value::as_str) == Some("session_meta") {
                    let payload = record.get("payload").unwrap_or(&Value::Null);
                    head.session_id = string_field(payload, "id");
                    head.project_path = string_field(payload, "cwd");
                    head.is_subagent = payload
                        .get("source")
                        .and_then(Value::as_object)
                        .is_some_and(|source| source.contains_key("subagent"));
                    break;
                }
            }
            _ => {
                if head.session_id.is_none() {
                    head.session_id = string_field(&record, "sessionId");
                }
                if head.project_path.is_none() {
                    head.project_path = string_field(&record, "cwd");
                }
                if head.session_id.is_some() && head.project_path.is_some() {
                    break;
                }
            }
        }
    }

    if head.session_id.is_none() {
        head.session_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string());
    }
    Some(head)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_classify_by_convention() {
        let claude = Path::new("/home/me/.claude/projects/-work-app/abc.jsonl");
        let codex = Path::new("/home/me/.codex/sessions/2025/01/02/rollout-x.jsonl");
        let other = Path::new("/tmp/session.jsonl");
        assert_eq!(classify_agent(claude), AgentType::Claude);
        assert_eq!(classify_agent(codex), AgentType::Codex);
        assert_eq!(classify_agent(other), AgentType::Unknown);
    }

    #[test]
    fn test_classify_prefers_configured_roots() {
        let dirs = LogDirectories::new(PathBuf::from("/data/claude"), PathBuf::from("/data/codex"));
        assert_eq!(dirs.classify(Path::new("/data/codex/a.jsonl")), AgentType::Codex);
        assert_eq!(dirs.classify(Path::new("/data/claude/p/a.jsonl")), AgentType::Claude);
        assert_eq!(dirs.classify(Path::new("/data/other/a.jsonl")), AgentType::Unknown);
    }

    #[test]
    fn test_claude_subagent_paths() {
        let nested = Path::new("/h/.claude/projects/p/abc/subagents/agent-1.jsonl");
        let top = Path::new("/h/.claude/projects/p/abc.jsonl");
        assert!(is_subagent_log(nested, AgentType::Claude));
        assert!(!is_subagent_log(top, AgentType::Claude));
    }

    #[test]
    fn test_codex_head_and_subagent() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("rollout-parent.jsonl");
        let child = dir.path().join("rollout-child.jsonl");
        fs::write(
            &parent,
            "{\"type\":\"session_meta\",\"payload\":{\"id\":\"p-1\",\"cwd\":\"/work/app\",\"source\":\"cli\"}}\n",
        )
        .unwrap();
        fs::write(
            &child,
            "{\"type\":\"session_meta\",\"payload\":{\"id\":\"c-1\",\"source\":{\"subagent\":\"review\"}}}\n",
        )
        .unwrap();

        let head = read_log_head(&parent, AgentType::Codex).unwrap();
        assert_eq!(head.session_id.as_deref(), Some("p-1"));
        assert_eq!(head.project_path.as_deref(), Some("/work/app"));
        assert!(!is_subagent_log(&parent, AgentType::Codex));
        assert!(is_subagent_log(&child, AgentType::Codex));
    }

    #[test]
    fn test_claude_head_falls_back_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("7f1c.jsonl");
        fs::write(&log, "not json\n{\"cwd\":\"/work/site\"}\n").unwrap();

        let head = read_log_head(&log, AgentType::Claude).unwrap();
        assert_eq!(head.session_id.as_deref(), Some("7f1c"));
        assert_eq!(head.project_path.as_deref(), Some("/work/site"));
    }

    #[test]
    fn test_missing_directories_are_empty() {
        let files = list_log_files(&[PathBuf::from("/definitely/not/here")]);
        assert!(files.is_empty());
        assert!(log_times(Path::new("/definitely/not/here.jsonl")).is_none());
    }
}
