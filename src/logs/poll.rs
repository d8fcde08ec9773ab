use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use super::discovery::{
    is_subagent_log, list_log_files, log_times, read_log_head, LogDirectories,
};
use super::{AgentType, LogEntrySnapshot};

/// Rough bytes-per-token ratio used for the token estimate
const BYTES_PER_TOKEN: u64 = 4;

/// Result of one snapshot pass over the log directories
#[derive(Debug, Clone, Default)]
pub struct LogBatch {
    pub entries: Vec<LogEntrySnapshot>,
    pub scan_ms: f64,
    pub sort_ms: f64,
}

/// Snapshot the most recently touched logs, newest first, capped at `max_entries`
pub fn collect_batch(directories: &LogDirectories, max_entries: usize) -> LogBatch {
    let scan_start = Instant::now();
    let mut stamped: Vec<(PathBuf, u64, u64)> = list_log_files(&directories.search_directories())
        .into_iter()
        .filter_map(|path| {
            let times = log_times(&path)?;
            Some((path, times.mtime, times.birthtime))
        })
        .collect();
    let scan_ms = elapsed_ms(scan_start);

    let sort_start = Instant::now();
    stamped.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    stamped.truncate(max_entries);
    let sort_ms = elapsed_ms(sort_start);

    let entries: Vec<LogEntrySnapshot> = stamped
        .into_iter()
        .filter_map(|(path, mtime, birthtime)| snapshot_entry(directories, path, mtime, birthtime))
        .collect();

    debug!(
        entries = entries.len(),
        scan_ms, sort_ms, "collected log batch"
    );

    LogBatch {
        entries,
        scan_ms,
        sort_ms,
    }
}

fn snapshot_entry(
    directories: &LogDirectories,
    path: PathBuf,
    mtime: u64,
    birthtime: u64,
) -> Option<LogEntrySnapshot> {
    let agent_type = directories.classify(&path);
    // A file removed since the stat is dropped here rather than failing the batch
    let head = read_log_head(&path, agent_type)?;
    let log_token_count = estimate_tokens(&path)?;
    let is_subagent = match agent_type {
        AgentType::Codex => head.is_subagent,
        other => is_subagent_log(&path, other),
    };

    Some(LogEntrySnapshot {
        log_path: path,
        mtime,
        birthtime,
        session_id: head.session_id,
        project_path: head.project_path,
        agent_type,
        is_subagent,
        log_token_count,
    })
}

/// Cheap, stable token estimate derived from the file size
pub fn estimate_tokens(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(metadata.len() / BYTES_PER_TOKEN)
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
