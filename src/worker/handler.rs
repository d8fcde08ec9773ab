use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use tracing::debug;

use super::types::{
    MatchWorkerRequest, MatchWorkerResponse, MatchWorkerResult, OrphanCandidate, ResolvedMatch,
};
use crate::logs::{
    collect_batch, estimate_tokens, is_subagent_log, log_times, read_log_head,
    select_entries_needing_match, AgentType, GateOptions, LogDirectories, LogEntrySnapshot,
};
use crate::matcher::{
    match_windows_to_logs, orphan_rg_threads, ExactMatchProfiler, MatchOptions, ScrollbackSource,
};
use crate::tmux::TmuxWindow;

/// Serve one request; failures and panics come back as error responses
pub fn handle_match_worker_request(
    request: &MatchWorkerRequest,
    directories: &LogDirectories,
    source: &dyn ScrollbackSource,
) -> MatchWorkerResponse {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| process(request, directories, source)));

    match outcome {
        Ok(Ok(result)) => MatchWorkerResponse::Result(result),
        Ok(Err(e)) => MatchWorkerResponse::Error {
            id: request.id.clone(),
            error: format!("{:#}", e),
        },
        Err(payload) => MatchWorkerResponse::Error {
            id: request.id.clone(),
            error: panic_message(payload.as_ref()),
        },
    }
}

fn process(
    request: &MatchWorkerRequest,
    directories: &LogDirectories,
    source: &dyn ScrollbackSource,
) -> Result<MatchWorkerResult> {
    if request.max_logs_per_poll == 0 {
        bail!("maxLogsPerPoll must be positive");
    }
    if request.scrollback_lines == 0 {
        bail!("scrollbackLines must be positive");
    }

    let search = request.search.clone().unwrap_or_default();
    let directories = match &request.log_dirs {
        Some(dirs) => directories.clone().with_search_dirs(dirs.clone()),
        None => directories.clone(),
    };
    let log_dirs = directories.search_directories();
    let min_tokens = request.min_tokens_for_match.unwrap_or(0);
    let mut profile = search.profile.then(ExactMatchProfiler::default);

    let batch = collect_batch(&directories, request.max_logs_per_poll);
    let mut result = MatchWorkerResult {
        id: request.id.clone(),
        scan_ms: batch.scan_ms,
        sort_ms: batch.sort_ms,
        ..MatchWorkerResult::default()
    };

    let to_match = select_entries_needing_match(
        &batch.entries,
        &request.sessions,
        GateOptions { min_tokens },
    );

    if to_match.is_empty() {
        result.match_skipped = true;
    } else {
        let log_paths: Vec<PathBuf> = to_match.iter().map(|e| e.log_path.clone()).collect();
        let match_start = Instant::now();
        let matches = match_windows_to_logs(
            &request.windows,
            &log_dirs,
            request.scrollback_lines,
            &MatchOptions {
                log_paths: Some(log_paths.clone()),
                tail_bytes: search.tail_bytes,
                rg_threads: search.rg_threads,
            },
            source,
            profile.as_mut(),
        );
        result.match_ms = match_start.elapsed().as_secs_f64() * 1000.0;
        result.match_window_count = request.windows.len();
        result.match_log_count = log_paths.len();
        result.matches = resolved(matches);
    }

    if request.force_orphan_rematch && !request.orphan_candidates.is_empty() {
        let orphan_entries =
            build_orphan_entries(&request.orphan_candidates, &batch.entries, min_tokens);
        if !orphan_entries.is_empty() {
            let matches = match_windows_to_logs(
                &request.windows,
                &log_dirs,
                request.scrollback_lines,
                &MatchOptions {
                    log_paths: Some(orphan_entries.iter().map(|e| e.log_path.clone()).collect()),
                    tail_bytes: None,
                    rg_threads: Some(orphan_rg_threads(search.rg_threads)),
                },
                source,
                profile.as_mut(),
            );
            result.orphan_matches = resolved(matches);
        }
        result.orphan_entries = orphan_entries;
    }

    debug!(
        id = %request.id,
        entries = batch.entries.len(),
        matches = result.matches.len(),
        orphan_matches = result.orphan_matches.len(),
        skipped = result.match_skipped,
        "match request handled"
    );

    result.entries = batch.entries;
    result.profile = profile;
    Ok(result)
}

/// Snapshot entries for orphan logs that fell outside this poll's batch
fn build_orphan_entries(
    candidates: &[OrphanCandidate],
    entries: &[LogEntrySnapshot],
    min_tokens: u64,
) -> Vec<LogEntrySnapshot> {
    let existing: HashSet<&PathBuf> = entries.iter().map(|e| &e.log_path).collect();
    let mut orphans = Vec::new();

    for candidate in candidates {
        let path = &candidate.log_file_path;
        if path.as_os_str().is_empty() || existing.contains(path) {
            continue;
        }
        if candidate.agent_type == AgentType::Codex && is_subagent_log(path, AgentType::Codex) {
            continue;
        }
        let Some(times) = log_times(path) else {
            continue;
        };
        let Some(log_token_count) = estimate_tokens(path) else {
            continue;
        };
        if min_tokens > 0 && log_token_count < min_tokens {
            continue;
        }

        let head = read_log_head(path, candidate.agent_type).unwrap_or_default();
        orphans.push(LogEntrySnapshot {
            log_path: path.clone(),
            mtime: times.mtime,
            birthtime: times.birthtime,
            session_id: Some(candidate.session_id.clone()),
            project_path: candidate.project_path.clone().or(head.project_path),
            agent_type: candidate.agent_type,
            is_subagent: false,
            log_token_count,
        });
    }

    orphans
}

fn resolved(matches: BTreeMap<PathBuf, TmuxWindow>) -> Vec<ResolvedMatch> {
    matches
        .into_iter()
        .map(|(log_path, window)| ResolvedMatch {
            log_path,
            tmux_window: window.key().to_string(),
        })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("match worker panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("match worker panicked: {}", message)
    } else {
        "match worker panicked".to_string()
    }
}
