//! Exact-content correlation between tmux scrollback and agent session logs.
//!
//! Each window's trailing scrollback is reduced to a handful of literal
//! fragments. Ripgrep finds the candidate logs containing any of them, then
//! each hit is verified against the log's trailing bytes and scored by how
//! many fragments it holds. The strongest (log, window) pairs win, one to one.

mod fingerprint;
mod search;

pub use fingerprint::{extract_fragments, MIN_FRAGMENT_CHARS};
pub use search::{files_containing_any, read_tail, SearchError};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::logs::{list_log_files, log_times};
use crate::tmux::TmuxWindow;

pub const DEFAULT_TAIL_BYTES: u64 = 256 * 1024;
const MAX_DEFAULT_RG_THREADS: usize = 2;
const MAX_ORPHAN_RG_THREADS: usize = 4;

static RG_MISSING_LOGGED: AtomicBool = AtomicBool::new(false);

/// Source of window scrollback; tmux in production
pub trait ScrollbackSource: Send + Sync {
    fn capture(&self, target: &str, lines: usize) -> Result<String>;
}

/// Tuning for one matching pass
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    /// Restrict the pass to these logs instead of everything under the log dirs
    pub log_paths: Option<Vec<PathBuf>>,
    pub tail_bytes: Option<u64>,
    pub rg_threads: Option<usize>,
}

/// Timings gathered across matching passes, for diagnostics only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactMatchProfiler {
    pub window_count: usize,
    pub log_count: usize,
    pub scrollback_count: usize,
    pub scrollback_ms: f64,
    pub search_count: usize,
    pub search_ms: f64,
    pub fallback_count: usize,
    pub tail_read_count: usize,
    pub tail_read_ms: f64,
    pub verify_ms: f64,
}

/// Thread budget for routine passes, kept low so the host stays responsive
pub fn default_rg_threads() -> usize {
    available_cpus().min(MAX_DEFAULT_RG_THREADS)
}

/// Thread budget for the rarer orphan rematch pass
pub fn orphan_rg_threads(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(1)
        .max(available_cpus().min(MAX_ORPHAN_RG_THREADS))
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct Candidate {
    log: PathBuf,
    window: usize,
    score: usize,
    log_mtime: u64,
}

/// Map each matched log to the window whose scrollback it contains
pub fn match_windows_to_logs(
    windows: &[TmuxWindow],
    log_dirs: &[PathBuf],
    scrollback_lines: usize,
    options: &MatchOptions,
    source: &dyn ScrollbackSource,
    mut profiler: Option<&mut ExactMatchProfiler>,
) -> BTreeMap<PathBuf, TmuxWindow> {
    let logs = options
        .log_paths
        .clone()
        .unwrap_or_else(|| list_log_files(log_dirs));
    if windows.is_empty() || logs.is_empty() {
        return BTreeMap::new();
    }

    let tail_bytes = options.tail_bytes.unwrap_or(DEFAULT_TAIL_BYTES);
    let threads = options.rg_threads.unwrap_or_else(default_rg_threads).max(1);
    if let Some(p) = profiler.as_deref_mut() {
        p.window_count += windows.len();
        p.log_count += logs.len();
    }

    let mut tails: HashMap<PathBuf, Option<String>> = HashMap::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for (index, window) in windows.iter().enumerate() {
        let capture_start = Instant::now();
        let scrollback = match source.capture(&window.target, scrollback_lines) {
            Ok(text) => text,
            Err(e) => {
                debug!(window = %window.target, error = %e, "scrollback capture failed");
                continue;
            }
        };
        if let Some(p) = profiler.as_deref_mut() {
            p.scrollback_count += 1;
            p.scrollback_ms += elapsed_ms(capture_start);
        }

        let fragments = extract_fragments(&scrollback);
        if fragments.is_empty() {
            continue;
        }

        let search_start = Instant::now();
        let hits: Vec<PathBuf> = match files_containing_any(&fragments, &logs, threads) {
            Ok(found) => logs.iter().filter(|log| found.contains(*log)).cloned().collect(),
            Err(e) => {
                if !RG_MISSING_LOGGED.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "ripgrep search unavailable, scanning log tails in-process");
                }
                if let Some(p) = profiler.as_deref_mut() {
                    p.fallback_count += 1;
                }
                logs.clone()
            }
        };
        if let Some(p) = profiler.as_deref_mut() {
            p.search_count += 1;
            p.search_ms += elapsed_ms(search_start);
        }

        for log in hits {
            let tail = tails.entry(log.clone()).or_insert_with(|| {
                let read_start = Instant::now();
                let tail = read_tail(&log, tail_bytes).ok();
                if let Some(p) = profiler.as_deref_mut() {
                    p.tail_read_count += 1;
                    p.tail_read_ms += elapsed_ms(read_start);
                }
                tail
            });
            let Some(tail) = tail.as_deref() else {
                continue;
            };

            let verify_start = Instant::now();
            let score = fragments.iter().filter(|f| tail.contains(f.as_str())).count();
            if let Some(p) = profiler.as_deref_mut() {
                p.verify_ms += elapsed_ms(verify_start);
            }
            if score > 0 {
                let log_mtime = log_times(&log).map(|t| t.mtime).unwrap_or(0);
                candidates.push(Candidate {
                    log,
                    window: index,
                    score,
                    log_mtime,
                });
            }
        }
    }

    assign(windows, candidates)
}

/// Greedy one-to-one assignment. Stronger matches go first; among equals the
/// most recently active window wins, then the most recently written log.
fn assign(windows: &[TmuxWindow], mut candidates: Vec<Candidate>) -> BTreeMap<PathBuf, TmuxWindow> {
    candidates.sort_by(|a, b| {
        let (wa, wb) = (&windows[a.window], &windows[b.window]);
        b.score
            .cmp(&a.score)
            .then_with(|| wb.activity.cmp(&wa.activity))
            .then_with(|| b.log_mtime.cmp(&a.log_mtime))
            .then_with(|| wa.target.cmp(&wb.target))
            .then_with(|| a.log.cmp(&b.log))
    });

    let mut used_windows: HashSet<usize> = HashSet::new();
    let mut matches = BTreeMap::new();
    for candidate in candidates {
        if matches.contains_key(&candidate.log) || used_windows.contains(&candidate.window) {
            continue;
        }
        used_windows.insert(candidate.window);
        matches.insert(candidate.log, windows[candidate.window].clone());
    }
    matches
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    /// Scrollback fixture keyed by window target
    #[derive(Default)]
    pub(crate) struct FakeScrollback {
        pub screens: HashMap<String, String>,
        pub calls: AtomicUsize,
    }

    impl FakeScrollback {
        pub(crate) fn with(screens: &[(&str, &str)]) -> Self {
            Self {
                screens: screens
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ScrollbackSource for FakeScrollback {
        fn capture(&self, target: &str, _lines: usize) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.screens
                .get(target)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such window: {target}"))
        }
    }

    fn window(target: &str, activity: u64) -> TmuxWindow {
        let mut window = TmuxWindow::new(target);
        window.activity = activity;
        window
    }

    fn log_line(text: &str) -> String {
        format!(
            "{}\n",
            serde_json::json!({"type": "assistant", "message": {"content": text}})
        )
    }

    #[test]
    fn test_unique_fingerprint_maps_to_its_window() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        fs::write(&a, log_line("Refactored the websocket reconnect backoff")).unwrap();
        fs::write(&b, log_line("Added pagination to the billing export job")).unwrap();

        let source = FakeScrollback::with(&[
            ("w:1", "⏺ Refactored the websocket reconnect backoff\n"),
            ("w:2", "⏺ Added pagination to the billing export job\n"),
        ]);
        let windows = vec![window("w:1", 1), window("w:2", 2)];

        let matches = match_windows_to_logs(
            &windows,
            &[dir.path().to_path_buf()],
            100,
            &MatchOptions::default(),
            &source,
            None,
        );

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[&a].target, "w:1");
        assert_eq!(matches[&b].target, "w:2");
    }

    #[test]
    fn test_log_is_never_assigned_twice() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.jsonl");
        fs::write(&shared, log_line("Both panes printed this exact long sentence")).unwrap();

        let text = "Both panes printed this exact long sentence\n";
        let source = FakeScrollback::with(&[("w:1", text), ("w:2", text)]);
        let windows = vec![window("w:1", 100), window("w:2", 200)];

        let matches = match_windows_to_logs(
            &windows,
            &[dir.path().to_path_buf()],
            100,
            &MatchOptions::default(),
            &source,
            None,
        );

        assert_eq!(matches.len(), 1);
        // Most recently active window wins the tie
        assert_eq!(matches[&shared].target, "w:2");
    }

    #[test]
    fn test_only_the_tail_is_searched() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("long.jsonl");
        let mut body = log_line("An early message that scrolled far away now");
        body.push_str(&"x".repeat(4096));
        body.push('\n');
        fs::write(&log, body).unwrap();

        let source = FakeScrollback::with(&[("w:1", "An early message that scrolled far away now\n")]);
        let options = MatchOptions {
            tail_bytes: Some(1024),
            ..MatchOptions::default()
        };

        let matches = match_windows_to_logs(
            &[window("w:1", 1)],
            &[dir.path().to_path_buf()],
            100,
            &options,
            &source,
            None,
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn test_restricted_log_paths_and_profile() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        let text = "Migrated the settings loader to the new schema";
        fs::write(&a, log_line(text)).unwrap();
        fs::write(&b, log_line(text)).unwrap();

        let source = FakeScrollback::with(&[("w:1", text)]);
        let options = MatchOptions {
            log_paths: Some(vec![b.clone()]),
            ..MatchOptions::default()
        };
        let mut profiler = ExactMatchProfiler::default();

        let matches = match_windows_to_logs(
            &[window("w:1", 1)],
            &[dir.path().to_path_buf()],
            100,
            &options,
            &source,
            Some(&mut profiler),
        );

        assert_eq!(matches.keys().collect::<Vec<_>>(), vec![&b]);
        assert_eq!(profiler.window_count, 1);
        assert_eq!(profiler.log_count, 1);
        assert_eq!(profiler.scrollback_count, 1);
        assert_eq!(profiler.search_count, 1);
    }

    #[test]
    fn test_no_fingerprint_no_match() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jsonl"), log_line("Some unrelated content in the log")).unwrap();
        let source = FakeScrollback::with(&[("w:1", "$ ls\nsrc  Cargo.toml\n")]);

        let matches = match_windows_to_logs(
            &[window("w:1", 1)],
            &[dir.path().to_path_buf()],
            100,
            &MatchOptions::default(),
            &source,
            None,
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn test_thread_budgets() {
        assert!(default_rg_threads() >= 1);
        assert!(default_rg_threads() <= MAX_DEFAULT_RG_THREADS);
        assert!(orphan_rg_threads(Some(8)) >= 8);
        assert!(orphan_rg_threads(None) <= MAX_ORPHAN_RG_THREADS);
    }
}
