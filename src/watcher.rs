//! The control loop: polls tmux, drives the match worker and folds its
//! answers into the session table.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::config::Config;
use crate::error::BoardError;
use crate::logs::{now_ms, AgentType, LogDirectories, LogEntrySnapshot};
use crate::matcher::ScrollbackSource;
use crate::session::{detects_permission_prompt, Session, SessionManager, TerminalBridge};
use crate::tmux::{TmuxClient, TmuxWindow};
use crate::worker::{
    MatchWorker, MatchWorkerRequest, MatchWorkerResponse, MatchWorkerResult,
    MatchWorkerSearchOptions,
};

/// The terminal multiplexer the watcher polls
pub trait Multiplexer: ScrollbackSource + Clone + 'static {
    fn list_windows(&self) -> impl Future<Output = Result<Vec<TmuxWindow>>> + Send;
    fn capture_screen(&self, target: &str) -> impl Future<Output = Result<String>> + Send;
}

impl Multiplexer for TmuxClient {
    fn list_windows(&self) -> impl Future<Output = Result<Vec<TmuxWindow>>> + Send {
        TmuxClient::list_windows(self)
    }

    fn capture_screen(&self, target: &str) -> impl Future<Output = Result<String>> + Send {
        TmuxClient::capture_screen(self, target)
    }
}

/// Agent that wrote a log, if its location says so. Configured roots win over
/// the default directory conventions.
pub fn infer_agent_type(directories: &LogDirectories, log_path: &Path) -> Option<AgentType> {
    match directories.classify(log_path) {
        AgentType::Unknown => None,
        agent => Some(agent),
    }
}

/// Ways into a running watcher
pub struct WatcherHandle {
    pub actions: mpsc::UnboundedSender<Action>,
    pub status: watch::Receiver<Vec<Session>>,
}

struct PendingRequest {
    seq: u64,
    sent_at: u64,
    forced_orphans: bool,
}

pub struct StatusWatcher<M: Multiplexer> {
    config: Config,
    mux: M,
    sessions: SessionManager,
    worker: MatchWorker,
    actions: mpsc::UnboundedReceiver<Action>,
    status: watch::Sender<Vec<Session>>,
    next_seq: u64,
    last_applied_seq: u64,
    pending: HashMap<String, PendingRequest>,
    /// Windows seen by the latest tick
    windows: Vec<TmuxWindow>,
    force_orphan_rematch: bool,
}

impl<M: Multiplexer> StatusWatcher<M> {
    pub fn new(
        config: Config,
        mux: M,
        bridge: Arc<dyn TerminalBridge>,
    ) -> Result<(Self, WatcherHandle), BoardError> {
        let worker = MatchWorker::spawn(LogDirectories::from_config(&config), Arc::new(mux.clone()))?;
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Vec::new());
        let sessions = SessionManager::new(bridge, config.tmux_session.clone());

        let watcher = Self {
            config,
            mux,
            sessions,
            worker,
            actions: actions_rx,
            status: status_tx,
            next_seq: 0,
            last_applied_seq: 0,
            pending: HashMap::new(),
            windows: Vec::new(),
            force_orphan_rematch: true,
        };
        let handle = WatcherHandle {
            actions: actions_tx,
            status: status_rx,
        };
        Ok((watcher, handle))
    }

    /// Run until a quit action arrives or every action sender is gone
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.config.refresh_interval.as_millis() as u64,
            session = %self.config.tmux_session,
            "status watcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                Some(response) = self.worker.recv() => self.apply_response(response, now_ms()),
                action = self.actions.recv() => {
                    let Some(action) = action else { break };
                    if self.handle_action(action) {
                        break;
                    }
                }
            }
        }

        info!("status watcher stopped");
        Ok(())
    }

    /// Returns true when the loop should stop
    fn handle_action(&mut self, action: Action) -> bool {
        match action {
            Action::ClientConnected { client_id, tx } => self.sessions.connect_client(&client_id, tx),
            Action::ClientMessage { client_id, message } => {
                self.sessions.handle_client_message(&client_id, message)
            }
            Action::ClientDisconnected { client_id } => self.sessions.disconnect_client(&client_id),
            Action::Quit => return true,
        }
        false
    }

    async fn tick(&mut self) {
        let now = now_ms();
        self.expire_pending(now);

        let windows = match self.mux.list_windows().await {
            Ok(windows) => windows,
            Err(e) => {
                warn!(error = %e, "failed to list tmux windows");
                return;
            }
        };
        self.reconcile(windows, now);
        self.sessions.collect_terminal_activity();
        self.dispatch(now);

        let prompts = self.capture_prompts().await;
        let idle_after = self.config.idle_after.as_millis() as u64;
        self.sessions.refresh_all_statuses(
            |s| s.window_key().is_some_and(|key| prompts.contains(key)),
            now_ms(),
            idle_after,
        );
        self.publish();
    }

    fn reconcile(&mut self, windows: Vec<TmuxWindow>, now: u64) {
        let live: HashSet<String> = windows.iter().map(|w| w.key().to_string()).collect();
        for window in &windows {
            if self.tracks(window) {
                self.sessions.upsert_window(window, now);
            }
        }
        if !self.sessions.mark_orphaned(&live).is_empty() {
            self.force_orphan_rematch = true;
        }
        let grace = self.config.orphan_grace.as_millis() as u64;
        self.sessions.prune_expired(now, grace);
        self.windows = windows;
    }

    /// Windows in the board's own session, already known, or visibly running an agent
    fn tracks(&self, window: &TmuxWindow) -> bool {
        window.session_name == self.config.tmux_session
            || self.sessions.has_window(window.key())
            || AgentType::from_command(&window.command) != AgentType::Unknown
    }

    fn dispatch(&mut self, now: u64) {
        self.next_seq += 1;
        let forced = self.force_orphan_rematch;
        let request = MatchWorkerRequest {
            id: uuid::Uuid::new_v4().to_string(),
            windows: self.windows.clone(),
            max_logs_per_poll: self.config.log_poll_max,
            log_dirs: None,
            sessions: self.sessions.known_session_snapshots(),
            scrollback_lines: self.config.scrollback_lines,
            min_tokens_for_match: Some(self.config.min_tokens_for_match),
            force_orphan_rematch: forced,
            orphan_candidates: if forced {
                self.sessions.orphan_candidates()
            } else {
                Vec::new()
            },
            search: Some(MatchWorkerSearchOptions {
                tail_bytes: self.config.tail_bytes,
                rg_threads: self.config.rg_threads,
                profile: self.config.match_profile,
            }),
        };
        let id = request.id.clone();

        match self.worker.try_submit(request) {
            Ok(()) => {
                self.pending.insert(
                    id,
                    PendingRequest {
                        seq: self.next_seq,
                        sent_at: now,
                        forced_orphans: forced,
                    },
                );
                self.force_orphan_rematch = false;
            }
            Err(e) => debug!(seq = self.next_seq, error = %e, "match request not submitted"),
        }
    }

    /// Drop requests the worker never answered in time
    fn expire_pending(&mut self, now: u64) {
        let timeout = self.config.worker_timeout.as_millis() as u64;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.sent_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(request) = self.pending.remove(&id) {
                warn!(id = %id, seq = request.seq, "match request timed out, tick failed");
                if request.forced_orphans {
                    self.force_orphan_rematch = true;
                }
            }
        }
    }

    /// Keys of windows whose screen shows a permission prompt
    async fn capture_prompts(&self) -> HashSet<String> {
        let mut prompts = HashSet::new();
        for window in &self.windows {
            if !self.sessions.has_window(window.key()) {
                continue;
            }
            match self.mux.capture_screen(&window.target).await {
                Ok(screen) if detects_permission_prompt(&screen) => {
                    prompts.insert(window.key().to_string());
                }
                Ok(_) => {}
                Err(e) => debug!(window = %window.target, error = %e, "screen capture failed"),
            }
        }
        prompts
    }

    fn apply_response(&mut self, response: MatchWorkerResponse, now: u64) {
        let Some(request) = self.pending.remove(response.id()) else {
            debug!(id = response.id(), "discarding response for unknown request");
            return;
        };
        if request.seq <= self.last_applied_seq {
            debug!(seq = request.seq, applied = self.last_applied_seq, "discarding stale response");
            return;
        }

        match response {
            MatchWorkerResponse::Error { id, error } => {
                warn!(id = %id, seq = request.seq, error = %error, "match tick failed");
                if request.forced_orphans {
                    self.force_orphan_rematch = true;
                }
            }
            MatchWorkerResponse::Result(result) => {
                self.last_applied_seq = request.seq;
                self.apply_result(result, now);
                self.publish();
            }
        }
    }

    fn apply_result(&mut self, result: MatchWorkerResult, now: u64) {
        if let Some(profile) = &result.profile {
            debug!(?profile, match_ms = result.match_ms, "match profile");
        }

        let entries: HashMap<&Path, &LogEntrySnapshot> = result
            .entries
            .iter()
            .chain(&result.orphan_entries)
            .map(|e| (e.log_path.as_path(), e))
            .collect();
        for entry in entries.values() {
            self.sessions.apply_log_entry(entry);
        }

        for resolved in result.matches.iter().chain(&result.orphan_matches) {
            let Some(window) = self.windows.iter().find(|w| w.key() == resolved.tmux_window) else {
                debug!(window = %resolved.tmux_window, "matched window is gone");
                continue;
            };
            let entry = entries.get(resolved.log_path.as_path()).copied();
            self.sessions.bind_log(&resolved.log_path, window, entry, now);
        }

        let grace = self.config.orphan_grace.as_millis() as u64;
        let min_tokens = self.config.min_tokens_for_match;
        for entry in &result.entries {
            if entry.is_subagent
                || entry.log_token_count < min_tokens
                || now.saturating_sub(entry.mtime) > grace
                || self.sessions.owns_log(&entry.log_path)
            {
                continue;
            }
            if self.sessions.add_discovered(entry, now).is_some() {
                self.force_orphan_rematch = true;
            }
        }
    }

    /// Push the table to the status channel and clients when it changed
    fn publish(&mut self) {
        let snapshot = self.sessions.snapshot();
        if *self.status.borrow() == snapshot {
            return;
        }
        self.status.send_replace(snapshot);
        self.sessions.broadcast_sessions();
    }
}
