use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::terminal::{TerminalBridge, TerminalProxy};
use super::{derive_status, Session, SessionSource, SessionStatus};
use crate::error::BoardError;
use crate::logs::{now_ms, AgentType, LogEntrySnapshot, SessionSnapshot};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::tmux::TmuxWindow;
use crate::worker::OrphanCandidate;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_BYTES: usize = 8192;
const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 40;

/// A live terminal attachment shared by every client viewing a session
struct Attachment {
    proxy: Box<dyn TerminalProxy>,
    output: broadcast::Sender<String>,
    last_output_at: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

/// A connected dashboard client
struct Client {
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Output forwarders keyed by session id
    forwards: HashMap<String, JoinHandle<()>>,
}

/// Owns the canonical session table and its terminal attachments
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    attachments: HashMap<String, Attachment>,
    clients: HashMap<String, Client>,
    bridge: Arc<dyn TerminalBridge>,
    managed_session: String,
}

impl SessionManager {
    pub fn new(bridge: Arc<dyn TerminalBridge>, managed_session: impl Into<String>) -> Self {
        Self {
            sessions: HashMap::new(),
            attachments: HashMap::new(),
            clients: HashMap::new(),
            bridge,
            managed_session: managed_session.into(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions, most recently active first
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    fn find_by_window(&self, key: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|s| s.window_key() == Some(key))
            .map(|s| s.id.clone())
    }

    fn find_by_log(&self, log_path: &Path) -> Option<String> {
        self.sessions
            .values()
            .find(|s| s.log_file_path.as_deref() == Some(log_path))
            .map(|s| s.id.clone())
    }

    /// Track a live window, creating its session on first sight.
    /// Returns the session id and whether it was created.
    pub fn upsert_window(&mut self, window: &TmuxWindow, now: u64) -> (String, bool) {
        if let Some(id) = self.find_by_window(window.key()) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.name = window.name.clone();
                if session.project_path.is_empty() {
                    session.project_path = window.pane_path.clone();
                }
                if session.agent_type == AgentType::Unknown {
                    session.agent_type = AgentType::from_command(&window.command);
                }
                session.touch(window.activity);
                session.window = Some(window.clone());
                session.last_window = None;
            }
            return (id, false);
        }

        let source = if window.session_name == self.managed_session {
            SessionSource::Managed
        } else {
            SessionSource::External
        };
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            window: Some(window.clone()),
            last_window: None,
            name: window.name.clone(),
            project_path: window.pane_path.clone(),
            agent_type: AgentType::from_command(&window.command),
            log_file_path: None,
            last_activity: window.activity,
            status: SessionStatus::Unknown,
            created_at: now,
            source,
            last_matched_mtime: None,
            last_output_at: None,
        };
        info!(session_id = %session.id, window = %window.target, "session created for window");
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        (id, true)
    }

    /// Unbind sessions whose window is no longer live; returns the newly orphaned ids
    pub fn mark_orphaned(&mut self, live_keys: &HashSet<String>) -> Vec<String> {
        let mut orphaned = Vec::new();
        for session in self.sessions.values_mut() {
            let Some(key) = session.window_key().map(str::to_string) else {
                continue;
            };
            if live_keys.contains(&key) {
                continue;
            }
            info!(session_id = %session.id, window = %key, "window closed, session orphaned");
            session.last_window = Some(key);
            session.window = None;
            session.status = SessionStatus::Orphaned;
            orphaned.push(session.id.clone());
        }
        for id in &orphaned {
            self.close_attachment(id);
        }
        orphaned
    }

    /// Drop window-less sessions that have been quiet for longer than `grace_ms`
    pub fn prune_expired(&mut self, now: u64, grace_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.window.is_none() && now.saturating_sub(s.last_activity) > grace_ms)
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            self.close_attachment(id);
            self.sessions.remove(id);
            debug!(session_id = %id, "expired session removed");
        }
        expired
    }

    /// Bind a log to the session owning a window; at most one session keeps the log.
    /// Returns the id of the session left bound to the window.
    pub fn bind_log(
        &mut self,
        log_path: &Path,
        window: &TmuxWindow,
        entry: Option<&LogEntrySnapshot>,
        now: u64,
    ) -> String {
        let (mut target_id, _) = self.upsert_window(window, now);

        if let Some(owner_id) = self.find_by_log(log_path) {
            if owner_id != target_id {
                target_id = self.evict_log(&owner_id, &target_id);
            }
        }

        let Some(session) = self.sessions.get_mut(&target_id) else {
            return target_id;
        };
        if session.log_file_path.as_deref() != Some(log_path) {
            info!(
                session_id = %session.id,
                window = %window.target,
                log = %log_path.display(),
                "log bound to window"
            );
        }
        session.log_file_path = Some(log_path.to_path_buf());
        if let Some(entry) = entry {
            session.last_matched_mtime = Some(entry.mtime);
            apply_entry_metadata(session, entry);
        }
        target_id
    }

    /// Move a log away from its previous owner and return the session that keeps
    /// the window. A window-less owner is the same agent seen again, so it is
    /// merged rather than left behind as an empty orphan: it takes over a window
    /// whose session has no log of its own, and otherwise folds into it.
    fn evict_log(&mut self, owner_id: &str, target_id: &str) -> String {
        let owner_orphaned = self
            .sessions
            .get(owner_id)
            .is_some_and(|owner| owner.window.is_none());
        if !owner_orphaned {
            if let Some(owner) = self.sessions.get_mut(owner_id) {
                debug!(session_id = %owner.id, "log rebound to another session");
                owner.log_file_path = None;
                owner.last_matched_mtime = None;
            }
            return target_id.to_string();
        }

        let target_fresh = self
            .sessions
            .get(target_id)
            .is_some_and(|target| target.log_file_path.is_none());
        if target_fresh {
            let Some(target) = self.sessions.remove(target_id) else {
                return target_id.to_string();
            };
            self.close_attachment(target_id);
            let Some(owner) = self.sessions.get_mut(owner_id) else {
                self.sessions.insert(target_id.to_string(), target);
                return target_id.to_string();
            };
            info!(
                session_id = %owner.id,
                from = ?owner.last_window,
                to = ?target.window_key(),
                "orphaned session rebound to window"
            );
            adopt_window(owner, target);
            return owner_id.to_string();
        }

        if let Some(owner) = self.sessions.remove(owner_id) {
            self.close_attachment(owner_id);
            if let Some(target) = self.sessions.get_mut(target_id) {
                debug!(session_id = %target.id, merged = %owner.id, "orphaned session merged");
                merge_metadata(target, &owner);
            }
        }
        target_id.to_string()
    }

    /// Fold a fresh snapshot entry into whichever session owns its log
    pub fn apply_log_entry(&mut self, entry: &LogEntrySnapshot) {
        if let Some(id) = self.find_by_log(&entry.log_path) {
            if let Some(session) = self.sessions.get_mut(&id) {
                apply_entry_metadata(session, entry);
            }
        }
    }

    /// Track a log that no window has claimed yet
    pub fn add_discovered(&mut self, entry: &LogEntrySnapshot, now: u64) -> Option<String> {
        if self.find_by_log(&entry.log_path).is_some() {
            return None;
        }
        let name = entry
            .project_path
            .as_deref()
            .and_then(path_leaf)
            .unwrap_or("unmatched log")
            .to_string();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            window: None,
            last_window: None,
            name,
            project_path: entry.project_path.clone().unwrap_or_default(),
            agent_type: entry.agent_type,
            log_file_path: Some(entry.log_path.clone()),
            last_activity: entry.mtime,
            status: SessionStatus::Orphaned,
            created_at: now,
            source: SessionSource::Discovered,
            last_matched_mtime: None,
            last_output_at: None,
        };
        debug!(session_id = %session.id, log = %entry.log_path.display(), "session discovered from log");
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        Some(id)
    }

    pub fn has_window(&self, key: &str) -> bool {
        self.find_by_window(key).is_some()
    }

    pub fn owns_log(&self, log_path: &Path) -> bool {
        self.find_by_log(log_path).is_some()
    }

    /// Gate view of every session that owns a log
    pub fn known_session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .values()
            .filter_map(|s| {
                Some(SessionSnapshot {
                    session_id: s.id.clone(),
                    log_file_path: s.log_file_path.clone()?,
                    current_window: s.window_key().map(str::to_string),
                    last_matched_mtime: s.last_matched_mtime,
                })
            })
            .collect()
    }

    /// Sessions holding a log but no live window
    pub fn orphan_candidates(&self) -> Vec<OrphanCandidate> {
        self.sessions
            .values()
            .filter(|s| s.window.is_none())
            .filter_map(|s| {
                Some(OrphanCandidate {
                    session_id: s.id.clone(),
                    log_file_path: s.log_file_path.clone()?,
                    project_path: (!s.project_path.is_empty()).then(|| s.project_path.clone()),
                    agent_type: s.agent_type,
                    current_window: s.last_window.clone(),
                })
            })
            .collect()
    }

    /// Fold attachment output into activity and retire attachments whose terminal ended
    pub fn collect_terminal_activity(&mut self) {
        let mut finished = Vec::new();
        for (id, attachment) in &self.attachments {
            let at = attachment.last_output_at.load(Ordering::Relaxed);
            if at > 0 {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.last_output_at = Some(at);
                    session.touch(at);
                }
            }
            if attachment.closed.load(Ordering::Relaxed) {
                finished.push(id.clone());
            }
        }
        for id in finished {
            debug!(session_id = %id, "terminal attachment ended");
            self.close_attachment(&id);
        }
    }

    /// Recompute one session's status
    pub fn refresh_status(&mut self, session_id: &str, prompt_visible: bool, now: u64, idle_after_ms: u64) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            let status = derive_status(session, prompt_visible, now, idle_after_ms);
            if status != session.status {
                debug!(session_id, from = ?session.status, to = ?status, "status changed");
                session.status = status;
            }
        }
    }

    pub fn refresh_all_statuses<F>(&mut self, prompt_visible: F, now: u64, idle_after_ms: u64)
    where
        F: Fn(&Session) -> bool,
    {
        let ids: Vec<(String, bool)> = self
            .sessions
            .values()
            .map(|s| (s.id.clone(), prompt_visible(s)))
            .collect();
        for (id, prompt) in ids {
            self.refresh_status(&id, prompt, now, idle_after_ms);
        }
    }

    pub fn connect_client(&mut self, client_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        let _ = tx.send(ServerMessage::Sessions {
            sessions: self.snapshot(),
        });
        self.clients.insert(
            client_id.to_string(),
            Client {
                tx,
                forwards: HashMap::new(),
            },
        );
        debug!(client_id, "client connected");
    }

    pub fn disconnect_client(&mut self, client_id: &str) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };
        for (session_id, forward) in client.forwards {
            forward.abort();
            self.close_if_unwatched(&session_id);
        }
        debug!(client_id, "client disconnected");
    }

    /// Send the session table to every client
    pub fn broadcast_sessions(&mut self) {
        let sessions = self.snapshot();
        self.clients.retain(|_, client| {
            client
                .tx
                .send(ServerMessage::Sessions {
                    sessions: sessions.clone(),
                })
                .is_ok()
        });
    }

    pub fn handle_client_message(&mut self, client_id: &str, message: ClientMessage) {
        let session_id = match &message {
            ClientMessage::TerminalAttach { session_id, .. }
            | ClientMessage::TerminalDetach { session_id }
            | ClientMessage::TerminalInput { session_id, .. }
            | ClientMessage::TerminalResize { session_id, .. } => Some(session_id.clone()),
            ClientMessage::SessionRefresh => None,
        };

        let result = match message {
            ClientMessage::TerminalAttach {
                session_id,
                cols,
                rows,
            } => self.attach(
                client_id,
                &session_id,
                cols.unwrap_or(DEFAULT_COLS),
                rows.unwrap_or(DEFAULT_ROWS),
            ),
            ClientMessage::TerminalDetach { session_id } => self.detach(client_id, &session_id),
            ClientMessage::TerminalInput { session_id, data } => {
                self.input(client_id, &session_id, data.as_bytes())
            }
            ClientMessage::TerminalResize {
                session_id,
                cols,
                rows,
            } => self.resize(client_id, &session_id, cols, rows),
            ClientMessage::SessionRefresh => {
                let sessions = self.snapshot();
                self.send_to(client_id, ServerMessage::Sessions { sessions });
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(client_id, error = %e, "client request failed");
            self.send_to(
                client_id,
                ServerMessage::Error {
                    message: e.to_string(),
                    session_id,
                },
            );
        }
    }

    /// Subscribe a client to a session's terminal output, opening the terminal if needed
    pub fn attach(&mut self, client_id: &str, session_id: &str, cols: u16, rows: u16) -> Result<(), BoardError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| BoardError::SessionNotFound(session_id.to_string()))?;
        let target = session
            .window
            .as_ref()
            .map(|w| w.target.clone())
            .ok_or_else(|| BoardError::NoWindow(session_id.to_string()))?;
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| BoardError::NotAttached(session_id.to_string()))?;
        if client.forwards.contains_key(session_id) {
            self.send_to(client_id, attached(session_id));
            return Ok(());
        }

        let starting = !self.attachments.contains_key(session_id);
        let mut reader = None;
        if starting {
            let mut proxy = self.bridge.open(&target, cols, rows)?;
            reader = Some(proxy.take_reader()?);
            let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
            self.attachments.insert(
                session_id.to_string(),
                Attachment {
                    proxy,
                    output,
                    last_output_at: Arc::new(AtomicU64::new(0)),
                    closed: Arc::new(AtomicBool::new(false)),
                },
            );
        } else if let Some(attachment) = self.attachments.get_mut(session_id) {
            attachment.proxy.resize(cols, rows)?;
        }

        let Some(attachment) = self.attachments.get(session_id) else {
            return Err(BoardError::NotAttached(session_id.to_string()));
        };
        // Subscribe before the pump starts so no early output is missed
        let rx = attachment.output.subscribe();
        if let Some(reader) = reader {
            let pumped = spawn_output_pump(
                session_id,
                reader,
                attachment.output.clone(),
                Arc::clone(&attachment.last_output_at),
                Arc::clone(&attachment.closed),
            );
            if let Err(e) = pumped {
                if let Some(mut attachment) = self.attachments.remove(session_id) {
                    attachment.proxy.close();
                }
                return Err(e);
            }
        }

        if let Some(client) = self.clients.get_mut(client_id) {
            let forward = spawn_forward(session_id.to_string(), rx, client.tx.clone());
            client.forwards.insert(session_id.to_string(), forward);
        }
        self.send_to(client_id, attached(session_id));
        info!(client_id, session_id, "client attached");
        Ok(())
    }

    /// Stop a client's output for a session; the terminal closes once nobody watches it
    pub fn detach(&mut self, client_id: &str, session_id: &str) -> Result<(), BoardError> {
        let forward = self
            .clients
            .get_mut(client_id)
            .and_then(|client| client.forwards.remove(session_id))
            .ok_or_else(|| BoardError::NotAttached(session_id.to_string()))?;
        forward.abort();
        self.send_to(
            client_id,
            ServerMessage::TerminalDetached {
                session_id: session_id.to_string(),
            },
        );
        self.close_if_unwatched(session_id);
        info!(client_id, session_id, "client detached");
        Ok(())
    }

    pub fn input(&mut self, client_id: &str, session_id: &str, data: &[u8]) -> Result<(), BoardError> {
        self.ensure_attached(client_id, session_id)?;
        let attachment = self
            .attachments
            .get_mut(session_id)
            .ok_or_else(|| BoardError::NotAttached(session_id.to_string()))?;
        attachment.proxy.write(data)
    }

    pub fn resize(&mut self, client_id: &str, session_id: &str, cols: u16, rows: u16) -> Result<(), BoardError> {
        self.ensure_attached(client_id, session_id)?;
        let attachment = self
            .attachments
            .get_mut(session_id)
            .ok_or_else(|| BoardError::NotAttached(session_id.to_string()))?;
        attachment.proxy.resize(cols, rows)
    }

    fn ensure_attached(&self, client_id: &str, session_id: &str) -> Result<(), BoardError> {
        let attached = self
            .clients
            .get(client_id)
            .is_some_and(|client| client.forwards.contains_key(session_id));
        if attached {
            Ok(())
        } else {
            Err(BoardError::NotAttached(session_id.to_string()))
        }
    }

    fn close_if_unwatched(&mut self, session_id: &str) {
        let watched = self
            .clients
            .values()
            .any(|client| client.forwards.contains_key(session_id));
        if !watched {
            if let Some(mut attachment) = self.attachments.remove(session_id) {
                attachment.proxy.close();
            }
        }
    }

    /// Close a session's terminal and tell every subscriber
    fn close_attachment(&mut self, session_id: &str) {
        if let Some(mut attachment) = self.attachments.remove(session_id) {
            attachment.proxy.close();
        }
        for client in self.clients.values_mut() {
            if let Some(forward) = client.forwards.remove(session_id) {
                forward.abort();
                let _ = client.tx.send(ServerMessage::TerminalDetached {
                    session_id: session_id.to_string(),
                });
            }
        }
    }

    fn send_to(&self, client_id: &str, message: ServerMessage) {
        if let Some(client) = self.clients.get(client_id) {
            let _ = client.tx.send(message);
        }
    }
}

fn attached(session_id: &str) -> ServerMessage {
    ServerMessage::TerminalAttached {
        session_id: session_id.to_string(),
    }
}

/// An orphan takes over the window of a freshly created session
fn adopt_window(owner: &mut Session, fresh: Session) {
    merge_metadata(owner, &fresh);
    if owner.source == SessionSource::Discovered {
        owner.source = fresh.source;
    }
    owner.name = fresh.name;
    owner.window = fresh.window;
    owner.last_window = None;
    owner.status = fresh.status;
}

/// Fill gaps in `into` from another record of the same agent
fn merge_metadata(into: &mut Session, from: &Session) {
    if into.agent_type == AgentType::Unknown {
        into.agent_type = from.agent_type;
    }
    if into.project_path.is_empty() {
        into.project_path = from.project_path.clone();
    }
    into.created_at = into.created_at.min(from.created_at);
    into.last_output_at = into.last_output_at.max(from.last_output_at);
    into.touch(from.last_activity);
}

fn apply_entry_metadata(session: &mut Session, entry: &LogEntrySnapshot) {
    if session.agent_type == AgentType::Unknown {
        session.agent_type = entry.agent_type;
    }
    if session.project_path.is_empty() {
        if let Some(project) = &entry.project_path {
            session.project_path = project.clone();
        }
    }
    session.touch(entry.mtime);
}

fn path_leaf(path: &str) -> Option<&str> {
    path.trim()
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|leaf| !leaf.is_empty())
}

/// Read terminal output on its own thread and fan it out
fn spawn_output_pump(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    output: broadcast::Sender<String>,
    last_output_at: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
) -> Result<(), BoardError> {
    let name = format!("pty-{}", session_id);
    std::thread::Builder::new().name(name).spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut pending);
                    if !text.is_empty() {
                        last_output_at.store(now_ms(), Ordering::Relaxed);
                        // No subscribers is fine; output is live-only
                        let _ = output.send(text);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "terminal read failed");
                    break;
                }
            }
        }
        closed.store(true, Ordering::Relaxed);
    })?;
    Ok(())
}

/// Decode as much of `pending` as forms complete UTF-8, keeping a split character for later
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Forward a session's output to one client; lagging drops output instead of blocking
fn spawn_forward(
    session_id: String,
    mut rx: broadcast::Receiver<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(data) => {
                    let message = ServerMessage::TerminalOutput {
                        session_id: session_id.clone(),
                        data,
                    };
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "client lagging, output dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Blocking reader fed from a channel; EOF once the sender is dropped
    struct ChannelReader {
        rx: std_mpsc::Receiver<Vec<u8>>,
        buffered: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.buffered.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.buffered = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.buffered.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.drain(..n);
            Ok(n)
        }
    }

    struct FakeProxy {
        reader: Option<ChannelReader>,
        written: Arc<Mutex<Vec<u8>>>,
        sizes: Arc<Mutex<Vec<(u16, u16)>>>,
        closed: Arc<AtomicBool>,
    }

    impl TerminalProxy for FakeProxy {
        fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, BoardError> {
            self.reader
                .take()
                .map(|r| Box::new(r) as Box<dyn Read + Send>)
                .ok_or_else(|| BoardError::Terminal("reader taken".to_string()))
        }

        fn write(&mut self, data: &[u8]) -> Result<(), BoardError> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BoardError> {
            self.sizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Bridge handing out one scripted terminal per open
    #[derive(Default)]
    pub(crate) struct FakeBridge {
        pub feeds: Mutex<Vec<std_mpsc::Sender<Vec<u8>>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub sizes: Arc<Mutex<Vec<(u16, u16)>>>,
        pub closed: Arc<AtomicBool>,
        pub opened: Mutex<Vec<String>>,
    }

    impl TerminalBridge for FakeBridge {
        fn open(&self, target: &str, cols: u16, rows: u16) -> Result<Box<dyn TerminalProxy>, BoardError> {
            let (tx, rx) = std_mpsc::channel();
            self.feeds.lock().unwrap().push(tx);
            self.opened.lock().unwrap().push(target.to_string());
            self.sizes.lock().unwrap().push((cols, rows));
            Ok(Box::new(FakeProxy {
                reader: Some(ChannelReader {
                    rx,
                    buffered: Vec::new(),
                }),
                written: Arc::clone(&self.written),
                sizes: Arc::clone(&self.sizes),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    impl FakeBridge {
        fn feed(&self, data: &str) {
            let feeds = self.feeds.lock().unwrap();
            feeds.last().unwrap().send(data.as_bytes().to_vec()).unwrap();
        }
    }

    fn window(target: &str, activity: u64) -> TmuxWindow {
        let mut window = TmuxWindow::new(target);
        window.activity = activity;
        window.pane_path = "/work/api".to_string();
        window.command = "claude".to_string();
        window
    }

    fn entry(path: &str, mtime: u64) -> LogEntrySnapshot {
        LogEntrySnapshot {
            log_path: PathBuf::from(path),
            mtime,
            birthtime: mtime,
            session_id: None,
            project_path: Some("/work/web".to_string()),
            agent_type: AgentType::Codex,
            is_subagent: false,
            log_token_count: 100,
        }
    }

    fn manager(bridge: Arc<FakeBridge>) -> SessionManager {
        SessionManager::new(bridge, "agentboard")
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[test]
    fn test_upsert_window_is_idempotent() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let (id, created) = sessions.upsert_window(&window("agentboard:1", 5), 1);
        assert!(created);
        let (again, created) = sessions.upsert_window(&window("agentboard:1", 9), 2);
        assert!(!created);
        assert_eq!(id, again);

        let session = sessions.get(&id).unwrap();
        assert_eq!(session.source, SessionSource::Managed);
        assert_eq!(session.agent_type, AgentType::Claude);
        assert_eq!(session.last_activity, 9);

        let (other, _) = sessions.upsert_window(&window("work:1", 5), 3);
        assert_eq!(sessions.get(&other).unwrap().source, SessionSource::External);
    }

    #[test]
    fn test_bind_log_keeps_one_owner() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let log = Path::new("/logs/a.jsonl");
        let first = sessions.bind_log(log, &window("main:1", 1), Some(&entry("/logs/a.jsonl", 50)), 1);
        let second = sessions.bind_log(log, &window("main:2", 1), Some(&entry("/logs/a.jsonl", 60)), 1);

        assert_ne!(first, second);
        assert_eq!(sessions.get(&first).unwrap().log_file_path, None);
        let owner = sessions.get(&second).unwrap();
        assert_eq!(owner.log_file_path.as_deref(), Some(log));
        assert_eq!(owner.last_matched_mtime, Some(60));
        assert_eq!(sessions.known_session_snapshots().len(), 1);
    }

    #[test]
    fn test_discovered_session_merges_into_window() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let mut plain = window("main:1", 1);
        plain.command = "node".to_string();
        plain.pane_path = String::new();
        let discovered = sessions.add_discovered(&entry("/logs/b.jsonl", 70), 1).unwrap();
        assert_eq!(sessions.get(&discovered).unwrap().name, "web");
        assert!(sessions.add_discovered(&entry("/logs/b.jsonl", 70), 1).is_none());

        let owner = sessions.bind_log(Path::new("/logs/b.jsonl"), &plain, None, 2);
        assert_eq!(owner, discovered);
        let owner = sessions.get(&owner).unwrap();
        assert_eq!(owner.window_key(), Some("main:1"));
        assert_eq!(owner.source, SessionSource::External);
        assert_eq!(owner.agent_type, AgentType::Codex);
        assert_eq!(owner.project_path, "/work/web");
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_orphan_keeps_its_id_when_rematched() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let log = Path::new("/logs/a.jsonl");
        let mut old = window("agentboard:1", 1_000);
        old.window_id = "@1".to_string();
        let (id, _) = sessions.upsert_window(&old, 5);
        sessions.bind_log(log, &old, Some(&entry("/logs/a.jsonl", 50)), 5);

        sessions.mark_orphaned(&HashSet::new());
        let candidates = sessions.orphan_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].session_id, id);
        assert_eq!(candidates[0].current_window.as_deref(), Some("@1"));

        // tmux restarted: the same agent shows up under a new window id
        let mut new = window("agentboard:1", 2_000);
        new.window_id = "@9".to_string();
        sessions.upsert_window(&new, 20);
        let bound = sessions.bind_log(log, &new, Some(&entry("/logs/a.jsonl", 80)), 20);

        assert_eq!(bound, id);
        assert_eq!(sessions.len(), 1);
        let session = sessions.get(&id).unwrap();
        assert_eq!(session.window_key(), Some("@9"));
        assert_eq!(session.last_window, None);
        assert_eq!(session.created_at, 5);
        assert_eq!(session.source, SessionSource::Managed);
        assert_eq!(session.log_file_path.as_deref(), Some(log));
        assert_eq!(session.last_matched_mtime, Some(80));
        assert!(sessions.orphan_candidates().is_empty());
    }

    #[test]
    fn test_orphan_folds_into_window_with_its_own_log() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let (orphan, _) = sessions.upsert_window(&window("main:1", 1), 1);
        sessions.bind_log(Path::new("/logs/a.jsonl"), &window("main:1", 1), None, 1);
        sessions.mark_orphaned(&HashSet::new());

        let busy = sessions.bind_log(Path::new("/logs/b.jsonl"), &window("main:2", 1), None, 9);
        let kept = sessions.bind_log(Path::new("/logs/a.jsonl"), &window("main:2", 1), None, 9);

        assert_eq!(kept, busy);
        assert!(sessions.get(&orphan).is_none());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.get(&busy).unwrap().created_at, 1);
    }

    #[test]
    fn test_closed_windows_orphan_then_expire() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let (id, _) = sessions.upsert_window(&window("main:1", 1_000), 1);
        sessions.bind_log(Path::new("/logs/a.jsonl"), &window("main:1", 1_000), None, 1);

        let orphaned = sessions.mark_orphaned(&HashSet::new());
        assert_eq!(orphaned, vec![id.clone()]);
        assert_eq!(sessions.get(&id).unwrap().status, SessionStatus::Orphaned);
        assert_eq!(sessions.orphan_candidates().len(), 1);
        assert!(sessions.mark_orphaned(&HashSet::new()).is_empty());

        assert!(sessions.prune_expired(2_000, 5_000).is_empty());
        assert_eq!(sessions.prune_expired(10_000, 5_000), vec![id]);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_attach_streams_output_and_detach_stops_it() {
        let bridge = Arc::new(FakeBridge::default());
        let mut sessions = manager(Arc::clone(&bridge));
        let (id, _) = sessions.upsert_window(&window("main:1", 1), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.connect_client("c1", tx);
        assert!(matches!(next(&mut rx).await, ServerMessage::Sessions { .. }));

        sessions.handle_client_message(
            "c1",
            ClientMessage::TerminalAttach {
                session_id: id.clone(),
                cols: Some(100),
                rows: Some(30),
            },
        );
        assert_eq!(next(&mut rx).await, attached(&id));
        assert_eq!(*bridge.opened.lock().unwrap(), vec!["main:1".to_string()]);

        bridge.feed("hello");
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::TerminalOutput {
                session_id: id.clone(),
                data: "hello".to_string()
            }
        );

        sessions.handle_client_message(
            "c1",
            ClientMessage::TerminalInput {
                session_id: id.clone(),
                data: "y\r".to_string(),
            },
        );
        assert_eq!(bridge.written.lock().unwrap().as_slice(), b"y\r");

        sessions.handle_client_message("c1", ClientMessage::TerminalDetach { session_id: id.clone() });
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::TerminalDetached {
                session_id: id.clone()
            }
        );
        assert!(bridge.closed.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_output_reaches_only_attached_clients() {
        let bridge = Arc::new(FakeBridge::default());
        let mut sessions = manager(Arc::clone(&bridge));
        let (id, _) = sessions.upsert_window(&window("main:1", 1), 1);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        sessions.connect_client("a", tx_a);
        sessions.connect_client("b", tx_b);
        next(&mut rx_a).await;
        next(&mut rx_b).await;

        sessions
            .attach("a", &id, DEFAULT_COLS, DEFAULT_ROWS)
            .unwrap();
        next(&mut rx_a).await;

        bridge.feed("only for a");
        assert!(matches!(next(&mut rx_a).await, ServerMessage::TerminalOutput { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_errors_are_reported_to_the_client() {
        let mut sessions = manager(Arc::new(FakeBridge::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.connect_client("c1", tx);
        next(&mut rx).await;

        sessions.handle_client_message(
            "c1",
            ClientMessage::TerminalInput {
                session_id: "missing".to_string(),
                data: "x".to_string(),
            },
        );
        match next(&mut rx).await {
            ServerMessage::Error { session_id, .. } => {
                assert_eq!(session_id.as_deref(), Some("missing"))
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_take_utf8_keeps_split_characters() {
        let bytes = "é".as_bytes();
        let mut pending = vec![b'a', bytes[0]];
        assert_eq!(take_utf8(&mut pending), "a");
        pending.push(bytes[1]);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }
}
