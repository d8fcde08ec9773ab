use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use agent_board::actions::Action;
use agent_board::config::Config;
use agent_board::session::PtyBridge;
use agent_board::tmux::TmuxClient;
use agent_board::watcher::StatusWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env();
    let tmux = TmuxClient::new();
    if !tmux.is_server_running().await {
        warn!("tmux server is not running; waiting for windows to appear");
    }

    let bridge = Arc::new(PtyBridge::new(tmux.clone()));
    let (watcher, handle) =
        StatusWatcher::new(config, tmux, bridge).context("Failed to start match worker")?;

    // Log status changes
    let mut status = handle.status;
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let sessions = status.borrow_and_update().clone();
            for session in &sessions {
                info!(
                    session_id = %session.id,
                    name = %session.name,
                    status = ?session.status,
                    agent = ?session.agent_type,
                    log = ?session.log_file_path,
                    "session"
                );
            }
        }
    });

    // Quit on Ctrl-C
    let quit_tx = handle.actions.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = quit_tx.send(Action::Quit);
        }
    });

    watcher.run().await
}
