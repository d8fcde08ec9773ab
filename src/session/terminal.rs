use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::BoardError;
use crate::tmux::TmuxClient;

/// Input chunks allowed to wait for a slow terminal before input is refused
const INPUT_QUEUE_DEPTH: usize = 64;

/// Opens live terminal attachments to tmux windows
pub trait TerminalBridge: Send + Sync {
    fn open(&self, target: &str, cols: u16, rows: u16) -> Result<Box<dyn TerminalProxy>, BoardError>;
}

/// One open attachment
pub trait TerminalProxy: Send {
    /// Output stream of the attachment
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, BoardError>;
    fn write(&mut self, data: &[u8]) -> Result<(), BoardError>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BoardError>;
    fn close(&mut self);
}

/// Runs `tmux attach-session` inside a PTY per attachment
pub struct PtyBridge {
    tmux: TmuxClient,
}

impl PtyBridge {
    pub fn new(tmux: TmuxClient) -> Self {
        Self { tmux }
    }
}

impl TerminalBridge for PtyBridge {
    fn open(&self, target: &str, cols: u16, rows: u16) -> Result<Box<dyn TerminalProxy>, BoardError> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| BoardError::Terminal(e.to_string()))?;

        let argv = self.tmux.attach_command(target);
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BoardError::Terminal(e.to_string()))?;
        // Only the master side is needed once the child owns the slave
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BoardError::Terminal(e.to_string()))?;

        let input = InputQueue::spawn(target, writer)?;

        info!(target, cols, rows, "terminal attached");
        Ok(Box::new(PtyProxy {
            master: pair.master,
            input,
            child,
        }))
    }
}

/// Keystrokes handed to a dedicated writer thread, so a terminal that stops
/// reading never stalls the caller
pub(crate) struct InputQueue {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InputQueue {
    pub(crate) fn spawn(target: &str, mut writer: Box<dyn Write + Send>) -> Result<Self, BoardError> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name(format!("pty-input-{}", target))
            .spawn(move || {
                while let Some(data) = rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                        debug!(error = %e, "terminal write failed");
                        break;
                    }
                }
            })?;
        Ok(Self { tx })
    }

    pub(crate) fn send(&self, data: &[u8]) -> Result<(), BoardError> {
        self.tx.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BoardError::Terminal("terminal is not accepting input".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                BoardError::Terminal("terminal input closed".to_string())
            }
        })
    }
}

struct PtyProxy {
    master: Box<dyn MasterPty + Send>,
    input: InputQueue,
    child: Box<dyn Child + Send>,
}

impl TerminalProxy for PtyProxy {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, BoardError> {
        self.master
            .try_clone_reader()
            .map_err(|e| BoardError::Terminal(e.to_string()))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), BoardError> {
        self.input.send(data)
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BoardError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| BoardError::Terminal(e.to_string()))
    }

    fn close(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "attach client already gone");
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}
