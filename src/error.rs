use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} has no live window")]
    NoWindow(String),

    #[error("session {0} is not attached")]
    NotAttached(String),

    #[error("terminal error: {0}")]
    Terminal(String),

    #[error("match worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
