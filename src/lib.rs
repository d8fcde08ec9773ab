pub mod actions;
pub mod config;
pub mod error;
pub mod logs;
pub mod matcher;
pub mod protocol;
pub mod session;
pub mod tmux;
pub mod watcher;
pub mod worker;
