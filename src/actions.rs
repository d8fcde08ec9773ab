use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};

/// Actions that can be dispatched to the control loop
#[derive(Debug)]
pub enum Action {
    /// A dashboard client connected; replies go to `tx`
    ClientConnected {
        client_id: String,
        tx: mpsc::UnboundedSender<ServerMessage>,
    },
    /// A client sent a protocol message
    ClientMessage {
        client_id: String,
        message: ClientMessage,
    },
    /// A client went away
    ClientDisconnected { client_id: String },
    /// Request to stop the control loop
    Quit,
}
