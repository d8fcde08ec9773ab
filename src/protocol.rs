use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Messages a dashboard client sends, as JSON text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start receiving a session's terminal output
    #[serde(rename_all = "camelCase")]
    TerminalAttach {
        session_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    /// Stop receiving a session's terminal output
    #[serde(rename_all = "camelCase")]
    TerminalDetach { session_id: String },
    /// Keystrokes for an attached session
    #[serde(rename_all = "camelCase")]
    TerminalInput { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Ask for the current session table
    SessionRefresh,
}

/// Messages sent to a dashboard client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Sessions { sessions: Vec<Session> },
    #[serde(rename_all = "camelCase")]
    TerminalAttached { session_id: String },
    #[serde(rename_all = "camelCase")]
    TerminalDetached { session_id: String },
    #[serde(rename_all = "camelCase")]
    TerminalOutput { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let raw = r#"{"type":"terminal-resize","sessionId":"s1","cols":120,"rows":40}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::TerminalResize {
                session_id: "s1".to_string(),
                cols: 120,
                rows: 40
            }
        );

        let attach: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal-attach","sessionId":"s1"}"#).unwrap();
        assert!(matches!(attach, ClientMessage::TerminalAttach { cols: None, .. }));
    }

    #[test]
    fn test_server_message_wire_format() {
        let msg = ServerMessage::TerminalOutput {
            session_id: "s1".to_string(),
            data: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"terminal-output","sessionId":"s1","data":"hi"}"#
        );

        let err = ServerMessage::Error {
            message: "nope".to_string(),
            session_id: None,
        };
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"type":"error","message":"nope"}"#
        );
    }
}
