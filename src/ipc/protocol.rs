//! Wire format: one JSON object per line, tagged by `type`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log_store::LogEntry;

/// Messages exchanged between the master and its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IpcMessage {
    /// Full log history, sent once right after a client connects.
    History { data: Vec<LogEntry> },
    /// One newly appended entry.
    Log { data: LogEntry },
    /// Client request to restart a service.
    Restart {
        #[serde(rename = "processName")]
        process_name: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty message")]
    Empty,
}

/// Serializes `message` as a single newline-terminated line.
pub fn encode(message: &IpcMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line (without its terminator).
pub fn decode(line: &str) -> Result<IpcMessage, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> LogEntry {
        LogEntry {
            process: "api".into(),
            text: "listening".into(),
            index,
        }
    }

    #[test]
    fn log_message_matches_wire_shape() {
        let line = encode(&IpcMessage::Log { data: entry(7) }).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "log",
                "data": { "process": "api", "text": "listening", "index": 7 }
            })
        );
    }

    #[test]
    fn restart_uses_camel_case_process_name() {
        let message = decode(r#"{"type":"restart","processName":"web"}"#).unwrap();
        assert_eq!(
            message,
            IpcMessage::Restart {
                process_name: "web".into()
            }
        );
        let line = encode(&message).unwrap();
        assert!(line.contains(r#""processName":"web""#));
    }

    #[test]
    fn history_may_be_empty() {
        let message = decode(r#"{"type":"history","data":[]}"#).unwrap();
        assert_eq!(message, IpcMessage::History { data: Vec::new() });
    }

    #[test]
    fn garbage_and_unknown_types_are_rejected() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode(r#"{"type":"shutdown"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(decode("   "), Err(ProtocolError::Empty)));
    }
}
