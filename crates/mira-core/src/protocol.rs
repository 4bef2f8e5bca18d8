use serde::{Deserialize, Serialize};

use crate::events::{IpcCommand, IpcEvent};

/// One JSON line on the sidecar pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub id: String,
    #[serde(flatten)]
    pub content: IpcMessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcMessageContent {
    Command(IpcCommand),
    Event(IpcEvent),
}

impl IpcMessage {
    pub fn new_command(command: IpcCommand) -> Self {
        Self {
            id: generate_id(),
            content: IpcMessageContent::Command(command),
        }
    }

    pub fn new_event(event: IpcEvent) -> Self {
        Self {
            id: generate_id(),
            content: IpcMessageContent::Event(event),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default() + "\n"
    }

    pub fn from_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_is_newline_terminated() {
        let msg = IpcMessage::new_command(IpcCommand::Shutdown);
        let line = msg.to_line();
        assert!(line.ends_with('\n'));
        let parsed = IpcMessage::from_line(&line).unwrap();
        assert_eq!(parsed.id, msg.id);
        assert!(matches!(parsed.content, IpcMessageContent::Command(IpcCommand::Shutdown)));
    }

    #[test]
    fn test_event_line_parses_as_event() {
        let line = r#"{"id":"x","type":"Connected","payload":{"account_id":7,"phone_number":"62811"}}"#;
        let parsed = IpcMessage::from_line(line).unwrap();
        match parsed.content {
            IpcMessageContent::Event(IpcEvent::Connected { account_id, .. }) => {
                assert_eq!(account_id, 7)
            }
            other => panic!("unexpected content {other:?}"),
        }
    }
}
