//! JSON-line protocol between the reader and its front-end.
//!
//! Commands arrive one per line on stdin, events leave one per line on
//! stdout. Logs go to stderr.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::chat::{ChatMessage, ResponderKind};
use crate::tokens::Token;
use crate::vocabulary::TopicSummary;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderCommand {
    Ping,
    ListTopics,
    SelectTopic { topic_id: String },
    ToggleWord { index: usize },
    ToggleChatWord { message_id: usize, index: usize },
    ReadAloud,
    StopReading,
    ResetAll,
    ClearTranslations,
    SetSpeechRate { rate: f32 },
    SendChat { text: String },
    SetApiKey { api_key: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Finished,
    Error,
    Stopped,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderEvent {
    Ready,
    Pong,
    Topics {
        topics: Vec<TopicSummary>,
    },
    Rendered {
        topic_id: String,
        topic_name: String,
        entry_count: usize,
        tokens: Vec<Token>,
    },
    TokenUpdated {
        token: Token,
    },
    ReadingStarted {
        total: usize,
    },
    /// `index` is now highlighted; `previous` was un-highlighted.
    ReadingProgress {
        index: usize,
        previous: Option<usize>,
        position: usize,
        total: usize,
    },
    ReadingStopped {
        reason: StopReason,
    },
    SpeechRateChanged {
        rate: f32,
    },
    ChatBusy {
        busy: bool,
    },
    ChatMessage {
        message: ChatMessage,
        answered_by: Option<ResponderKind>,
    },
    ChatTokenUpdated {
        message_id: usize,
        token: Token,
    },
    ChatNotice {
        message: String,
    },
    CredentialRequired,
    CredentialStored,
    Error {
        message: String,
    },
}

pub type EventSender = UnboundedSender<ReaderEvent>;

pub fn emit(events: &EventSender, event: ReaderEvent) {
    if events.send(event).is_err() {
        debug!("Event dropped, front-end channel closed");
    }
}

pub fn emit_error(events: &EventSender, message: &str) {
    emit(
        events,
        ReaderEvent::Error {
            message: message.to_string(),
        },
    );
}

pub fn parse_command(line: &str) -> Result<ReaderCommand, serde_json::Error> {
    serde_json::from_str(line)
}

/// Reads stdin on a blocking thread and forwards parsed commands. The channel
/// closes when stdin does.
pub fn spawn_stdin_reader(events: EventSender) -> UnboundedReceiver<ReaderCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("Unparseable command: {err}");
                    emit_error(&events, &format!("Invalid command: {err}"));
                }
            }
        }
    });
    rx
}

/// Drains events to stdout, one JSON object per line.
pub async fn write_events(mut events: UnboundedReceiver<ReaderEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            Err(err) => warn!("Failed to serialize event: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_parse_from_tagged_json() {
        assert_eq!(parse_command(r#"{"type":"read_aloud"}"#).unwrap(), ReaderCommand::ReadAloud);
        assert_eq!(
            parse_command(r#"{"type":"select_topic","topic_id":"animals"}"#).unwrap(),
            ReaderCommand::SelectTopic {
                topic_id: "animals".into()
            }
        );
        assert_eq!(
            parse_command(r#"{"type":"toggle_chat_word","message_id":3,"index":0}"#).unwrap(),
            ReaderCommand::ToggleChatWord {
                message_id: 3,
                index: 0
            }
        );
        assert!(parse_command(r#"{"type":"dance"}"#).is_err());
        assert!(parse_command(r#"{"type":"toggle_word"}"#).is_err());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(ReaderEvent::ReadingProgress {
            index: 2,
            previous: Some(1),
            position: 3,
            total: 9,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "reading_progress", "index": 2, "previous": 1, "position": 3, "total": 9})
        );
        assert_eq!(
            serde_json::to_value(ReaderEvent::ReadingStopped {
                reason: StopReason::Superseded
            })
            .unwrap(),
            json!({"type": "reading_stopped", "reason": "superseded"})
        );
        assert_eq!(
            serde_json::to_value(ReaderEvent::CredentialRequired).unwrap(),
            json!({"type": "credential_required"})
        );
    }

    #[test]
    fn token_event_shape() {
        let token = Token::new(0, "Hello,", "مرحبا".into());
        let value = serde_json::to_value(ReaderEvent::TokenUpdated { token }).unwrap();
        assert_eq!(value["token"]["original"], "Hello,");
        assert_eq!(value["token"]["clean"], "Hello");
        assert_eq!(value["token"]["display"], "source");
        assert_eq!(value["token"]["reading"], false);
    }
}
