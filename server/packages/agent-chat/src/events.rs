use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::checkpoints::Checkpoint;
use crate::config::ChatSettings;
use crate::conversations::ConversationMessage;
use crate::permissions::{PermissionRequest, PermissionStatus};
use crate::session_state::{TokenUpdate, TotalsUpdate};

const RING_BUFFER_SIZE: usize = 1024;
const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_lines: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub content: String,
    pub is_error: bool,
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_lines: Option<Vec<usize>>,
}

/// Everything the core reports to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ChatEvent {
    Ready {
        message: String,
    },
    Loading {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SetProcessing {
        is_processing: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserInput {
        text: String,
        plan_mode: bool,
        thinking_mode: bool,
    },
    Output {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse(ToolUseEvent),
    ToolResult(ToolResultEvent),
    PermissionRequest(PermissionRequest),
    #[serde(rename_all = "camelCase")]
    UpdatePermissionStatus {
        request_id: String,
        status: PermissionStatus,
    },
    #[serde(rename_all = "camelCase")]
    SessionInfo {
        session_id: String,
        #[serde(default)]
        tools: Vec<Value>,
        #[serde(default)]
        mcp_servers: Vec<Value>,
    },
    UpdateTokens(TokenUpdate),
    UpdateTotals(TotalsUpdate),
    #[serde(rename_all = "camelCase")]
    Compacting {
        is_compacting: bool,
    },
    #[serde(rename_all = "camelCase")]
    CompactBoundary {
        trigger: Option<String>,
        pre_tokens: Option<u64>,
    },
    CheckpointCreated(Checkpoint),
    #[serde(rename_all = "camelCase")]
    RestoreSuccess {
        checkpoint_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    AccountInfo {
        subscription_type: String,
    },
    LoginRequired {
        message: Option<String>,
    },
    InstallRequired {
        binary: String,
    },
    SessionCleared,
    #[serde(rename_all = "camelCase")]
    ConversationLoaded {
        filename: String,
        session_id: Option<String>,
        messages: Vec<ConversationMessage>,
    },
    SettingsChanged(ChatSettings),
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether the event belongs in the conversation log.
    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            Self::UserInput { .. }
                | Self::Output { .. }
                | Self::Thinking { .. }
                | Self::ToolUse(_)
                | Self::ToolResult(_)
                | Self::PermissionRequest(_)
                | Self::SessionInfo { .. }
                | Self::UpdateTokens(_)
                | Self::CompactBoundary { .. }
                | Self::CheckpointCreated(_)
                | Self::RestoreSuccess { .. }
                | Self::Error { .. }
        )
    }

    /// Copy suitable for disk: file snapshots are only useful live.
    pub fn for_persistence(&self) -> Self {
        match self {
            Self::ToolUse(tool_use) => Self::ToolUse(ToolUseEvent {
                file_content_before: None,
                ..tool_use.clone()
            }),
            Self::ToolResult(result) => Self::ToolResult(ToolResultEvent {
                file_content_before: None,
                file_content_after: None,
                ..result.clone()
            }),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: ChatEvent,
}

/// Fan-out of chat events with a bounded replay window for late subscribers.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<SequencedEvent>,
    ring: Arc<Mutex<VecDeque<SequencedEvent>>>,
    sequence: Arc<AtomicU64>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn publish(&self, event: ChatEvent) -> u64 {
        let mut ring = self.ring.lock().await;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = SequencedEvent { sequence, event };
        if ring.len() == RING_BUFFER_SIZE {
            ring.pop_front();
        }
        ring.push_back(message.clone());
        let _ = self.sender.send(message);
        sequence
    }

    /// Buffered events after `last_event_id` plus a receiver for new ones,
    /// taken atomically so nothing falls between the two.
    pub async fn subscribe(
        &self,
        last_event_id: Option<u64>,
    ) -> (Vec<SequencedEvent>, broadcast::Receiver<SequencedEvent>) {
        let ring = self.ring.lock().await;
        let replay = ring
            .iter()
            .filter(|message| last_event_id.map_or(true, |last| message.sequence > last))
            .cloned()
            .collect();
        (replay, self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_adjacently_tagged() {
        let value = serde_json::to_value(ChatEvent::SetProcessing {
            is_processing: true,
        })
        .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "setProcessing", "data": {"isProcessing": true}})
        );
        let cleared = serde_json::to_value(ChatEvent::SessionCleared).expect("serialize");
        assert_eq!(cleared, serde_json::json!({"type": "sessionCleared"}));
    }

    #[test]
    fn persistence_copy_drops_file_contents() {
        let event = ChatEvent::ToolResult(ToolResultEvent {
            tool_use_id: Some("tu".to_string()),
            tool_name: Some("Edit".to_string()),
            content: "ok".to_string(),
            is_error: false,
            hidden: false,
            file_path: Some("a.rs".to_string()),
            file_content_before: Some("old".to_string()),
            file_content_after: Some("new".to_string()),
            start_line: Some(3),
            start_lines: None,
        });
        let ChatEvent::ToolResult(stored) = event.for_persistence() else {
            panic!("expected tool result");
        };
        assert_eq!(stored.file_content_before, None);
        assert_eq!(stored.file_content_after, None);
        assert_eq!(stored.start_line, Some(3));
    }

    #[tokio::test]
    async fn late_subscriber_replays_after_last_event_id() {
        let hub = EventHub::new();
        for text in ["a", "b", "c"] {
            hub.publish(ChatEvent::Output {
                text: text.to_string(),
            })
            .await;
        }
        let (replay, mut receiver) = hub.subscribe(Some(1)).await;
        let sequences: Vec<u64> = replay.iter().map(|message| message.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);

        hub.publish(ChatEvent::SessionCleared).await;
        let live = receiver.recv().await.expect("live event");
        assert_eq!(live.sequence, 4);
        assert_eq!(live.event, ChatEvent::SessionCleared);
    }
}
