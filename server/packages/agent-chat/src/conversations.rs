use std::path::{Path, PathBuf};

use agent_chat_error::ChatError;
use serde::{Deserialize, Serialize};

use crate::checkpoints::now_rfc3339;
use crate::events::ChatEvent;
use crate::permissions::PermissionStatus;
use crate::session_state::SessionSummary;

pub const INDEX_LIMIT: usize = 50;
const INDEX_PREVIEW_CHARS: usize = 100;
const SLUG_CHARS: usize = 50;
const DEFAULT_SLUG: &str = "conversation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub timestamp: String,
    pub event: ChatEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub session_id: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub message_count: usize,
    pub total_cost: f64,
    pub total_tokens: TokenTotals,
    pub messages: Vec<ConversationMessage>,
    pub filename: String,
}

impl ConversationRecord {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            total_cost: self.total_cost,
            input_tokens: self.total_tokens.input,
            output_tokens: self.total_tokens.output,
        }
    }

    fn user_messages(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().filter_map(|message| match &message.event {
            ChatEvent::UserInput { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIndexEntry {
    pub filename: String,
    pub session_id: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub message_count: usize,
    pub total_cost: f64,
    pub first_user_message: String,
    pub last_user_message: String,
}

/// `<YYYY-MM-DD_HH-MM>_<slug>.json`, built from the start time and the first
/// user message.
pub fn conversation_filename(start_time: &str, first_user_message: Option<&str>) -> String {
    let stamp: String = start_time
        .chars()
        .take(16)
        .map(|c| match c {
            'T' => '_',
            ':' => '-',
            other => other,
        })
        .collect();
    let slug = first_user_message.map(slugify).unwrap_or_default();
    let slug = if slug.is_empty() {
        DEFAULT_SLUG.to_string()
    } else {
        slug
    };
    format!("{stamp}_{slug}.json")
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut in_whitespace = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                slug.push('-');
            }
            in_whitespace = true;
        } else if c.is_ascii_alphanumeric() {
            slug.push(c);
            in_whitespace = false;
        }
    }
    slug.chars().take(SLUG_CHARS).collect::<String>().to_lowercase()
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Ordered log of the current conversation plus the index of past ones.
///
/// Each append rewrites the whole conversation file and the index.
#[derive(Debug)]
pub struct ConversationStore {
    dir: PathBuf,
    index_path: PathBuf,
    current: ConversationRecord,
    index: Vec<ConversationIndexEntry>,
}

impl ConversationStore {
    pub fn open(dir: impl Into<PathBuf>, index_path: impl Into<PathBuf>) -> Self {
        let index_path = index_path.into();
        let index = match std::fs::read_to_string(&index_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!(path = %index_path.display(), error = %err, "ignoring unreadable conversation index");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            dir: dir.into(),
            index_path,
            current: ConversationRecord::default(),
            index,
        }
    }

    pub fn current(&self) -> &ConversationRecord {
        &self.current
    }

    pub fn list(&self) -> &[ConversationIndexEntry] {
        &self.index
    }

    pub fn latest(&self) -> Option<&ConversationIndexEntry> {
        self.index.first()
    }

    pub fn reset(&mut self) {
        self.current = ConversationRecord::default();
    }

    /// Appends an event and persists; returns its 0-based position.
    pub fn append(&mut self, event: ChatEvent, summary: &SessionSummary) -> Result<usize, ChatError> {
        let timestamp = now_rfc3339();
        if self.current.messages.is_empty() && self.current.start_time.is_empty() {
            self.current.start_time = timestamp.clone();
        }
        self.current.messages.push(ConversationMessage { timestamp, event });
        self.persist(summary)?;
        Ok(self.current.messages.len() - 1)
    }

    /// Rewrites the conversation with fresh totals, e.g. after a result.
    pub fn sync_summary(&mut self, summary: &SessionSummary) -> Result<(), ChatError> {
        if self.current.messages.is_empty() {
            return Ok(());
        }
        self.persist(summary)
    }

    /// In-place status transition of a logged permission request. Terminal
    /// statuses are never overwritten.
    pub fn set_permission_status(
        &mut self,
        request_id: &str,
        status: PermissionStatus,
    ) -> Result<bool, ChatError> {
        let mut changed = false;
        for message in &mut self.current.messages {
            if let ChatEvent::PermissionRequest(request) = &mut message.event {
                if request.request_id == request_id && !request.status.is_terminal() {
                    request.status = status;
                    changed = true;
                }
            }
        }
        if changed {
            self.write_current()?;
        }
        Ok(changed)
    }

    /// Marks every still-pending request as expired; used when a conversation
    /// is loaded without a live process to answer them.
    pub fn expire_pending(&mut self) -> Result<Vec<String>, ChatError> {
        let mut expired = Vec::new();
        for message in &mut self.current.messages {
            if let ChatEvent::PermissionRequest(request) = &mut message.event {
                if request.status == PermissionStatus::Pending {
                    request.status = PermissionStatus::Expired;
                    expired.push(request.request_id.clone());
                }
            }
        }
        if !expired.is_empty() {
            self.write_current()?;
        }
        Ok(expired)
    }

    pub fn load(&mut self, filename: &str) -> Result<&ConversationRecord, ChatError> {
        validate_filename(filename)?;
        let path = self.dir.join(filename);
        let contents = std::fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ChatError::ConversationNotFound {
                    filename: filename.to_string(),
                }
            } else {
                ChatError::persistence(err)
            }
        })?;
        let mut record: ConversationRecord =
            serde_json::from_str(&contents).map_err(ChatError::persistence)?;
        record.filename = filename.to_string();
        tracing::info!(
            filename,
            message_count = record.messages.len(),
            "conversation loaded"
        );
        self.current = record;
        Ok(&self.current)
    }

    fn persist(&mut self, summary: &SessionSummary) -> Result<(), ChatError> {
        let first_user = self.current.user_messages().next().map(str::to_string);
        let filename = conversation_filename(&self.current.start_time, first_user.as_deref());
        if !self.current.filename.is_empty() && self.current.filename != filename {
            let previous = self.current.filename.clone();
            if let Err(err) = std::fs::remove_file(self.dir.join(&previous)) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        filename = %previous,
                        error = %err,
                        "failed to remove renamed conversation file"
                    );
                }
            }
            self.index.retain(|entry| entry.filename != previous);
        }

        self.current.filename = filename;
        self.current.session_id = summary.session_id.clone();
        self.current.total_cost = summary.total_cost;
        self.current.total_tokens = TokenTotals {
            input: summary.input_tokens,
            output: summary.output_tokens,
        };
        self.current.message_count = self.current.messages.len();
        self.current.end_time = now_rfc3339();
        self.write_current()?;
        self.update_index()
    }

    fn write_current(&self) -> Result<(), ChatError> {
        if self.current.filename.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(ChatError::persistence)?;
        let contents =
            serde_json::to_string_pretty(&self.current).map_err(ChatError::persistence)?;
        std::fs::write(self.dir.join(&self.current.filename), contents)
            .map_err(ChatError::persistence)
    }

    fn update_index(&mut self) -> Result<(), ChatError> {
        let entry = ConversationIndexEntry {
            filename: self.current.filename.clone(),
            session_id: self.current.session_id.clone(),
            start_time: self.current.start_time.clone(),
            end_time: self.current.end_time.clone(),
            message_count: self.current.message_count,
            total_cost: self.current.total_cost,
            first_user_message: truncate(
                self.current.user_messages().next().unwrap_or_default(),
                INDEX_PREVIEW_CHARS,
            ),
            last_user_message: truncate(
                self.current.user_messages().last().unwrap_or_default(),
                INDEX_PREVIEW_CHARS,
            ),
        };
        self.insert_index_entry(entry);
        write_index(&self.index_path, &self.index)
    }

    fn insert_index_entry(&mut self, entry: ConversationIndexEntry) {
        self.index.retain(|existing| existing.filename != entry.filename);
        self.index.insert(0, entry);
        self.index.truncate(INDEX_LIMIT);
    }
}

fn write_index(path: &Path, index: &[ConversationIndexEntry]) -> Result<(), ChatError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ChatError::persistence)?;
    }
    let contents = serde_json::to_string_pretty(index).map_err(ChatError::persistence)?;
    std::fs::write(path, contents).map_err(ChatError::persistence)
}

fn validate_filename(filename: &str) -> Result<(), ChatError> {
    let invalid = filename.is_empty()
        || filename.contains(['/', '\\'])
        || filename.starts_with('.')
        || !filename.ends_with(".json");
    if invalid {
        return Err(ChatError::InvalidRequest {
            message: format!("invalid conversation filename: {filename}"),
        });
    }
    Ok(())
}
