use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    AgentNotInstalled,
    SpawnFailed,
    AgentProcessExited,
    LoginRequired,
    PermissionNotFound,
    CheckpointNotFound,
    ConversationNotFound,
    ToolServerNotFound,
    Persistence,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-chat:error:invalid_request",
            Self::Conflict => "urn:agent-chat:error:conflict",
            Self::AgentNotInstalled => "urn:agent-chat:error:agent_not_installed",
            Self::SpawnFailed => "urn:agent-chat:error:spawn_failed",
            Self::AgentProcessExited => "urn:agent-chat:error:agent_process_exited",
            Self::LoginRequired => "urn:agent-chat:error:login_required",
            Self::PermissionNotFound => "urn:agent-chat:error:permission_not_found",
            Self::CheckpointNotFound => "urn:agent-chat:error:checkpoint_not_found",
            Self::ConversationNotFound => "urn:agent-chat:error:conversation_not_found",
            Self::ToolServerNotFound => "urn:agent-chat:error:tool_server_not_found",
            Self::Persistence => "urn:agent-chat:error:persistence",
            Self::StreamError => "urn:agent-chat:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::AgentNotInstalled => "Agent Not Installed",
            Self::SpawnFailed => "Spawn Failed",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::LoginRequired => "Login Required",
            Self::PermissionNotFound => "Permission Not Found",
            Self::CheckpointNotFound => "Checkpoint Not Found",
            Self::ConversationNotFound => "Conversation Not Found",
            Self::ToolServerNotFound => "Tool Server Not Found",
            Self::Persistence => "Persistence Failure",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::AgentNotInstalled => 424,
            Self::SpawnFailed => 502,
            Self::AgentProcessExited => 502,
            Self::LoginRequired => 401,
            Self::PermissionNotFound => 404,
            Self::CheckpointNotFound => 404,
            Self::ConversationNotFound => 404,
            Self::ToolServerNotFound => 404,
            Self::Persistence => 500,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("agent not installed: {binary}")]
    AgentNotInstalled { binary: String },
    #[error("failed to spawn agent `{command}`: {message}")]
    SpawnFailed { command: String, message: String },
    #[error("agent process exited")]
    AgentProcessExited {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("login required")]
    LoginRequired { message: Option<String> },
    #[error("unknown permission request: {request_id}")]
    PermissionNotFound { request_id: String },
    #[error("checkpoint not found: {checkpoint}")]
    CheckpointNotFound { checkpoint: String },
    #[error("conversation not found: {filename}")]
    ConversationNotFound { filename: String },
    #[error("tool server not found: {name}")]
    ToolServerNotFound { name: String },
    #[error("persistence failure: {message}")]
    Persistence { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl ChatError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::AgentNotInstalled { .. } => ErrorType::AgentNotInstalled,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::LoginRequired { .. } => ErrorType::LoginRequired,
            Self::PermissionNotFound { .. } => ErrorType::PermissionNotFound,
            Self::CheckpointNotFound { .. } => ErrorType::CheckpointNotFound,
            Self::ConversationNotFound { .. } => ErrorType::ConversationNotFound,
            Self::ToolServerNotFound { .. } => ErrorType::ToolServerNotFound,
            Self::Persistence { .. } => ErrorType::Persistence,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    fn details(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::AgentNotInstalled { binary } => {
                map.insert("binary".to_string(), Value::String(binary.clone()));
            }
            Self::SpawnFailed { command, .. } => {
                map.insert("command".to_string(), Value::String(command.clone()));
            }
            Self::AgentProcessExited { exit_code, stderr } => {
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::LoginRequired {
                message: Some(message),
            } => {
                map.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::PermissionNotFound { request_id } => {
                map.insert("requestId".to_string(), Value::String(request_id.clone()));
            }
            Self::CheckpointNotFound { checkpoint } => {
                map.insert("checkpoint".to_string(), Value::String(checkpoint.clone()));
            }
            Self::ConversationNotFound { filename } => {
                map.insert("filename".to_string(), Value::String(filename.clone()));
            }
            Self::ToolServerNotFound { name } => {
                map.insert("name".to_string(), Value::String(name.clone()));
            }
            _ => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let details = self.details();
        if !details.is_empty() {
            problem
                .extensions
                .insert("details".to_string(), Value::Object(details));
        }
        problem
    }
}

impl From<ChatError> for ProblemDetails {
    fn from(value: ChatError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ChatError> for ProblemDetails {
    fn from(value: &ChatError) -> Self {
        value.to_problem_details()
    }
}
