use serde::Serialize;
use serde_json::Value;

use crate::codec::{CodecError, LineCodec};

pub const DENIED_MESSAGE: &str = "User denied permission";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ControlRequest {
        request_id: String,
        request: OutboundControlRequest,
    },
    User {
        session_id: String,
        message: UserTurn,
        parent_tool_use_id: Option<String>,
    },
    ControlResponse {
        response: ControlResponseEnvelope,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundControlRequest {
    Initialize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserTurn {
    pub role: &'static str,
    pub content: Vec<TextBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextBlock {
    #[serde(rename = "type")]
    pub block_type: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponseEnvelope {
    pub subtype: &'static str,
    pub request_id: String,
    pub response: PermissionDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(rename = "updatedPermissions", skip_serializing_if = "Option::is_none")]
    pub updated_permissions: Option<Value>,
    #[serde(rename = "toolUseID", skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<bool>,
}

impl OutboundMessage {
    pub fn initialize(request_id: impl Into<String>) -> Self {
        Self::ControlRequest {
            request_id: request_id.into(),
            request: OutboundControlRequest::Initialize,
        }
    }

    /// A user turn. The session id is empty until the agent has assigned one.
    pub fn user_turn(session_id: Option<&str>, text: impl Into<String>) -> Self {
        Self::User {
            session_id: session_id.unwrap_or_default().to_string(),
            message: UserTurn {
                role: "user",
                content: vec![TextBlock {
                    block_type: "text",
                    text: text.into(),
                }],
            },
            parent_tool_use_id: None,
        }
    }

    /// Approves a tool call, echoing its input back unchanged. Suggestions are
    /// only forwarded when the user chose to always allow the tool.
    pub fn permission_allow(
        request_id: impl Into<String>,
        input: Value,
        suggestions: Option<Value>,
        tool_use_id: Option<String>,
    ) -> Self {
        Self::control_response(
            request_id,
            PermissionDecision {
                behavior: PermissionBehavior::Allow,
                updated_input: Some(input),
                updated_permissions: suggestions,
                tool_use_id,
                message: None,
                interrupt: None,
            },
        )
    }

    pub fn permission_deny(request_id: impl Into<String>, tool_use_id: Option<String>) -> Self {
        Self::control_response(
            request_id,
            PermissionDecision {
                behavior: PermissionBehavior::Deny,
                updated_input: None,
                updated_permissions: None,
                tool_use_id,
                message: Some(DENIED_MESSAGE.to_string()),
                interrupt: Some(true),
            },
        )
    }

    fn control_response(request_id: impl Into<String>, decision: PermissionDecision) -> Self {
        Self::ControlResponse {
            response: ControlResponseEnvelope {
                subtype: "success",
                request_id: request_id.into(),
                response: decision,
            },
        }
    }

    pub fn to_line(&self) -> Result<Vec<u8>, CodecError> {
        LineCodec::encode(self)
    }
}
