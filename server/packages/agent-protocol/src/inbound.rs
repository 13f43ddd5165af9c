//! Typed view over the JSON values the agent writes to stdout.
//!
//! Classification never fails: anything that does not fit one of the known
//! shapes is kept verbatim as [`AgentMessage::Unknown`].

use serde::Deserialize;
use serde_json::Value;

const LOGIN_ERROR_MARKER: &str = "Invalid API key";

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponse),
    Unknown(Value),
}

impl AgentMessage {
    pub fn classify(value: Value) -> Self {
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let classified = match message_type.as_str() {
            "system" => Some(Self::System(SystemMessage::from_value(&value))),
            "assistant" => parse(&value).map(Self::Assistant),
            "user" => parse(&value).map(Self::User),
            "result" => parse(&value).map(Self::Result),
            "control_request" => ControlRequest::from_value(&value).map(Self::ControlRequest),
            "control_response" => Some(Self::ControlResponse(ControlResponse {
                response: value.get("response").cloned().unwrap_or(Value::Null),
            })),
            _ => None,
        };
        match classified {
            Some(message) => message,
            None => {
                tracing::debug!(message_type = %message_type, "unclassified agent message");
                Self::Unknown(value)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::ControlRequest(_) => "control_request",
            Self::ControlResponse(_) => "control_response",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(error = %err, "agent message did not match its declared type");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemMessage {
    Init {
        session_id: Option<String>,
        model: Option<String>,
        tools: Vec<Value>,
        mcp_servers: Vec<Value>,
    },
    /// `status` is `None` once a status such as compaction has cleared.
    Status { status: Option<String> },
    CompactBoundary {
        trigger: Option<String>,
        pre_tokens: Option<u64>,
    },
    Other { subtype: String },
}

impl SystemMessage {
    fn from_value(value: &Value) -> Self {
        let subtype = value
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let string_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let array_field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        match subtype {
            "init" => Self::Init {
                session_id: string_field("session_id"),
                model: string_field("model"),
                tools: array_field("tools"),
                mcp_servers: array_field("mcp_servers"),
            },
            "status" => Self::Status {
                status: string_field("status"),
            },
            "compact_boundary" => {
                let metadata = value.get("compact_metadata");
                Self::CompactBoundary {
                    trigger: metadata
                        .and_then(|meta| meta.get("trigger"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    pre_tokens: metadata
                        .and_then(|meta| meta.get("pre_tokens"))
                        .and_then(Value::as_u64),
                }
            }
            other => Self::Other {
                subtype: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantBody,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub content: Vec<AssistantContent>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserMessage {
    pub message: UserBody,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserBody {
    #[serde(default, deserialize_with = "content_blocks")]
    pub content: Vec<UserContent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Echoed user turns carry plain-string content; only block arrays hold
/// tool results.
fn content_blocks<'de, D>(deserializer: D) -> Result<Vec<UserContent>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(_) => serde_json::from_value(value).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u64>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ResultMessage {
    pub fn is_login_error(&self) -> bool {
        self.is_error
            && self
                .result
                .as_deref()
                .is_some_and(|text| text.contains(LOGIN_ERROR_MARKER))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestBody,
}

impl ControlRequest {
    fn from_value(value: &Value) -> Option<Self> {
        let request_id = value.get("request_id")?.as_str()?.to_string();
        let body = value.get("request").cloned().unwrap_or(Value::Null);
        let subtype = body
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request = if subtype == "can_use_tool" {
            ControlRequestBody::CanUseTool(parse(&body)?)
        } else {
            ControlRequestBody::Other { subtype }
        };
        Some(Self {
            request_id,
            request,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequestBody {
    CanUseTool(CanUseTool),
    Other { subtype: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CanUseTool {
    #[serde(default = "unknown_tool")]
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub permission_suggestions: Option<Value>,
    #[serde(default)]
    pub decision_reason: Option<Value>,
    #[serde(default)]
    pub blocked_path: Option<String>,
}

fn unknown_tool() -> String {
    "Unknown Tool".to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub subscription_type: String,
}

impl ControlResponse {
    /// Account details answered to the initialize request, when present.
    pub fn account(&self) -> Option<AccountInfo> {
        let subscription_type = self
            .response
            .get("response")?
            .get("account")?
            .get("subscriptionType")?
            .as_str()?;
        Some(AccountInfo {
            subscription_type: subscription_type.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_system_subtypes() {
        let init = AgentMessage::classify(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "abc",
            "tools": ["Bash", "Edit"],
            "mcp_servers": [{"name": "docs", "status": "connected"}]
        }));
        match init {
            AgentMessage::System(SystemMessage::Init {
                session_id, tools, ..
            }) => {
                assert_eq!(session_id.as_deref(), Some("abc"));
                assert_eq!(tools.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cleared = AgentMessage::classify(json!({"type": "system", "subtype": "status", "status": null}));
        assert_eq!(
            cleared,
            AgentMessage::System(SystemMessage::Status { status: None })
        );

        let boundary = AgentMessage::classify(json!({
            "type": "system",
            "subtype": "compact_boundary",
            "compact_metadata": {"trigger": "auto", "pre_tokens": 800}
        }));
        assert_eq!(
            boundary,
            AgentMessage::System(SystemMessage::CompactBoundary {
                trigger: Some("auto".to_string()),
                pre_tokens: Some(800),
            })
        );
    }

    #[test]
    fn assistant_content_tolerates_unknown_blocks() {
        let message = AgentMessage::classify(json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "hi"},
                    {"type": "server_tool_use", "id": "x"},
                    {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"command": "ls"}}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 3}
            }
        }));
        let AgentMessage::Assistant(assistant) = message else {
            panic!("expected assistant");
        };
        assert_eq!(assistant.message.content.len(), 3);
        assert_eq!(assistant.message.content[1], AssistantContent::Other);
        assert_eq!(
            assistant.message.usage.map(|usage| usage.input_tokens),
            Some(12)
        );
    }

    #[test]
    fn user_message_with_string_content_has_no_blocks() {
        let message = AgentMessage::classify(json!({
            "type": "user",
            "message": {"role": "user", "content": "plain echo"}
        }));
        let AgentMessage::User(user) = message else {
            panic!("expected user");
        };
        assert!(user.message.content.is_empty());
    }

    #[test]
    fn login_error_requires_error_flag_and_marker() {
        let failed: ResultMessage = serde_json::from_value(json!({
            "subtype": "success",
            "is_error": true,
            "result": "Invalid API key · Please run /login"
        }))
        .expect("result");
        assert!(failed.is_login_error());

        let mentioned: ResultMessage = serde_json::from_value(json!({
            "subtype": "success",
            "is_error": false,
            "result": "Invalid API key handling is done"
        }))
        .expect("result");
        assert!(!mentioned.is_login_error());
    }

    #[test]
    fn control_request_subtypes() {
        let permission = AgentMessage::classify(json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "npm install"},
                "tool_use_id": "tu_9"
            }
        }));
        let AgentMessage::ControlRequest(request) = permission else {
            panic!("expected control request");
        };
        assert_eq!(request.request_id, "req-1");
        let ControlRequestBody::CanUseTool(can_use) = request.request else {
            panic!("expected can_use_tool");
        };
        assert_eq!(can_use.tool_name, "Bash");
        assert_eq!(can_use.tool_use_id.as_deref(), Some("tu_9"));

        let other = AgentMessage::classify(json!({
            "type": "control_request",
            "request_id": "req-2",
            "request": {"subtype": "hook_callback"}
        }));
        assert!(matches!(
            other,
            AgentMessage::ControlRequest(ControlRequest {
                request: ControlRequestBody::Other { .. },
                ..
            })
        ));
    }

    #[test]
    fn control_response_exposes_subscription() {
        let message = AgentMessage::classify(json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": "init-1",
                "response": {"account": {"subscriptionType": "max"}}
            }
        }));
        let AgentMessage::ControlResponse(response) = message else {
            panic!("expected control response");
        };
        assert_eq!(
            response.account(),
            Some(AccountInfo {
                subscription_type: "max".to_string()
            })
        );
    }

    #[test]
    fn unknown_and_mistyped_messages_are_kept_raw() {
        let raw = json!({"type": "stream_event", "event": {}});
        assert_eq!(AgentMessage::classify(raw.clone()), AgentMessage::Unknown(raw));

        let mistyped = json!({"type": "assistant", "message": "not an object"});
        assert!(matches!(
            AgentMessage::classify(mistyped),
            AgentMessage::Unknown(_)
        ));
    }
}
