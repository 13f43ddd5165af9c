//! Tool-permission negotiation between the agent and the user.
//!
//! A request is either answered immediately from the always-allow rules or
//! parked until the user decides. Every request id receives at most one
//! response: resolving removes it from the pending table, and cancellation
//! sends nothing at all.

mod rules;

use std::collections::HashMap;

use agent_chat_error::ChatError;
use agent_chat_protocol::{CanUseTool, OutboundMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use rules::{command_pattern, matches_pattern, AlwaysAllowStore, ToolRule, COMMAND_TOOL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    Cancelled,
    Expired,
}

impl PermissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    /// Rule that "always allow" would store, for command-shaped tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub status: PermissionStatus,
}

impl PermissionRequest {
    pub fn from_control_request(request_id: &str, request: CanUseTool) -> Self {
        let pattern = if request.tool_name == COMMAND_TOOL {
            request
                .input
                .get("command")
                .and_then(Value::as_str)
                .map(command_pattern)
        } else {
            None
        };
        Self {
            request_id: request_id.to_string(),
            tool_name: request.tool_name,
            input: request.input,
            suggestions: request.permission_suggestions,
            tool_use_id: request.tool_use_id,
            decision_reason: request.decision_reason,
            blocked_path: request.blocked_path,
            pattern,
            status: PermissionStatus::Pending,
        }
    }
}

#[derive(Debug)]
pub enum Negotiation {
    /// Matched an always-allow rule; the response goes straight back.
    AutoApproved(OutboundMessage),
    /// Waiting for the user.
    Pending(PermissionRequest),
}

#[derive(Debug)]
pub struct Resolution {
    pub request: PermissionRequest,
    pub response: OutboundMessage,
    always_allow: bool,
}

#[derive(Debug)]
pub struct PermissionNegotiator {
    rules: AlwaysAllowStore,
    pending: HashMap<String, PermissionRequest>,
}

impl PermissionNegotiator {
    pub fn new(rules: AlwaysAllowStore) -> Self {
        Self {
            rules,
            pending: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &AlwaysAllowStore {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut AlwaysAllowStore {
        &mut self.rules
    }

    pub fn pending(&self) -> Vec<PermissionRequest> {
        self.pending.values().cloned().collect()
    }

    pub fn on_request(&mut self, request_id: &str, request: CanUseTool) -> Negotiation {
        if self.rules.is_pre_approved(&request.tool_name, &request.input) {
            tracing::info!(
                request_id,
                tool = %request.tool_name,
                "tool call pre-approved by always-allow rule"
            );
            return Negotiation::AutoApproved(OutboundMessage::permission_allow(
                request_id,
                request.input,
                None,
                request.tool_use_id,
            ));
        }

        let request = PermissionRequest::from_control_request(request_id, request);
        tracing::info!(
            request_id,
            tool = %request.tool_name,
            pending = self.pending.len() + 1,
            "tool call awaiting user decision"
        );
        self.pending.insert(request_id.to_string(), request.clone());
        Negotiation::Pending(request)
    }

    /// Takes a pending request out of the table and builds its response.
    /// Unknown and already-resolved ids are rejected without producing one.
    /// Nothing is remembered until [`Self::commit`] runs.
    pub fn decide(
        &mut self,
        request_id: &str,
        approved: bool,
        always_allow: bool,
    ) -> Result<Resolution, ChatError> {
        let mut request =
            self.pending
                .remove(request_id)
                .ok_or_else(|| ChatError::PermissionNotFound {
                    request_id: request_id.to_string(),
                })?;

        let response = if approved {
            request.status = PermissionStatus::Approved;
            OutboundMessage::permission_allow(
                request_id,
                request.input.clone(),
                always_allow.then(|| request.suggestions.clone()).flatten(),
                request.tool_use_id.clone(),
            )
        } else {
            request.status = PermissionStatus::Denied;
            OutboundMessage::permission_deny(request_id, request.tool_use_id.clone())
        };
        tracing::info!(request_id, status = ?request.status, "tool permission resolved");
        Ok(Resolution {
            request,
            response,
            always_allow: approved && always_allow,
        })
    }

    /// Applies a decision whose response reached the agent.
    pub fn commit(&mut self, resolution: &Resolution) {
        if !resolution.always_allow {
            return;
        }
        let request = &resolution.request;
        if let Err(err) = self.rules.remember(&request.tool_name, &request.input) {
            tracing::warn!(
                request_id = %request.request_id,
                error = %err,
                "failed to persist always-allow rule"
            );
        }
    }

    /// Drops every pending request because its process is gone. No response
    /// is produced for any of them.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.pending.drain().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "cancelled pending tool permissions");
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn negotiator() -> (tempfile::TempDir, PermissionNegotiator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = AlwaysAllowStore::load(dir.path().join("permissions.json"));
        (dir, PermissionNegotiator::new(rules))
    }

    fn can_use(tool: &str, input: Value) -> CanUseTool {
        CanUseTool {
            tool_name: tool.to_string(),
            input,
            tool_use_id: Some("tu_1".to_string()),
            permission_suggestions: Some(json!([{"type": "addRules"}])),
            decision_reason: None,
            blocked_path: None,
        }
    }

    fn response_value(message: &OutboundMessage) -> Value {
        serde_json::to_value(message).expect("serialize")["response"]["response"].clone()
    }

    #[test]
    fn decision_is_answered_exactly_once() {
        let (_dir, mut negotiator) = negotiator();
        let Negotiation::Pending(request) =
            negotiator.on_request("r-1", can_use("Bash", json!({"command": "ls"})))
        else {
            panic!("expected pending");
        };
        assert_eq!(request.status, PermissionStatus::Pending);

        let resolution = negotiator.decide("r-1", false, false).expect("decide");
        assert_eq!(resolution.request.status, PermissionStatus::Denied);
        let response = response_value(&resolution.response);
        assert_eq!(response["behavior"], "deny");
        assert_eq!(response["interrupt"], true);
        assert_eq!(response["message"], "User denied permission");

        let again = negotiator.decide("r-1", true, false).expect_err("second");
        assert!(matches!(again, ChatError::PermissionNotFound { .. }));
    }

    #[test]
    fn always_allow_stores_rule_and_forwards_suggestions() {
        let (_dir, mut negotiator) = negotiator();
        negotiator.on_request("r-1", can_use("Bash", json!({"command": "npm install lodash"})));
        let resolution = negotiator.decide("r-1", true, true).expect("decide");
        let response = response_value(&resolution.response);
        assert_eq!(response["behavior"], "allow");
        assert_eq!(response["updatedPermissions"], json!([{"type": "addRules"}]));
        assert_eq!(response["toolUseID"], "tu_1");
        negotiator.commit(&resolution);

        match negotiator.on_request("r-2", can_use("Bash", json!({"command": "npm install react"}))) {
            Negotiation::AutoApproved(message) => {
                let value = serde_json::to_value(&message).expect("serialize");
                assert_eq!(value["response"]["request_id"], "r-2");
            }
            Negotiation::Pending(_) => panic!("expected auto approval"),
        }
        assert!(negotiator.pending().is_empty());
    }

    #[test]
    fn uncommitted_decision_stores_no_rule() {
        let (_dir, mut negotiator) = negotiator();
        negotiator.on_request("r-1", can_use("Bash", json!({"command": "npm install lodash"})));
        let resolution = negotiator.decide("r-1", true, true).expect("decide");
        assert_eq!(resolution.request.status, PermissionStatus::Approved);
        assert!(negotiator.rules().snapshot().is_empty());

        negotiator.on_request("r-2", can_use("Bash", json!({"command": "npm install react"})));
        let denied = negotiator.decide("r-2", false, true).expect("decide");
        negotiator.commit(&denied);
        assert!(negotiator.rules().snapshot().is_empty());
    }

    #[test]
    fn plain_approval_does_not_forward_suggestions() {
        let (_dir, mut negotiator) = negotiator();
        negotiator.on_request("r-1", can_use("Write", json!({"file_path": "a.txt"})));
        let resolution = negotiator.decide("r-1", true, false).expect("decide");
        let response = response_value(&resolution.response);
        assert!(response.get("updatedPermissions").is_none());
        assert_eq!(response["updatedInput"], json!({"file_path": "a.txt"}));
    }

    #[test]
    fn cancellation_leaves_nothing_to_answer() {
        let (_dir, mut negotiator) = negotiator();
        for id in ["a", "b", "c"] {
            negotiator.on_request(id, can_use("Edit", json!({})));
        }
        let mut cancelled = negotiator.cancel_all();
        cancelled.sort();
        assert_eq!(cancelled, vec!["a", "b", "c"]);
        assert!(negotiator.decide("a", true, false).is_err());
    }

    #[test]
    fn command_requests_carry_their_pattern() {
        let request = PermissionRequest::from_control_request(
            "r-1",
            can_use("Bash", json!({"command": "git push origin main"})),
        );
        assert_eq!(request.pattern.as_deref(), Some("git push *"));
    }
}
