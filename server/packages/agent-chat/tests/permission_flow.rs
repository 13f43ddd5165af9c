#![cfg(unix)]

mod common;

use agent_chat::events::ChatEvent;
use agent_chat::permissions::{PermissionStatus, ToolRule};
use agent_chat::TurnRequest;
use agent_chat_error::ChatError;
use common::*;
use serde_json::{json, Value};

fn turn(text: &str) -> TurnRequest {
    TurnRequest {
        text: text.to_string(),
        ..TurnRequest::default()
    }
}

/// Asks for `npm install pkg<n>` as request `perm-<n>` on the n-th turn.
const NUMBERED_REQUEST: &str = r#"printf '{"type":"control_request","request_id":"perm-%s","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"npm install pkg%s"},"tool_use_id":"tu-%s"}}\n' "$n" "$n" "$n""#;

fn three_requests() -> Vec<String> {
    ["a", "b", "c"]
        .iter()
        .map(|suffix| {
            emit(json!({
                "type": "control_request",
                "request_id": format!("perm-{suffix}"),
                "request": {
                    "subtype": "can_use_tool",
                    "tool_name": "Write",
                    "input": {"file_path": format!("{suffix}.txt"), "content": "x"},
                    "tool_use_id": format!("tu-{suffix}")
                }
            }))
        })
        .collect()
}

fn control_responses(lines: &[Value]) -> Vec<Value> {
    lines
        .iter()
        .filter(|line| message_type(line) == "control_response")
        .cloned()
        .collect()
}

fn cancelled_ids(events: &[ChatEvent]) -> Vec<String> {
    let mut ids: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::UpdatePermissionStatus {
                request_id,
                status: PermissionStatus::Cancelled,
            } => Some(request_id.clone()),
            _ => None,
        })
        .collect();
    ids.sort();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_allow_reply_reaches_agent_and_preapproves_next_call() {
    let agent = MockAgent::default()
        .on_user(NUMBERED_REQUEST)
        .on_control_response(emit(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "session_id": "sess-p"
        })));
    let mut chat = TestChat::start(agent).await;

    chat.session.send_turn(turn("install it")).await.expect("send");
    let events = chat
        .events_until(|event| matches!(event, ChatEvent::PermissionRequest(_)))
        .await;
    let Some(ChatEvent::PermissionRequest(request)) = events.last() else {
        panic!("expected a permission request");
    };
    assert_eq!(request.request_id, "perm-1");
    assert_eq!(request.pattern.as_deref(), Some("npm install *"));
    assert_eq!(request.status, PermissionStatus::Pending);

    let resolved = chat
        .session
        .reply_permission("perm-1", true, true)
        .await
        .expect("reply");
    assert_eq!(resolved.status, PermissionStatus::Approved);
    let events = chat.until_idle().await;
    assert!(events.contains(&ChatEvent::UpdatePermissionStatus {
        request_id: "perm-1".to_string(),
        status: PermissionStatus::Approved,
    }));

    let responses = control_responses(&chat.stdin_lines());
    assert_eq!(responses.len(), 1);
    let response = &responses[0]["response"];
    assert_eq!(response["subtype"], "success");
    assert_eq!(response["request_id"], "perm-1");
    assert_eq!(response["response"]["behavior"], "allow");
    assert_eq!(response["response"]["toolUseID"], "tu-1");
    assert_eq!(
        response["response"]["updatedInput"]["command"],
        "npm install pkg1"
    );

    let rules = chat.session.list_rules().await;
    assert_eq!(
        rules.get("Bash"),
        Some(&ToolRule::Patterns(vec!["npm install *".to_string()]))
    );

    let err = chat
        .session
        .reply_permission("perm-1", false, false)
        .await
        .expect_err("already resolved");
    assert!(matches!(err, ChatError::PermissionNotFound { .. }));

    // The second call matches the stored rule and never reaches the user.
    chat.session.send_turn(turn("again")).await.expect("send");
    let events = chat.until_idle().await;
    assert!(!events
        .iter()
        .any(|event| matches!(event, ChatEvent::PermissionRequest(_))));
    let responses = control_responses(&chat.stdin_lines());
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1]["response"]["request_id"], "perm-2");
    assert_eq!(responses[1]["response"]["response"]["behavior"], "allow");

    chat.session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denial_interrupts_the_tool_call() {
    let agent = MockAgent::default()
        .on_user(NUMBERED_REQUEST)
        .on_control_response(emit(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false
        })));
    let mut chat = TestChat::start(agent).await;

    chat.session.send_turn(turn("install it")).await.expect("send");
    chat.events_until(|event| matches!(event, ChatEvent::PermissionRequest(_)))
        .await;
    let resolved = chat
        .session
        .reply_permission("perm-1", false, false)
        .await
        .expect("deny");
    assert_eq!(resolved.status, PermissionStatus::Denied);
    chat.until_idle().await;

    let responses = control_responses(&chat.stdin_lines());
    assert_eq!(responses.len(), 1);
    let decision = &responses[0]["response"]["response"];
    assert_eq!(decision["behavior"], "deny");
    assert_eq!(decision["message"], "User denied permission");
    assert_eq!(decision["interrupt"], true);
    assert!(chat.session.list_rules().await.is_empty());

    chat.session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undeliverable_reply_cancels_the_request() {
    // Stops reading stdin before asking, so no answer can reach it.
    let agent = MockAgent::default()
        .on_user("exec 0<&-")
        .on_user(NUMBERED_REQUEST)
        .on_user("sleep 30");
    let mut chat = TestChat::start(agent).await;

    chat.session.send_turn(turn("install it")).await.expect("send");
    chat.events_until(|event| matches!(event, ChatEvent::PermissionRequest(_)))
        .await;

    let err = chat
        .session
        .reply_permission("perm-1", true, true)
        .await
        .expect_err("agent no longer reads stdin");
    assert!(matches!(err, ChatError::StreamError { .. }));

    let events = chat
        .events_until(|event| matches!(event, ChatEvent::UpdatePermissionStatus { .. }))
        .await;
    assert_eq!(
        events.last(),
        Some(&ChatEvent::UpdatePermissionStatus {
            request_id: "perm-1".to_string(),
            status: PermissionStatus::Cancelled,
        })
    );
    assert!(chat.session.snapshot().await.pending_permissions.is_empty());
    assert!(chat.session.list_rules().await.is_empty());

    chat.session.stop().await.expect("stop");
    let filename = chat.session.list_conversations().await[0].filename.clone();
    let record = chat
        .session
        .load_conversation(&filename)
        .await
        .expect("load");
    let statuses: Vec<PermissionStatus> = record
        .messages
        .iter()
        .filter_map(|message| match &message.event {
            ChatEvent::PermissionRequest(request) => Some(request.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![PermissionStatus::Cancelled]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_crash_cancels_pending_requests_without_responses() {
    let mut agent = MockAgent::default();
    for line in three_requests() {
        agent = agent.on_user(line);
    }
    let agent = agent.on_user("echo 'agent crashed' >&2").on_user("exit 1");
    let mut chat = TestChat::start(agent).await;

    chat.session.send_turn(turn("write files")).await.expect("send");
    let events = chat
        .events_until(|event| matches!(event, ChatEvent::Error { .. }))
        .await;

    let requested = events
        .iter()
        .filter(|event| matches!(event, ChatEvent::PermissionRequest(_)))
        .count();
    assert_eq!(requested, 3);
    assert_eq!(cancelled_ids(&events), vec!["perm-a", "perm-b", "perm-c"]);
    assert_eq!(
        events.last(),
        Some(&ChatEvent::Error {
            message: "agent crashed".to_string()
        })
    );
    assert!(control_responses(&chat.stdin_lines()).is_empty());

    let snapshot = chat.session.snapshot().await;
    assert!(snapshot.pending_permissions.is_empty());
    assert!(snapshot.process.is_none());
    assert!(!snapshot.session.processing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_pending_requests_and_persists_status() {
    let mut agent = MockAgent::default();
    for line in three_requests() {
        agent = agent.on_user(line);
    }
    let mut chat = TestChat::start(agent).await;

    chat.session.send_turn(turn("write files")).await.expect("send");
    chat.events_until(|event| {
        matches!(event, ChatEvent::PermissionRequest(request) if request.request_id == "perm-c")
    })
    .await;
    assert_eq!(chat.session.snapshot().await.pending_permissions.len(), 3);

    chat.session.stop().await.expect("stop");
    let events = chat
        .events_until(|event| matches!(event, ChatEvent::Error { .. }))
        .await;
    assert_eq!(cancelled_ids(&events), vec!["perm-a", "perm-b", "perm-c"]);
    assert!(control_responses(&chat.stdin_lines()).is_empty());

    let err = chat
        .session
        .reply_permission("perm-a", true, false)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, ChatError::PermissionNotFound { .. }));

    let filename = chat.session.list_conversations().await[0].filename.clone();
    let record = chat
        .session
        .load_conversation(&filename)
        .await
        .expect("load");
    let statuses: Vec<PermissionStatus> = record
        .messages
        .iter()
        .filter_map(|message| match &message.event {
            ChatEvent::PermissionRequest(request) => Some(request.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![PermissionStatus::Cancelled; 3]);
}
