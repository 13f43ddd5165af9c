#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use agent_chat::config::ChatConfig;
use agent_chat::events::{ChatEvent, SequencedEvent};
use agent_chat::ChatSession;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Shell line printing one JSON message to stdout.
pub fn emit(message: Value) -> String {
    let line = message.to_string();
    assert!(!line.contains('\''), "mock output must not contain single quotes");
    format!("printf '%s\\n' '{line}'")
}

/// Body of a stand-in agent. Every stdin line is appended to `stdin.log`,
/// every launch appends its arguments to `args.log`.
#[derive(Debug, Default, Clone)]
pub struct MockAgent {
    pub on_user: Vec<String>,
    pub on_control_response: Vec<String>,
}

impl MockAgent {
    pub fn on_user(mut self, line: impl Into<String>) -> Self {
        self.on_user.push(line.into());
        self
    }

    pub fn on_control_response(mut self, line: impl Into<String>) -> Self {
        self.on_control_response.push(line.into());
        self
    }

    fn script(&self, dir: &Path) -> String {
        let stdin_log = dir.join("stdin.log").display().to_string();
        let args_log = dir.join("args.log").display().to_string();
        let block = |lines: &[String]| {
            if lines.is_empty() {
                "      :".to_string()
            } else {
                lines
                    .iter()
                    .map(|line| format!("      {line}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        format!(
            "#!/bin/sh\n\
             printf '%s\\n' \"$*\" >> '{args_log}'\n\
             n=0\n\
             while IFS= read -r line; do\n\
             \x20 printf '%s\\n' \"$line\" >> '{stdin_log}'\n\
             \x20 case \"$line\" in\n\
             \x20   *'\"type\":\"user\"'*)\n\
             \x20     n=$((n+1))\n\
             {user}\n\
             \x20     ;;\n\
             \x20   *'\"type\":\"control_response\"'*)\n\
             {response}\n\
             \x20     ;;\n\
             \x20 esac\n\
             done\n",
            user = block(&self.on_user),
            response = block(&self.on_control_response),
        )
    }
}

pub struct TestChat {
    pub session: ChatSession,
    pub events: broadcast::Receiver<SequencedEvent>,
    pub workspace: TempDir,
    pub storage: TempDir,
    pub bin: TempDir,
}

impl TestChat {
    pub async fn start(agent: MockAgent) -> Self {
        let bin = tempfile::tempdir().expect("bin dir");
        let program = bin.path().join("agent.sh");
        std::fs::write(&program, agent.script(bin.path())).expect("write agent");
        let mut permissions = std::fs::metadata(&program).expect("metadata").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&program, permissions).expect("chmod");

        Self::start_with_binary(program.display().to_string(), bin).await
    }

    pub async fn start_with_binary(agent_binary: String, bin: TempDir) -> Self {
        let workspace = tempfile::tempdir().expect("workspace");
        let storage = tempfile::tempdir().expect("storage");
        let mut config = ChatConfig::new(workspace.path(), storage.path());
        config.agent_binary = agent_binary;
        let session = ChatSession::start(config).await.expect("start session");
        let (_, events) = session.subscribe(None).await;
        Self {
            session,
            events,
            workspace,
            storage,
            bin,
        }
    }

    pub fn stdin_lines(&self) -> Vec<Value> {
        read_lines(&self.bin.path().join("stdin.log"))
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn launch_args(&self) -> Vec<String> {
        read_lines(&self.bin.path().join("args.log"))
    }

    /// Events up to and including the first one matching `done`.
    pub async fn events_until(&mut self, done: impl Fn(&ChatEvent) -> bool) -> Vec<ChatEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let received = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for event; saw {seen:#?}"));
            match received {
                Ok(message) => {
                    let matched = done(&message.event);
                    seen.push(message.event);
                    if matched {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    }

    pub async fn until_idle(&mut self) -> Vec<ChatEvent> {
        self.events_until(|event| {
            matches!(
                event,
                ChatEvent::SetProcessing {
                    is_processing: false
                }
            )
        })
        .await
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn message_type(value: &Value) -> &str {
    value.get("type").and_then(Value::as_str).unwrap_or_default()
}
