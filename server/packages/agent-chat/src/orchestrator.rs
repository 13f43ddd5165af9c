//! One chat session: turns in, agent output routed, state persisted.
//!
//! All mutable state sits behind a single async mutex. Process output is
//! consumed by one dispatch task in arrival order; user commands take the
//! same lock, so a decision never races the message it answers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use agent_chat_error::ChatError;
use agent_chat_protocol::{
    AgentMessage, AssistantContent, AssistantMessage, ControlRequest, ControlRequestBody,
    OutboundMessage, ResultMessage, SystemMessage, UserContent, UserMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::checkpoints::{Checkpoint, CheckpointManager};
use crate::config::{AgentModel, ChatConfig, ChatSettings};
use crate::conversations::{ConversationIndexEntry, ConversationRecord, ConversationStore};
use crate::events::{ChatEvent, EventHub, SequencedEvent};
use crate::mcp_config::ToolConfigStore;
use crate::permissions::{
    AlwaysAllowStore, Negotiation, PermissionNegotiator, PermissionRequest, PermissionStatus,
    ToolRule,
};
use crate::session_state::{SessionSnapshot, SessionState};
use crate::supervisor::{
    LaunchOptions, LaunchSpec, ProcessEvent, ProcessHandle, ProcessSupervisor, SupervisorEvent,
};
use crate::tool_calls::ToolCallTracker;

const STOPPED_MESSAGE: &str = "Agent was stopped.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub text: String,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub thinking_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub workspace: String,
    pub session: SessionSnapshot,
    pub settings: ChatSettings,
    pub pending_permissions: Vec<PermissionRequest>,
    pub process: Option<ProcessInfo>,
}

struct SessionCore {
    settings: ChatSettings,
    session: SessionState,
    negotiator: PermissionNegotiator,
    checkpoints: CheckpointManager,
    conversations: ConversationStore,
    tool_config: ToolConfigStore,
    tool_calls: ToolCallTracker,
}

struct SessionInner {
    workspace: PathBuf,
    agent_binary: String,
    supervisor: ProcessSupervisor,
    events: EventHub,
    core: Mutex<SessionCore>,
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Opens storage and starts the dispatch task. Must run inside a tokio
    /// runtime.
    pub async fn start(config: ChatConfig) -> Result<Self, ChatError> {
        let paths = config.paths();
        std::fs::create_dir_all(paths.root()).map_err(ChatError::persistence)?;

        let tool_config = ToolConfigStore::new(paths.tool_config_file());
        if let Err(err) = tool_config.initialize() {
            tracing::warn!(error = %err, "failed to initialize tool server config");
        }
        let core = SessionCore {
            settings: config.settings.clone(),
            session: SessionState::new(config.model),
            negotiator: PermissionNegotiator::new(AlwaysAllowStore::load(
                paths.permissions_file(),
            )),
            checkpoints: CheckpointManager::new(paths.backup_git_dir(), &config.workspace),
            conversations: ConversationStore::open(
                paths.conversations_dir(),
                paths.conversation_index(),
            ),
            tool_config,
            tool_calls: ToolCallTracker::new(&config.workspace),
        };

        let (supervisor, receiver) = ProcessSupervisor::new();
        let inner = Arc::new(SessionInner {
            workspace: config.workspace.clone(),
            agent_binary: config.agent_binary.clone(),
            supervisor,
            events: EventHub::new(),
            core: Mutex::new(core),
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), receiver));

        tracing::info!(
            workspace = %config.workspace.display(),
            storage = %paths.root().display(),
            "chat session ready"
        );
        inner
            .events
            .publish(ChatEvent::Ready {
                message: "Ready to chat".to_string(),
            })
            .await;
        Ok(Self { inner })
    }

    pub async fn subscribe(
        &self,
        last_event_id: Option<u64>,
    ) -> (Vec<SequencedEvent>, broadcast::Receiver<SequencedEvent>) {
        self.inner.events.subscribe(last_event_id).await
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let core = self.inner.core.lock().await;
        let process = self
            .inner
            .supervisor
            .current()
            .await
            .map(|handle| ProcessInfo {
                pid: handle.pid(),
                generation: handle.generation(),
            });
        ChatSnapshot {
            workspace: self.inner.workspace.display().to_string(),
            session: core.session.snapshot(),
            settings: core.settings.clone(),
            pending_permissions: core.negotiator.pending(),
            process,
        }
    }

    pub async fn send_turn(&self, request: TurnRequest) -> Result<(), ChatError> {
        if request.text.trim().is_empty() {
            return Err(ChatError::InvalidRequest {
                message: "message text must not be empty".to_string(),
            });
        }
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if core.session.is_processing() {
            return Err(ChatError::Conflict {
                message: "a turn is already in progress".to_string(),
            });
        }

        core.session.set_processing(true);
        self.inner
            .emit(core, ChatEvent::SetProcessing { is_processing: true })
            .await;
        self.inner
            .emit(
                core,
                ChatEvent::UserInput {
                    text: request.text.clone(),
                    plan_mode: request.plan_mode,
                    thinking_mode: request.thinking_mode,
                },
            )
            .await;

        match core.checkpoints.create(&request.text).await {
            Ok(checkpoint) => {
                self.inner
                    .emit(core, ChatEvent::CheckpointCreated(checkpoint))
                    .await
            }
            Err(err) => tracing::warn!(error = %err, "checkpoint failed; sending turn anyway"),
        }

        if let Err(err) = self.inner.write_turn(core, &request).await {
            self.inner.fail_turn(core, &err).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ChatError> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let stopped = self.inner.stop_process(core).await;
        if core.session.is_processing() {
            core.session.set_processing(false);
            self.inner
                .emit(core, ChatEvent::SetProcessing { is_processing: false })
                .await;
        }
        if stopped {
            self.inner.emit(core, ChatEvent::error(STOPPED_MESSAGE)).await;
        }
        Ok(())
    }

    pub async fn new_session(&self) -> Result<(), ChatError> {
        let mut guard = self.inner.core.lock().await;
        self.inner.reset_session(&mut guard).await;
        Ok(())
    }

    pub async fn reply_permission(
        &self,
        request_id: &str,
        approved: bool,
        always_allow: bool,
    ) -> Result<PermissionRequest, ChatError> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let resolution = core.negotiator.decide(request_id, approved, always_allow)?;

        let delivered = match self.inner.supervisor.current().await {
            Some(handle) => handle
                .write(&resolution.response)
                .await
                .map_err(ChatError::from),
            None => Err(ChatError::StreamError {
                message: "agent process is not running".to_string(),
            }),
        };
        if let Err(err) = delivered {
            // The agent never hears this answer, so the request ends cancelled.
            tracing::warn!(request_id, error = %err, "permission response not delivered");
            self.inner
                .record_permission_status(core, request_id, PermissionStatus::Cancelled)
                .await;
            return Err(err);
        }

        core.negotiator.commit(&resolution);
        self.inner
            .record_permission_status(core, request_id, resolution.request.status)
            .await;
        Ok(resolution.request)
    }

    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint, ChatError> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let checkpoint = core.checkpoints.restore(checkpoint_id).await?;
        self.inner
            .emit(
                core,
                ChatEvent::RestoreSuccess {
                    checkpoint_id: checkpoint.id.clone(),
                    message: format!("Restored checkpoint: {}", checkpoint.message),
                },
            )
            .await;
        Ok(checkpoint)
    }

    pub async fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.inner.core.lock().await.checkpoints.list().to_vec()
    }

    pub async fn list_conversations(&self) -> Vec<ConversationIndexEntry> {
        self.inner.core.lock().await.conversations.list().to_vec()
    }

    /// Replaces the active conversation with a saved one. The next turn
    /// resumes the saved agent session.
    pub async fn load_conversation(&self, filename: &str) -> Result<ConversationRecord, ChatError> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if core.session.is_processing() {
            return Err(ChatError::Conflict {
                message: "cannot load a conversation while a turn is in progress".to_string(),
            });
        }
        self.inner.stop_process(core).await;

        let summary = core.conversations.load(filename)?.summary();
        core.session.reseed(&summary);
        core.checkpoints.clear();
        core.tool_calls.clear();
        match core.conversations.expire_pending() {
            Ok(expired) if !expired.is_empty() => {
                tracing::info!(count = expired.len(), "expired pending permission requests");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "failed to persist expired permissions"),
        }

        let record = core.conversations.current().clone();
        self.inner
            .events
            .publish(ChatEvent::ConversationLoaded {
                filename: record.filename.clone(),
                session_id: record.session_id.clone(),
                messages: record.messages.clone(),
            })
            .await;
        self.inner
            .events
            .publish(ChatEvent::UpdateTotals(core.session.totals()))
            .await;
        Ok(record)
    }

    /// Takes effect on the next turn, which restarts the agent with `--resume`.
    pub async fn select_model(&self, model: AgentModel) -> SessionSnapshot {
        let mut core = self.inner.core.lock().await;
        core.session.set_model(model);
        tracing::info!(model = %model, "model selected");
        core.session.snapshot()
    }

    pub async fn settings(&self) -> ChatSettings {
        self.inner.core.lock().await.settings.clone()
    }

    pub async fn update_settings(&self, settings: ChatSettings) -> ChatSettings {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let environment_changed = core.settings.environment != settings.environment;
        core.settings = settings.clone();
        if environment_changed {
            tracing::info!("execution environment changed; starting a new session");
            self.inner.reset_session(core).await;
        }
        self.inner
            .events
            .publish(ChatEvent::SettingsChanged(settings.clone()))
            .await;
        settings
    }

    pub async fn list_rules(&self) -> BTreeMap<String, ToolRule> {
        self.inner.core.lock().await.negotiator.rules().snapshot()
    }

    pub async fn add_rule(
        &self,
        tool_name: &str,
        command: Option<&str>,
    ) -> Result<BTreeMap<String, ToolRule>, ChatError> {
        let mut core = self.inner.core.lock().await;
        core.negotiator.rules_mut().add(tool_name, command)?;
        Ok(core.negotiator.rules().snapshot())
    }

    pub async fn remove_rule(
        &self,
        tool_name: &str,
        command: Option<&str>,
    ) -> Result<BTreeMap<String, ToolRule>, ChatError> {
        let mut core = self.inner.core.lock().await;
        core.negotiator.rules_mut().remove(tool_name, command)?;
        Ok(core.negotiator.rules().snapshot())
    }

    pub async fn list_tool_servers(&self) -> Result<Map<String, Value>, ChatError> {
        self.inner.core.lock().await.tool_config.list()
    }

    pub async fn save_tool_server(&self, name: &str, config: Value) -> Result<(), ChatError> {
        self.inner.core.lock().await.tool_config.save(name, config)
    }

    pub async fn delete_tool_server(&self, name: &str) -> Result<(), ChatError> {
        self.inner.core.lock().await.tool_config.delete(name)
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.core.lock().await;
        self.inner.stop_process(&mut guard).await;
    }
}

async fn dispatch_loop(
    inner: Weak<SessionInner>,
    mut receiver: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(event).await;
    }
    tracing::debug!("dispatch loop finished");
}

impl SessionInner {
    /// Publishes an event and appends it to the conversation log when it
    /// belongs there.
    async fn emit(&self, core: &mut SessionCore, event: ChatEvent) {
        if event.is_persisted() {
            let summary = core.session.summary();
            if let Err(err) = core.conversations.append(event.for_persistence(), &summary) {
                tracing::warn!(error = %err, "failed to persist conversation message");
            }
        }
        self.events.publish(event).await;
    }

    async fn write_turn(&self, core: &mut SessionCore, request: &TurnRequest) -> Result<(), ChatError> {
        let handle = self.ensure_process(core, request.plan_mode).await?;
        if handle.begin_initialize() {
            let request_id = format!(
                "init-{}",
                OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
            );
            handle.write(&OutboundMessage::initialize(request_id)).await?;
        }
        let text = if request.thinking_mode {
            format!(
                "{}{}",
                core.settings.thinking_intensity.prompt_prefix(),
                request.text
            )
        } else {
            request.text.clone()
        };
        handle
            .write(&OutboundMessage::user_turn(core.session.session_id(), text))
            .await?;
        tracing::info!(
            generation = handle.generation(),
            plan_mode = request.plan_mode,
            thinking_mode = request.thinking_mode,
            "user turn sent"
        );
        Ok(())
    }

    /// Reuses the running agent when its launch options still apply,
    /// otherwise restarts it resuming the current session.
    async fn ensure_process(
        &self,
        core: &mut SessionCore,
        plan_mode: bool,
    ) -> Result<Arc<ProcessHandle>, ChatError> {
        let options = LaunchOptions {
            skip_permissions: core.settings.skip_permissions,
            tool_config: core
                .tool_config
                .exists()
                .then(|| core.tool_config.path().to_path_buf()),
            plan_mode,
            model: core.session.model(),
            resume: core.session.session_id().map(str::to_string),
        };

        if let Some(handle) = self.supervisor.current().await {
            if handle.options().same_process(&options)
                && handle.environment() == &core.settings.environment
            {
                return Ok(handle);
            }
            tracing::info!(
                pid = handle.pid(),
                "launch options changed; restarting agent"
            );
            self.stop_process(core).await;
        } else {
            // Exit not dispatched yet; nothing is left to answer these.
            self.cancel_pending(core).await;
            core.tool_calls.clear();
        }

        self.events
            .publish(ChatEvent::Loading {
                message: "Starting agent...".to_string(),
            })
            .await;
        let spec = LaunchSpec::build(
            &self.agent_binary,
            options,
            &core.settings.environment,
            &self.workspace,
        );
        Ok(self.supervisor.start(spec).await?)
    }

    async fn fail_turn(&self, core: &mut SessionCore, err: &ChatError) {
        tracing::error!(error = %err, "turn failed");
        core.session.set_processing(false);
        self.emit(core, ChatEvent::SetProcessing { is_processing: false })
            .await;
        match err {
            ChatError::AgentNotInstalled { binary } => {
                self.events
                    .publish(ChatEvent::InstallRequired {
                        binary: binary.clone(),
                    })
                    .await;
            }
            other => self.emit(core, ChatEvent::error(other.to_string())).await,
        }
    }

    /// Terminates the agent, if any, and cancels what it left pending.
    async fn stop_process(&self, core: &mut SessionCore) -> bool {
        let stopped = self.supervisor.terminate().await.is_some();
        if stopped {
            self.cancel_pending(core).await;
            core.tool_calls.clear();
        }
        stopped
    }

    async fn cancel_pending(&self, core: &mut SessionCore) {
        for request_id in core.negotiator.cancel_all() {
            self.record_permission_status(core, &request_id, PermissionStatus::Cancelled)
                .await;
        }
    }

    /// Persists a terminal permission status and tells the UI.
    async fn record_permission_status(
        &self,
        core: &mut SessionCore,
        request_id: &str,
        status: PermissionStatus,
    ) {
        if let Err(err) = core.conversations.set_permission_status(request_id, status) {
            tracing::warn!(request_id, error = %err, "failed to persist permission status");
        }
        self.events
            .publish(ChatEvent::UpdatePermissionStatus {
                request_id: request_id.to_string(),
                status,
            })
            .await;
    }

    async fn reset_session(&self, core: &mut SessionCore) {
        self.stop_process(core).await;
        core.session.clear();
        core.checkpoints.clear();
        core.conversations.reset();
        core.tool_calls.clear();
        tracing::info!("session cleared");
        self.events.publish(ChatEvent::SessionCleared).await;
        self.events
            .publish(ChatEvent::SetProcessing {
                is_processing: false,
            })
            .await;
    }

    async fn dispatch(&self, event: SupervisorEvent) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if !self.supervisor.is_current(event.generation).await {
            tracing::debug!(
                generation = event.generation,
                "ignoring output from a replaced agent process"
            );
            return;
        }
        match event.event {
            ProcessEvent::Message(value) => {
                let message = AgentMessage::classify(value);
                tracing::trace!(
                    generation = event.generation,
                    kind = message.kind(),
                    "agent message"
                );
                self.handle_message(core, message).await
            }
            ProcessEvent::Exited { code, stderr } => {
                self.handle_exit(core, event.generation, code, stderr).await
            }
        }
    }

    async fn handle_message(&self, core: &mut SessionCore, message: AgentMessage) {
        match message {
            AgentMessage::System(system) => self.handle_system(core, system).await,
            AgentMessage::Assistant(assistant) => self.handle_assistant(core, assistant).await,
            AgentMessage::User(user) => self.handle_user(core, user).await,
            AgentMessage::Result(result) => self.handle_result(core, result).await,
            AgentMessage::ControlRequest(request) => self.handle_control_request(core, request).await,
            AgentMessage::ControlResponse(response) => {
                if let Some(account) = response.account() {
                    core.session
                        .set_subscription_type(account.subscription_type.clone());
                    self.events
                        .publish(ChatEvent::AccountInfo {
                            subscription_type: account.subscription_type,
                        })
                        .await;
                }
            }
            AgentMessage::Unknown(raw) => {
                let message_type = raw.get("type").and_then(Value::as_str).unwrap_or("<none>");
                tracing::debug!(message_type, "ignoring unknown agent message");
            }
        }
    }

    async fn handle_system(&self, core: &mut SessionCore, system: SystemMessage) {
        match system {
            SystemMessage::Init {
                session_id,
                tools,
                mcp_servers,
                ..
            } => {
                core.session.set_session_id(session_id.clone());
                if let Some(session_id) = session_id {
                    self.emit(
                        core,
                        ChatEvent::SessionInfo {
                            session_id,
                            tools,
                            mcp_servers,
                        },
                    )
                    .await;
                }
            }
            SystemMessage::Status { status } => {
                let is_compacting = status.as_deref() == Some("compacting");
                core.session.set_compacting(is_compacting);
                self.events
                    .publish(ChatEvent::Compacting { is_compacting })
                    .await;
            }
            SystemMessage::CompactBoundary {
                trigger,
                pre_tokens,
            } => {
                let update = core.session.compact_reset();
                self.emit(
                    core,
                    ChatEvent::CompactBoundary {
                        trigger,
                        pre_tokens,
                    },
                )
                .await;
                self.emit(core, ChatEvent::UpdateTokens(update)).await;
                self.events
                    .publish(ChatEvent::Compacting {
                        is_compacting: false,
                    })
                    .await;
            }
            SystemMessage::Other { subtype } => {
                tracing::debug!(subtype = %subtype, "ignoring system message");
            }
        }
    }

    async fn handle_assistant(&self, core: &mut SessionCore, assistant: AssistantMessage) {
        for block in assistant.message.content {
            match block {
                AssistantContent::Text { text } if !text.trim().is_empty() => {
                    self.emit(core, ChatEvent::Output { text }).await;
                }
                AssistantContent::Thinking { thinking } if !thinking.trim().is_empty() => {
                    self.emit(core, ChatEvent::Thinking { text: thinking })
                        .await;
                }
                AssistantContent::ToolUse { id, name, input } => {
                    let event = core.tool_calls.on_tool_use(id, name, input);
                    self.emit(core, ChatEvent::ToolUse(event)).await;
                }
                _ => {}
            }
        }
        if let Some(usage) = assistant.message.usage {
            let update = core.session.apply_usage(&usage);
            self.emit(core, ChatEvent::UpdateTokens(update)).await;
        }
    }

    async fn handle_user(&self, core: &mut SessionCore, user: UserMessage) {
        for block in user.message.content {
            if let UserContent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            {
                let event = core.tool_calls.on_tool_result(tool_use_id, &content, is_error);
                self.emit(core, ChatEvent::ToolResult(event)).await;
            }
        }
    }

    async fn handle_result(&self, core: &mut SessionCore, result: ResultMessage) {
        if result.is_login_error() {
            let err = ChatError::LoginRequired {
                message: result.result.clone(),
            };
            tracing::warn!(error = %err, "agent reported an invalid API key");
            core.session.set_processing(false);
            self.events
                .publish(ChatEvent::SetProcessing {
                    is_processing: false,
                })
                .await;
            self.events
                .publish(ChatEvent::LoginRequired {
                    message: result.result,
                })
                .await;
            return;
        }

        if core.session.set_session_id(result.session_id.clone()) {
            if let Some(session_id) = result.session_id.clone() {
                self.emit(
                    core,
                    ChatEvent::SessionInfo {
                        session_id,
                        tools: Vec::new(),
                        mcp_servers: Vec::new(),
                    },
                )
                .await;
            }
        }

        let totals = core.session.apply_result(&result);
        tracing::info!(
            total_cost = totals.total_cost,
            turn_count = totals.turn_count,
            duration_ms = ?result.duration_ms,
            "agent turn finished"
        );
        self.events.publish(ChatEvent::UpdateTotals(totals)).await;

        if result.is_error || result.subtype.starts_with("error") {
            let message = result
                .result
                .clone()
                .unwrap_or_else(|| format!("agent turn ended with {}", result.subtype));
            self.emit(core, ChatEvent::error(message)).await;
        }

        core.session.set_processing(false);
        self.events
            .publish(ChatEvent::SetProcessing {
                is_processing: false,
            })
            .await;
        let summary = core.session.summary();
        if let Err(err) = core.conversations.sync_summary(&summary) {
            tracing::warn!(error = %err, "failed to persist conversation totals");
        }
    }

    async fn handle_control_request(&self, core: &mut SessionCore, request: ControlRequest) {
        let ControlRequest {
            request_id,
            request,
        } = request;
        let can_use_tool = match request {
            ControlRequestBody::CanUseTool(can_use_tool) => can_use_tool,
            ControlRequestBody::Other { subtype } => {
                tracing::debug!(request_id = %request_id, subtype = %subtype, "ignoring control request");
                return;
            }
        };

        match core.negotiator.on_request(&request_id, can_use_tool) {
            Negotiation::AutoApproved(response) => {
                let Some(handle) = self.supervisor.current().await else {
                    return;
                };
                if let Err(err) = handle.write(&response).await {
                    tracing::warn!(request_id = %request_id, error = %err, "failed to send pre-approved permission");
                }
            }
            Negotiation::Pending(request) => {
                self.emit(core, ChatEvent::PermissionRequest(request)).await;
            }
        }
    }

    async fn handle_exit(
        &self,
        core: &mut SessionCore,
        generation: u64,
        code: Option<i32>,
        stderr: String,
    ) {
        self.supervisor.release(generation).await;
        self.cancel_pending(core).await;
        core.tool_calls.clear();
        if core.session.is_processing() {
            core.session.set_processing(false);
            self.events
                .publish(ChatEvent::SetProcessing {
                    is_processing: false,
                })
                .await;
        }

        let stderr = stderr.trim();
        if code != Some(0) && !stderr.is_empty() {
            let err = ChatError::AgentProcessExited {
                exit_code: code,
                stderr: Some(stderr.to_string()),
            };
            tracing::warn!(error = %err, code = ?code, "agent process exited with an error");
            self.emit(core, ChatEvent::error(stderr)).await;
        }
    }
}
