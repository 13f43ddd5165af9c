//! Owns the agent process: spawning, stdio plumbing, and tree termination.
//!
//! Every spawned process gets a generation number. Events from the process
//! carry it, so a consumer can drop output from a process that has already
//! been replaced or stopped.

mod launch;
mod terminate;

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_chat_error::ChatError;
use agent_chat_protocol::{CodecError, LineCodec, OutboundMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionEnvironment;

pub use launch::{LaunchOptions, LaunchSpec};
pub use terminate::{SignalKind, TreeKiller};

pub const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_millis(2000);
const FORCE_EXIT_TIMEOUT: Duration = Duration::from_millis(2000);
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_millis(2000);
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("agent binary not found: {program}")]
    NotInstalled { program: String },
    #[error("failed to spawn agent `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("working directory does not exist: {path}")]
    MissingWorkingDirectory { path: String },
    #[error("failed to capture agent {0}")]
    MissingStdio(&'static str),
    #[error("agent process already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("agent process is not running")]
    NotRunning,
    #[error("failed to write agent stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error(transparent)]
    Encode(#[from] CodecError),
}

impl From<SupervisorError> for ChatError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotInstalled { program } => ChatError::AgentNotInstalled { binary: program },
            SupervisorError::Spawn { command, error } => ChatError::SpawnFailed {
                command,
                message: error.to_string(),
            },
            SupervisorError::MissingStdio(stream) => ChatError::SpawnFailed {
                command: "agent".to_string(),
                message: format!("failed to capture {stream}"),
            },
            SupervisorError::MissingWorkingDirectory { path } => ChatError::InvalidRequest {
                message: format!("workspace directory does not exist: {path}"),
            },
            SupervisorError::AlreadyRunning { pid } => ChatError::Conflict {
                message: format!("agent process already running (pid {pid})"),
            },
            other @ (SupervisorError::NotRunning
            | SupervisorError::Write(_)
            | SupervisorError::Encode(_)) => ChatError::StreamError {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Message(Value),
    /// Sent once, after stdout has been drained.
    Exited { code: Option<i32>, stderr: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorEvent {
    pub generation: u64,
    pub event: ProcessEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
}

#[derive(Debug)]
pub struct ProcessHandle {
    generation: u64,
    pid: u32,
    environment: ExecutionEnvironment,
    options: LaunchOptions,
    killer: TreeKiller,
    stdin: Mutex<ChildStdin>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ExitInfo>>,
    initialized: AtomicBool,
    spawned_at: Instant,
}

impl ProcessHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.environment
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Returns `true` the first time it is called for this process.
    pub fn begin_initialize(&self) -> bool {
        !self.initialized.swap(true, Ordering::SeqCst)
    }

    pub async fn write(&self, message: &OutboundMessage) -> Result<(), SupervisorError> {
        if self.cancel.is_cancelled() || self.has_exited() {
            return Err(SupervisorError::NotRunning);
        }
        let line = message.to_line()?;
        let mut stdin = self.stdin.lock().await;
        if let Err(err) = stdin.write_all(&line).await {
            tracing::error!(pid = self.pid, error = %err, "failed to write to agent stdin");
            return Err(SupervisorError::Write(err));
        }
        if let Err(err) = stdin.flush().await {
            tracing::error!(pid = self.pid, error = %err, "failed to flush agent stdin");
            return Err(SupervisorError::Write(err));
        }
        Ok(())
    }

    pub async fn signal(&self, signal: SignalKind) {
        self.killer.terminate_tree(signal).await;
    }

    pub async fn force_kill(&self) {
        self.killer.terminate_tree(SignalKind::Kill).await;
    }

    pub async fn wait_exit(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(|info| info.is_some()).await;
        match result {
            Ok(info) => (*info).and_then(|info| info.code),
            Err(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    current: Mutex<Option<Arc<ProcessHandle>>>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = Self {
            current: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            events,
        };
        (supervisor, receiver)
    }

    pub async fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|handle| !handle.has_exited())
            .cloned()
    }

    pub async fn is_current(&self, generation: u64) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Forgets the handle after its process exited on its own.
    pub async fn release(&self, generation: u64) {
        let mut current = self.current.lock().await;
        if current
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
        {
            *current = None;
        }
    }

    pub async fn start(&self, spec: LaunchSpec) -> Result<Arc<ProcessHandle>, SupervisorError> {
        let mut current = self.current.lock().await;
        if let Some(handle) = current.as_ref() {
            if !handle.has_exited() {
                return Err(SupervisorError::AlreadyRunning { pid: handle.pid });
            }
        }
        if !spec.working_dir.is_dir() {
            return Err(SupervisorError::MissingWorkingDirectory {
                path: spec.working_dir.display().to_string(),
            });
        }

        let spawn_start = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        tracing::info!(
            program = %spec.program,
            args = ?spec.args,
            generation,
            indirect = spec.environment.is_indirect(),
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(program = %spec.program, error = %err, "failed to spawn agent process");
            if err.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::NotInstalled {
                    program: spec.program.clone(),
                }
            } else {
                SupervisorError::Spawn {
                    command: spec.display(),
                    error: err,
                }
            }
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(
            pid,
            generation,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingStdio("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingStdio("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingStdio("stderr"))?;

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let stdout_task = spawn_stdout_loop(generation, pid, stdout, cancel.clone(), self.events.clone());
        let stderr_task = spawn_stderr_loop(pid, stderr);

        let events = self.events.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(pid, error = %err, "failed to wait for agent process");
                    None
                }
            };
            if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, stdout_task).await.is_err() {
                tracing::warn!(pid, "agent stdout still open after exit; giving up on drain");
            }
            let stderr = match tokio::time::timeout(STREAM_DRAIN_TIMEOUT, stderr_task).await {
                Ok(Ok(captured)) => captured,
                _ => String::new(),
            };
            tracing::info!(
                pid,
                generation,
                code = ?code,
                age_ms = spawn_start.elapsed().as_millis() as u64,
                "agent process exited"
            );
            let _ = exit_tx.send(Some(ExitInfo { code }));
            let _ = events.send(SupervisorEvent {
                generation,
                event: ProcessEvent::Exited { code, stderr },
            });
        });

        let handle = Arc::new(ProcessHandle {
            generation,
            pid,
            environment: spec.environment.clone(),
            killer: TreeKiller::for_process(pid, &spec.environment, &spec.agent_name),
            options: spec.options,
            stdin: Mutex::new(stdin),
            cancel,
            exit: exit_rx,
            initialized: AtomicBool::new(false),
            spawned_at: spawn_start,
        });
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Stops the current process tree, if any, and returns its handle.
    ///
    /// Output still in flight from the stopped process is ignored by
    /// consumers because the handle is no longer current.
    pub async fn terminate(&self) -> Option<Arc<ProcessHandle>> {
        let handle = {
            let mut current = self.current.lock().await;
            if let Some(handle) = current.as_ref() {
                handle.cancel.cancel();
            }
            current.take()?
        };
        if handle.has_exited() {
            return Some(handle);
        }

        tracing::info!(
            pid = handle.pid,
            generation = handle.generation,
            age_ms = handle.spawned_at.elapsed().as_millis() as u64,
            "terminating agent process tree"
        );
        handle.signal(SignalKind::Terminate).await;
        if tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, handle.wait_exit())
            .await
            .is_err()
        {
            tracing::warn!(pid = handle.pid, "agent did not exit after terminate; force killing");
            handle.force_kill().await;
            if tokio::time::timeout(FORCE_EXIT_TIMEOUT, handle.wait_exit())
                .await
                .is_err()
            {
                tracing::error!(pid = handle.pid, "agent process survived force kill");
            }
        }
        Some(handle)
    }
}

fn spawn_stdout_loop(
    generation: u64,
    pid: u32,
    mut stdout: ChildStdout,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut codec = LineCodec::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut message_count: u64 = 0;
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(pid, "agent stdout reader cancelled");
                    return;
                }
                read = stdout.read(&mut buffer) => read,
            };
            let values = match read {
                Ok(0) => break,
                Ok(n) => codec.feed(&buffer[..n]),
                Err(err) => {
                    tracing::warn!(pid, error = %err, "agent stdout read failed");
                    break;
                }
            };
            for value in values {
                message_count += 1;
                let _ = events.send(SupervisorEvent {
                    generation,
                    event: ProcessEvent::Message(value),
                });
            }
        }
        for value in codec.finish() {
            message_count += 1;
            let _ = events.send(SupervisorEvent {
                generation,
                event: ProcessEvent::Message(value),
            });
        }
        tracing::debug!(pid, message_count, "agent stdout closed");
    })
}

fn spawn_stderr_loop(pid: u32, stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut captured = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(pid, line = %line, "agent stderr");
            captured.push_str(&line);
            captured.push('\n');
            if captured.len() > STDERR_CAPTURE_LIMIT {
                let mut cut = captured.len() - STDERR_CAPTURE_LIMIT;
                while !captured.is_char_boundary(cut) {
                    cut += 1;
                }
                captured.drain(..cut);
            }
        }
        captured
    })
}
