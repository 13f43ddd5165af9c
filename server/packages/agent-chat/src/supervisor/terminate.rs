use std::process::Stdio;

use tokio::process::Command;

use crate::config::ExecutionEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Terminate,
    Kill,
}

/// How to reach every descendant of a spawned agent.
///
/// Chosen once at spawn time from the execution environment, so termination
/// never has to rediscover how the process was launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeKiller {
    /// POSIX child started as the leader of its own process group.
    ProcessGroup { pid: u32 },
    /// Windows child whose tree is removed with `taskkill /t`.
    NativeTree { pid: u32 },
    /// Child living behind `wsl`; the real agent is matched by name inside
    /// the distribution and the host-side launcher is removed afterwards.
    Indirect {
        pid: u32,
        distro: String,
        pattern: String,
    },
}

impl TreeKiller {
    pub fn for_process(pid: u32, environment: &ExecutionEnvironment, agent_name: &str) -> Self {
        match environment {
            ExecutionEnvironment::Wsl { distro, .. } => Self::Indirect {
                pid,
                distro: distro.clone(),
                pattern: agent_name.to_string(),
            },
            ExecutionEnvironment::Native if cfg!(windows) => Self::NativeTree { pid },
            ExecutionEnvironment::Native => Self::ProcessGroup { pid },
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::ProcessGroup { pid } | Self::NativeTree { pid } | Self::Indirect { pid, .. } => {
                *pid
            }
        }
    }

    pub async fn terminate_tree(&self, signal: SignalKind) {
        match self {
            Self::ProcessGroup { pid } => signal_process_group(*pid, signal),
            Self::NativeTree { pid } => taskkill_tree(*pid).await,
            Self::Indirect {
                pid,
                distro,
                pattern,
            } => {
                let flag = match signal {
                    SignalKind::Terminate => "-15",
                    SignalKind::Kill => "-9",
                };
                run_quietly("wsl", &["-d", distro, "pkill", flag, "-f", pattern]).await;
                taskkill_tree(*pid).await;
            }
        }
    }
}

#[cfg(unix)]
fn signal_process_group(pid: u32, signal: SignalKind) {
    let signal_number = match signal {
        SignalKind::Terminate => libc::SIGTERM,
        SignalKind::Kill => libc::SIGKILL,
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    let result = unsafe { libc::kill(-pid, signal_number) };
    if result != 0 {
        // Not a group leader (or the group is already gone): fall back to the pid.
        let fallback = unsafe { libc::kill(pid, signal_number) };
        if fallback != 0 {
            tracing::debug!(pid, ?signal, "agent process already gone");
        }
    }
}

#[cfg(not(unix))]
fn signal_process_group(pid: u32, signal: SignalKind) {
    tracing::warn!(pid, ?signal, "process group signals are unavailable on this platform");
}

async fn taskkill_tree(pid: u32) {
    let pid = pid.to_string();
    run_quietly("taskkill", &["/pid", &pid, "/t", "/f"]).await;
}

async fn run_quietly(program: &str, args: &[&str]) {
    let result = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if !status.success() => {
            tracing::debug!(program, ?args, code = ?status.code(), "kill helper exited non-zero");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(program, ?args, error = %err, "failed to run kill helper");
        }
    }
}
