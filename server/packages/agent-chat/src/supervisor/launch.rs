use std::path::{Path, PathBuf};

use crate::config::{AgentModel, ExecutionEnvironment};

/// Everything that decides how the agent is started. Two option sets that
/// differ only in `resume` can share one running process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub skip_permissions: bool,
    pub tool_config: Option<PathBuf>,
    pub plan_mode: bool,
    pub model: AgentModel,
    pub resume: Option<String>,
}

impl LaunchOptions {
    pub fn agent_args(&self, environment: &ExecutionEnvironment) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.push("--permission-prompt-tool".to_string());
            args.push("stdio".to_string());
        }
        if let Some(path) = &self.tool_config {
            args.push("--mcp-config".to_string());
            args.push(environment.agent_visible_path(path));
        }
        if self.plan_mode {
            args.push("--permission-mode".to_string());
            args.push("plan".to_string());
        }
        if self.model != AgentModel::Default {
            args.push("--model".to_string());
            args.push(self.model.as_str().to_string());
        }
        if let Some(session_id) = &self.resume {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args
    }

    pub fn same_process(&self, other: &LaunchOptions) -> bool {
        self.skip_permissions == other.skip_permissions
            && self.tool_config == other.tool_config
            && self.plan_mode == other.plan_mode
            && self.model == other.model
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub environment: ExecutionEnvironment,
    pub options: LaunchOptions,
    /// Process name used when the tree has to be matched by name.
    pub agent_name: String,
}

impl LaunchSpec {
    pub fn build(
        agent_binary: &str,
        options: LaunchOptions,
        environment: &ExecutionEnvironment,
        working_dir: &Path,
    ) -> Self {
        let agent_args = options.agent_args(environment);
        let (program, args, agent_path) = match environment {
            ExecutionEnvironment::Native => {
                (agent_binary.to_string(), agent_args, agent_binary.to_string())
            }
            ExecutionEnvironment::Wsl {
                distro,
                node_path,
                agent_path,
            } => {
                let inner = format!(
                    "\"{node_path}\" --no-warnings --enable-source-maps \"{agent_path}\" {}",
                    agent_args.join(" ")
                );
                (
                    "wsl".to_string(),
                    vec![
                        "-d".to_string(),
                        distro.clone(),
                        "bash".to_string(),
                        "-ic".to_string(),
                        inner,
                    ],
                    agent_path.clone(),
                )
            }
        };
        let agent_name = agent_path
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(agent_binary)
            .to_string();

        Self {
            program,
            args,
            env: vec![
                ("FORCE_COLOR".to_string(), "0".to_string()),
                ("NO_COLOR".to_string(), "1".to_string()),
            ],
            working_dir: working_dir.to_path_buf(),
            environment: environment.clone(),
            options,
            agent_name,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
