use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use agent_chat_error::ChatError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_AGENT_BINARY: &str = "claude";
pub const DEFAULT_WSL_DISTRO: &str = "Ubuntu";
pub const DEFAULT_WSL_NODE_PATH: &str = "/usr/bin/node";
pub const DEFAULT_WSL_AGENT_PATH: &str = "/usr/local/bin/claude";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentModel {
    #[default]
    Default,
    Opus,
    Sonnet,
}

impl AgentModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Opus => "opus",
            Self::Sonnet => "sonnet",
        }
    }
}

impl fmt::Display for AgentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentModel {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Default),
            "opus" => Ok(Self::Opus),
            "sonnet" => Ok(Self::Sonnet),
            other => Err(ChatError::InvalidRequest {
                message: format!("unknown model `{other}`; expected default, opus or sonnet"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingIntensity {
    #[default]
    Think,
    ThinkHard,
    ThinkHarder,
    Ultrathink,
}

impl ThinkingIntensity {
    /// Text prepended to a turn sent in thinking mode.
    pub fn prompt_prefix(&self) -> String {
        let keyword = match self {
            Self::Think => "THINK",
            Self::ThinkHard => "THINK HARD",
            Self::ThinkHarder => "THINK HARDER",
            Self::Ultrathink => "ULTRATHINK",
        };
        format!("{keyword} THROUGH THIS STEP BY STEP: \n")
    }
}

/// Where the agent process runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutionEnvironment {
    #[default]
    Native,
    /// Routed through a WSL distribution with an explicit node runtime.
    Wsl {
        distro: String,
        #[serde(rename = "nodePath")]
        node_path: String,
        #[serde(rename = "agentPath")]
        agent_path: String,
    },
}

impl ExecutionEnvironment {
    pub fn is_indirect(&self) -> bool {
        matches!(self, Self::Wsl { .. })
    }

    /// Converts a host path into the form the agent process sees.
    pub fn agent_visible_path(&self, path: &Path) -> String {
        let display = path.display().to_string();
        match self {
            Self::Native => display,
            Self::Wsl { .. } => to_wsl_path(&display),
        }
    }
}

/// `C:\Users\me\x.json` becomes `/mnt/c/Users/me/x.json`; other paths pass
/// through unchanged.
pub fn to_wsl_path(path: &str) -> String {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let rest = chars.as_str().replace('\\', "/");
            format!("/mnt/{}{}", drive.to_ascii_lowercase(), rest)
        }
        _ => path.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    #[serde(default)]
    pub environment: ExecutionEnvironment,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default)]
    pub thinking_intensity: ThinkingIntensity,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub workspace: PathBuf,
    pub storage_dir: PathBuf,
    pub agent_binary: String,
    pub model: AgentModel,
    pub settings: ChatSettings,
}

impl ChatConfig {
    pub fn new(workspace: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            storage_dir: storage_dir.into(),
            agent_binary: DEFAULT_AGENT_BINARY.to_string(),
            model: AgentModel::default(),
            settings: ChatSettings::default(),
        }
    }

    pub fn paths(&self) -> StoragePaths {
        StoragePaths {
            root: self.storage_dir.clone(),
        }
    }
}

/// Per-workspace storage under the user's data directory.
pub fn default_storage_dir(workspace: &Path) -> PathBuf {
    let name = workspace
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string());
    dirs::data_dir()
        .map(|dir| dir.join("agent-chat").join("workspaces").join(&name))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-chat").join(&name))
}

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join("conversations")
    }

    pub fn conversation_index(&self) -> PathBuf {
        self.root.join("conversation-index.json")
    }

    pub fn permissions_file(&self) -> PathBuf {
        self.root.join("permissions").join("permissions.json")
    }

    pub fn tool_config_file(&self) -> PathBuf {
        self.root.join("mcp").join("mcp-servers.json")
    }

    pub fn backup_git_dir(&self) -> PathBuf {
        self.root.join("backups").join(".git")
    }
}
