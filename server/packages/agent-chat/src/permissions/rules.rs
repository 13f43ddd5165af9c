use std::collections::BTreeMap;
use std::path::PathBuf;

use agent_chat_error::ChatError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMAND_TOOL: &str = "Bash";

/// Subcommands that collapse to `"<base> <subcommand> *"`.
const SUBCOMMAND_PATTERNS: &[(&str, &[&str])] = &[
    ("npm", &["install", "i", "add", "remove", "uninstall", "update", "run"]),
    ("yarn", &["add", "remove", "install"]),
    ("pnpm", &["install", "add", "remove"]),
    (
        "git",
        &[
            "add", "commit", "push", "pull", "checkout", "branch", "merge", "clone", "reset",
            "rebase", "tag",
        ],
    ),
    (
        "docker",
        &[
            "run", "build", "exec", "logs", "stop", "start", "rm", "rmi", "pull", "push",
        ],
    ),
    ("cargo", &["build", "run", "test", "install"]),
    ("mvn", &["compile", "test", "package"]),
    ("gradle", &["build", "test"]),
    ("pip", &["install"]),
    ("pip3", &["install"]),
    ("composer", &["install", "require"]),
    ("bundle", &["install"]),
    ("gem", &["install"]),
];

/// Commands whose every invocation collapses to `"<base> *"`.
const BASE_PATTERNS: &[&str] = &[
    "make", "curl", "wget", "ssh", "scp", "rsync", "tar", "zip", "unzip", "node", "python",
    "python3",
];

/// Canonical always-allow pattern for a shell command; unrecognised commands
/// are kept literally.
pub fn command_pattern(command: &str) -> String {
    let mut parts = command.split_whitespace();
    let Some(base) = parts.next() else {
        return command.to_string();
    };
    let subcommand = parts.next().unwrap_or_default();

    if BASE_PATTERNS.contains(&base) {
        return format!("{base} *");
    }
    let known = SUBCOMMAND_PATTERNS
        .iter()
        .find(|(tool, _)| *tool == base)
        .is_some_and(|(_, subcommands)| subcommands.contains(&subcommand));
    if known {
        format!("{base} {subcommand} *")
    } else {
        command.to_string()
    }
}

/// Exact match, or prefix match for a pattern ending in `*`. The text before
/// the `*` is kept verbatim, trailing space included.
pub fn matches_pattern(command: &str, pattern: &str) -> bool {
    if command == pattern {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => command.starts_with(prefix),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredRule", into = "StoredRule")]
pub enum ToolRule {
    AllowAll,
    Patterns(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredRule {
    Flag(bool),
    Patterns(Vec<String>),
}

impl From<StoredRule> for ToolRule {
    fn from(value: StoredRule) -> Self {
        match value {
            StoredRule::Flag(true) => Self::AllowAll,
            StoredRule::Flag(false) => Self::Patterns(Vec::new()),
            StoredRule::Patterns(patterns) => Self::Patterns(patterns),
        }
    }
}

impl From<ToolRule> for StoredRule {
    fn from(value: ToolRule) -> Self {
        match value {
            ToolRule::AllowAll => Self::Flag(true),
            ToolRule::Patterns(patterns) => Self::Patterns(patterns),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PermissionsFile {
    #[serde(rename = "alwaysAllow", default)]
    always_allow: BTreeMap<String, ToolRule>,
}

/// Persisted always-allow rules, keyed by tool name.
#[derive(Debug)]
pub struct AlwaysAllowStore {
    path: PathBuf,
    rules: BTreeMap<String, ToolRule>,
}

impl AlwaysAllowStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let rules = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<PermissionsFile>(&contents) {
                Ok(file) => file.always_allow,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable permission rules");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read permission rules");
                BTreeMap::new()
            }
        };
        Self { path, rules }
    }

    pub fn snapshot(&self) -> BTreeMap<String, ToolRule> {
        self.rules.clone()
    }

    pub fn is_pre_approved(&self, tool_name: &str, input: &Value) -> bool {
        match self.rules.get(tool_name) {
            Some(ToolRule::AllowAll) => true,
            Some(ToolRule::Patterns(patterns)) if tool_name == COMMAND_TOOL => {
                match input.get("command").and_then(Value::as_str).map(str::trim) {
                    Some(command) => patterns
                        .iter()
                        .any(|pattern| matches_pattern(command, pattern)),
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// `None` allows every call of the tool. Shell commands are normalised to
    /// their canonical pattern before being stored.
    pub fn add(&mut self, tool_name: &str, command: Option<&str>) -> Result<(), ChatError> {
        validate_tool_name(tool_name)?;
        match command {
            None => {
                self.rules.insert(tool_name.to_string(), ToolRule::AllowAll);
            }
            Some(command) => {
                let pattern = if tool_name == COMMAND_TOOL {
                    command_pattern(command)
                } else {
                    command.to_string()
                };
                let rule = self
                    .rules
                    .entry(tool_name.to_string())
                    .or_insert_with(|| ToolRule::Patterns(Vec::new()));
                if *rule == ToolRule::AllowAll {
                    *rule = ToolRule::Patterns(Vec::new());
                }
                if let ToolRule::Patterns(patterns) = rule {
                    if !patterns.contains(&pattern) {
                        patterns.push(pattern);
                    }
                }
            }
        }
        tracing::info!(tool = tool_name, command = ?command, "always-allow rule added");
        self.save()
    }

    pub fn remove(&mut self, tool_name: &str, command: Option<&str>) -> Result<(), ChatError> {
        match command {
            None => {
                self.rules.remove(tool_name);
            }
            Some(command) => {
                let now_empty = match self.rules.get_mut(tool_name) {
                    Some(ToolRule::Patterns(patterns)) => {
                        patterns.retain(|pattern| pattern != command);
                        patterns.is_empty()
                    }
                    _ => false,
                };
                if now_empty {
                    self.rules.remove(tool_name);
                }
            }
        }
        tracing::info!(tool = tool_name, command = ?command, "always-allow rule removed");
        self.save()
    }

    /// Records an "always allow" decision for a concrete tool call. A tool
    /// that is already allowed for every call stays that way.
    pub fn remember(&mut self, tool_name: &str, input: &Value) -> Result<(), ChatError> {
        let command = if tool_name == COMMAND_TOOL {
            input.get("command").and_then(Value::as_str)
        } else {
            None
        };
        if command.is_some() && self.rules.get(tool_name) == Some(&ToolRule::AllowAll) {
            tracing::debug!(tool = tool_name, "tool already allowed for every call");
            return Ok(());
        }
        self.add(tool_name, command)
    }

    fn save(&self) -> Result<(), ChatError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(ChatError::persistence)?;
        }
        let file = PermissionsFile {
            always_allow: self.rules.clone(),
        };
        let contents = serde_json::to_string_pretty(&file).map_err(ChatError::persistence)?;
        std::fs::write(&self.path, contents).map_err(ChatError::persistence)
    }
}

fn validate_tool_name(tool_name: &str) -> Result<(), ChatError> {
    if tool_name.trim().is_empty() {
        return Err(ChatError::InvalidRequest {
            message: "tool name must not be empty".to_string(),
        });
    }
    Ok(())
}
