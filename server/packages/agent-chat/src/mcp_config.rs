use std::path::{Path, PathBuf};

use agent_chat_error::ChatError;
use serde_json::{Map, Value};

const SERVERS_KEY: &str = "mcpServers";

/// Entry written by earlier releases for an in-process permission bridge.
/// Removed on startup.
pub const LEGACY_SERVER_NAME: &str = "agent-chat-permissions";

/// The tool-server file handed to the agent with `--mcp-config`.
#[derive(Debug, Clone)]
pub struct ToolConfigStore {
    path: PathBuf,
}

impl ToolConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn initialize(&self) -> Result<(), ChatError> {
        let (document, mut servers) = self.read()?;
        let removed = servers.remove(LEGACY_SERVER_NAME).is_some();
        if removed {
            tracing::info!(path = %self.path.display(), "removed legacy tool server entry");
        }
        if removed || !self.exists() {
            self.write(document, servers)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Map<String, Value>, ChatError> {
        let (_, mut servers) = self.read()?;
        servers.remove(LEGACY_SERVER_NAME);
        Ok(servers)
    }

    pub fn save(&self, name: &str, config: Value) -> Result<(), ChatError> {
        let name = name.trim();
        if name.is_empty() || name == LEGACY_SERVER_NAME {
            return Err(ChatError::InvalidRequest {
                message: format!("invalid tool server name: `{name}`"),
            });
        }
        if !config.is_object() {
            return Err(ChatError::InvalidRequest {
                message: "tool server config must be a JSON object".to_string(),
            });
        }
        let (document, mut servers) = self.read()?;
        servers.insert(name.to_string(), config);
        self.write(document, servers)?;
        tracing::info!(name, "tool server saved");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), ChatError> {
        let (document, mut servers) = self.read()?;
        if servers.remove(name).is_none() {
            return Err(ChatError::ToolServerNotFound {
                name: name.to_string(),
            });
        }
        self.write(document, servers)?;
        tracing::info!(name, "tool server deleted");
        Ok(())
    }

    /// The whole document (other top-level keys are preserved) and its
    /// server map, split apart.
    fn read(&self) -> Result<(Map<String, Value>, Map<String, Value>), ChatError> {
        let mut document = match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(document)) => document,
                _ => {
                    tracing::warn!(path = %self.path.display(), "tool server config is not a JSON object; starting fresh");
                    Map::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(ChatError::persistence(err)),
        };
        let servers = match document.remove(SERVERS_KEY) {
            Some(Value::Object(servers)) => servers,
            _ => Map::new(),
        };
        Ok((document, servers))
    }

    fn write(
        &self,
        mut document: Map<String, Value>,
        servers: Map<String, Value>,
    ) -> Result<(), ChatError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(ChatError::persistence)?;
        }
        document.insert(SERVERS_KEY.to_string(), Value::Object(servers));
        let contents = serde_json::to_string_pretty(&document).map_err(ChatError::persistence)?;
        std::fs::write(&self.path, contents).map_err(ChatError::persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_drops_legacy_entry_and_keeps_user_servers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp").join("mcp-servers.json");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(
            &path,
            json!({
                "mcpServers": {
                    "agent-chat-permissions": {"command": "node"},
                    "docs": {"command": "docs-server"}
                }
            })
            .to_string(),
        )
        .expect("write");

        let store = ToolConfigStore::new(&path);
        store.initialize().expect("initialize");
        let servers = store.list().expect("list");
        assert_eq!(servers.len(), 1);
        assert!(servers.contains_key("docs"));
    }

    #[test]
    fn initialize_creates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ToolConfigStore::new(dir.path().join("mcp").join("mcp-servers.json"));
        assert!(!store.exists());
        store.initialize().expect("initialize");
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).expect("read")).expect("json");
        assert_eq!(raw, json!({"mcpServers": {}}));
    }

    #[test]
    fn save_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ToolConfigStore::new(dir.path().join("mcp-servers.json"));
        store
            .save("search", json!({"command": "search-server", "args": ["--stdio"]}))
            .expect("save");
        assert_eq!(store.list().expect("list")["search"]["command"], "search-server");

        store.delete("search").expect("delete");
        assert!(store.list().expect("list").is_empty());
        assert!(matches!(
            store.delete("search"),
            Err(ChatError::ToolServerNotFound { .. })
        ));
        assert!(matches!(
            store.save("", json!({})),
            Err(ChatError::InvalidRequest { .. })
        ));
    }
}
