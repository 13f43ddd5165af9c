//! Workspace snapshots taken before every user turn.
//!
//! Snapshots live in a private git directory under the chat storage, with the
//! workspace as its work tree, so they never touch a repository the user owns.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use agent_chat_error::ChatError;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::process::Command;

const MESSAGE_PREVIEW_CHARS: usize = 50;
const COMMITTER_NAME: &str = "Agent Chat";
const COMMITTER_EMAIL: &str = "agent-chat@localhost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub sha: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug)]
pub struct CheckpointManager {
    git_dir: PathBuf,
    workspace: PathBuf,
    checkpoints: Vec<Checkpoint>,
    initialized: bool,
}

impl CheckpointManager {
    pub fn new(git_dir: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            workspace: workspace.into(),
            checkpoints: Vec::new(),
            initialized: false,
        }
    }

    pub fn list(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Forgets the checkpoints of the current chat; the repository stays.
    pub fn clear(&mut self) {
        self.checkpoints.clear();
    }

    pub async fn create(&mut self, user_text: &str) -> Result<Checkpoint, ChatError> {
        self.ensure_repository().await?;
        self.git(&["add", "-A"]).await?;

        let is_first = self.git(&["rev-parse", "HEAD"]).await.is_err();
        let has_changes = !self.git(&["status", "--porcelain"]).await?.trim().is_empty();
        let preview = message_preview(user_text);
        let message = if is_first {
            format!("Initial backup: {preview}")
        } else if has_changes {
            format!("Before: {preview}")
        } else {
            format!("Checkpoint (no changes): {preview}")
        };

        self.git(&["commit", "--allow-empty", "-m", &message]).await?;
        let sha = self.git(&["rev-parse", "HEAD"]).await?.trim().to_string();
        let timestamp = now_rfc3339();
        let checkpoint = Checkpoint {
            id: format!("commit-{}", timestamp.replace([':', '.'], "-")),
            sha,
            message,
            timestamp,
        };
        tracing::info!(
            checkpoint = %checkpoint.id,
            sha = %checkpoint.sha,
            has_changes,
            "workspace checkpoint created"
        );
        self.checkpoints.push(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Puts the snapshot's tree back onto the workspace. History is left as is.
    pub async fn restore(&mut self, id_or_sha: &str) -> Result<Checkpoint, ChatError> {
        let checkpoint = self
            .checkpoints
            .iter()
            .find(|checkpoint| checkpoint.id == id_or_sha || checkpoint.sha == id_or_sha)
            .cloned()
            .ok_or_else(|| ChatError::CheckpointNotFound {
                checkpoint: id_or_sha.to_string(),
            })?;
        self.ensure_repository().await?;
        self.git(&["checkout", &checkpoint.sha, "--", "."]).await?;
        tracing::info!(checkpoint = %checkpoint.id, sha = %checkpoint.sha, "workspace restored");
        Ok(checkpoint)
    }

    async fn ensure_repository(&mut self) -> Result<(), ChatError> {
        if self.initialized {
            return Ok(());
        }
        if !self.git_dir.join("HEAD").exists() {
            if let Some(parent) = self.git_dir.parent() {
                std::fs::create_dir_all(parent).map_err(ChatError::persistence)?;
            }
            self.git(&["init"]).await?;
            tracing::info!(git_dir = %self.git_dir.display(), "checkpoint repository created");
        }
        self.git(&["config", "user.name", COMMITTER_NAME]).await?;
        self.git(&["config", "user.email", COMMITTER_EMAIL]).await?;
        self.git(&["config", "commit.gpgsign", "false"]).await?;
        self.initialized = true;
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<String, ChatError> {
        run_git(&self.git_dir, &self.workspace, args).await
    }
}

async fn run_git(git_dir: &Path, work_tree: &Path, args: &[&str]) -> Result<String, ChatError> {
    let output = Command::new("git")
        .arg(format!("--git-dir={}", git_dir.display()))
        .arg(format!("--work-tree={}", work_tree.display()))
        .args(args)
        .current_dir(work_tree)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| ChatError::Persistence {
            message: format!("git execution failed: {err}"),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ChatError::Persistence {
            message: format!("git {} failed: {}", args.join(" "), stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn message_preview(text: &str) -> String {
    if text.chars().count() > MESSAGE_PREVIEW_CHARS {
        let cut: String = text.chars().take(MESSAGE_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn manager() -> (tempfile::TempDir, tempfile::TempDir, CheckpointManager) {
        let storage = tempfile::tempdir().expect("storage");
        let workspace = tempfile::tempdir().expect("workspace");
        let manager = CheckpointManager::new(
            storage.path().join("backups").join(".git"),
            workspace.path(),
        );
        (storage, workspace, manager)
    }

    #[test]
    fn preview_truncates_long_messages() {
        let long = "x".repeat(60);
        assert_eq!(message_preview(&long), format!("{}...", "x".repeat(50)));
        assert_eq!(message_preview("short"), "short");
    }

    #[tokio::test]
    async fn commit_messages_follow_workspace_state() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let (_storage, workspace, mut manager) = manager();
        std::fs::write(workspace.path().join("a.txt"), "one").expect("write");

        let first = manager.create("start").await.expect("first");
        assert_eq!(first.message, "Initial backup: start");
        assert!(first.id.starts_with("commit-"));
        assert!(!first.id.contains(':'));

        let unchanged = manager.create("again").await.expect("unchanged");
        assert_eq!(unchanged.message, "Checkpoint (no changes): again");

        std::fs::write(workspace.path().join("a.txt"), "two").expect("write");
        let changed = manager.create("edit").await.expect("changed");
        assert_eq!(changed.message, "Before: edit");
        assert_eq!(manager.list().len(), 3);
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let (_storage, workspace, mut manager) = manager();
        let file = workspace.path().join("notes.md");
        std::fs::write(&file, "original").expect("write");
        let checkpoint = manager.create("first turn").await.expect("checkpoint");

        std::fs::write(&file, "edited by agent").expect("write");
        manager.restore(&checkpoint.id).await.expect("restore");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "original");

        manager.restore(&checkpoint.sha).await.expect("restore again");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "original");
    }

    #[tokio::test]
    async fn restore_moves_between_earlier_and_later_checkpoints() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let (_storage, workspace, mut manager) = manager();
        let file = workspace.path().join("main.rs");
        std::fs::write(&file, "fn main() {}").expect("write");
        let earlier = manager.create("first turn").await.expect("earlier");

        std::fs::write(&file, "fn main() { run(); }").expect("write");
        let later = manager.create("second turn").await.expect("later");
        assert_eq!(later.message, "Before: second turn");

        std::fs::write(&file, "broken").expect("write");
        let restored = manager.restore(&earlier.id).await.expect("restore earlier");
        assert_eq!(restored.sha, earlier.sha);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "fn main() {}");

        manager.restore(&later.sha).await.expect("restore later");
        assert_eq!(
            std::fs::read_to_string(&file).expect("read"),
            "fn main() { run(); }"
        );

        manager.restore(&earlier.sha).await.expect("restore earlier again");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "fn main() {}");
        assert_eq!(manager.list().len(), 2);
    }

    #[tokio::test]
    async fn unknown_checkpoint_is_not_found() {
        let (_storage, _workspace, mut manager) = manager();
        let err = manager.restore("commit-nope").await.expect_err("missing");
        assert!(matches!(err, ChatError::CheckpointNotFound { .. }));
    }
}
