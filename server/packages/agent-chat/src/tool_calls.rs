use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::events::{ToolResultEvent, ToolUseEvent};

const FILE_EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write"];
const HIDDEN_RESULT_TOOLS: &[&str] = &["Read", "TodoWrite"];
const DEFAULT_RESULT: &str = "Tool executed successfully";

#[derive(Debug, Clone)]
struct Invocation {
    tool_use_id: Option<String>,
    tool_name: String,
    file_path: Option<String>,
    file_content_before: Option<String>,
    start_line: Option<usize>,
    start_lines: Option<Vec<usize>>,
}

/// Tool invocations still waiting for their result.
///
/// A result names its invocation by `tool_use_id` when it can; otherwise it
/// belongs to the most recent unresolved invocation.
#[derive(Debug)]
pub struct ToolCallTracker {
    workspace: PathBuf,
    unresolved: Vec<Invocation>,
}

impl ToolCallTracker {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            unresolved: Vec::new(),
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    pub fn clear(&mut self) {
        self.unresolved.clear();
    }

    pub fn on_tool_use(
        &mut self,
        tool_use_id: Option<String>,
        tool_name: String,
        input: Value,
    ) -> ToolUseEvent {
        let is_file_edit = FILE_EDIT_TOOLS.contains(&tool_name.as_str());
        let file_path = input
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut file_content_before = None;
        let mut start_line = None;
        let mut start_lines = None;
        if let (true, Some(path)) = (is_file_edit, file_path.as_deref()) {
            let before = std::fs::read_to_string(self.resolve(path)).unwrap_or_default();
            match tool_name.as_str() {
                "Edit" => {
                    let old = input.get("old_string").and_then(Value::as_str).unwrap_or_default();
                    start_line = Some(line_of(&before, old));
                }
                "MultiEdit" => {
                    let lines = input
                        .get("edits")
                        .and_then(Value::as_array)
                        .map(|edits| {
                            edits
                                .iter()
                                .map(|edit| {
                                    let old = edit
                                        .get("old_string")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default();
                                    line_of(&before, old)
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    start_lines = Some(lines);
                }
                _ => {}
            }
            file_content_before = Some(before);
        }

        self.unresolved.push(Invocation {
            tool_use_id: tool_use_id.clone(),
            tool_name: tool_name.clone(),
            file_path: if is_file_edit { file_path } else { None },
            file_content_before: file_content_before.clone(),
            start_line,
            start_lines: start_lines.clone(),
        });

        ToolUseEvent {
            tool_use_id,
            tool_name,
            input,
            file_content_before,
            start_line,
            start_lines,
        }
    }

    pub fn on_tool_result(
        &mut self,
        tool_use_id: Option<String>,
        content: &Value,
        is_error: bool,
    ) -> ToolResultEvent {
        let invocation = self.take_invocation(tool_use_id.as_deref());
        let tool_use_id =
            tool_use_id.or_else(|| invocation.as_ref().and_then(|call| call.tool_use_id.clone()));
        let tool_name = invocation.as_ref().map(|call| call.tool_name.clone());
        let hidden = !is_error
            && tool_name
                .as_deref()
                .is_some_and(|name| HIDDEN_RESULT_TOOLS.contains(&name));

        let (file_path, file_content_before, file_content_after, start_line, start_lines) =
            match invocation {
                Some(call) => {
                    let after = match (&call.file_path, is_error) {
                        (Some(path), false) => std::fs::read_to_string(self.resolve(path)).ok(),
                        _ => None,
                    };
                    (
                        call.file_path,
                        call.file_content_before,
                        after,
                        call.start_line,
                        call.start_lines,
                    )
                }
                None => (None, None, None, None, None),
            };

        ToolResultEvent {
            tool_use_id,
            tool_name,
            content: result_text(content),
            is_error,
            hidden,
            file_path,
            file_content_before,
            file_content_after,
            start_line,
            start_lines,
        }
    }

    fn take_invocation(&mut self, tool_use_id: Option<&str>) -> Option<Invocation> {
        if let Some(id) = tool_use_id {
            if let Some(position) = self
                .unresolved
                .iter()
                .rposition(|call| call.tool_use_id.as_deref() == Some(id))
            {
                return Some(self.unresolved.remove(position));
            }
        }
        self.unresolved.pop()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }
}

/// 1-based line on which `fragment` starts in `text`; 1 when absent.
fn line_of(text: &str, fragment: &str) -> usize {
    if fragment.is_empty() {
        return 1;
    }
    match text.find(fragment) {
        Some(offset) => text[..offset].matches('\n').count() + 1,
        None => 1,
    }
}

fn result_text(content: &Value) -> String {
    match content {
        Value::Null => DEFAULT_RESULT.to_string(),
        Value::String(text) if text.is_empty() => DEFAULT_RESULT.to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_numbers_are_one_based() {
        assert_eq!(line_of("a\nb\nc\n", "c"), 3);
        assert_eq!(line_of("a\nb\n", "zzz"), 1);
        assert_eq!(line_of("", ""), 1);
    }

    #[test]
    fn interleaved_edits_pair_with_most_recent_unresolved() {
        let workspace = tempfile::tempdir().expect("tempdir");
        std::fs::write(workspace.path().join("a.txt"), "one\ntwo\n").expect("write");
        std::fs::write(workspace.path().join("b.txt"), "alpha\nbeta\ngamma\n").expect("write");

        let mut tracker = ToolCallTracker::new(workspace.path());
        let first = tracker.on_tool_use(
            None,
            "Edit".to_string(),
            json!({"file_path": "a.txt", "old_string": "two", "new_string": "2"}),
        );
        assert_eq!(first.start_line, Some(2));
        let second = tracker.on_tool_use(
            None,
            "Edit".to_string(),
            json!({"file_path": "b.txt", "old_string": "gamma", "new_string": "g"}),
        );
        assert_eq!(second.start_line, Some(3));
        assert_eq!(second.file_content_before.as_deref(), Some("alpha\nbeta\ngamma\n"));

        std::fs::write(workspace.path().join("b.txt"), "alpha\nbeta\ng\n").expect("write");
        let result = tracker.on_tool_result(None, &json!("ok"), false);
        assert_eq!(result.file_path.as_deref(), Some("b.txt"));
        assert_eq!(result.file_content_after.as_deref(), Some("alpha\nbeta\ng\n"));
        assert_eq!(result.start_line, Some(3));

        let result = tracker.on_tool_result(None, &json!("ok"), false);
        assert_eq!(result.file_path.as_deref(), Some("a.txt"));
        assert_eq!(tracker.unresolved_count(), 0);
    }

    #[test]
    fn matching_tool_use_id_wins_over_position() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let mut tracker = ToolCallTracker::new(workspace.path());
        tracker.on_tool_use(Some("tu_a".to_string()), "Bash".to_string(), json!({"command": "ls"}));
        tracker.on_tool_use(Some("tu_b".to_string()), "Read".to_string(), json!({"file_path": "x"}));

        let result = tracker.on_tool_result(Some("tu_a".to_string()), &json!("files"), false);
        assert_eq!(result.tool_name.as_deref(), Some("Bash"));
        assert!(!result.hidden);

        let result = tracker.on_tool_result(Some("tu_b".to_string()), &json!("contents"), false);
        assert_eq!(result.tool_name.as_deref(), Some("Read"));
        assert!(result.hidden);
    }

    #[test]
    fn multi_edit_reports_each_start_line() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let path = workspace.path().join("lib.rs");
        std::fs::write(&path, "fn a() {}\nfn b() {}\nfn c() {}\n").expect("write");
        let mut tracker = ToolCallTracker::new(workspace.path());
        let event = tracker.on_tool_use(
            None,
            "MultiEdit".to_string(),
            json!({
                "file_path": path.display().to_string(),
                "edits": [
                    {"old_string": "fn c", "new_string": "fn z"},
                    {"old_string": "fn a", "new_string": "fn y"},
                    {"old_string": "missing", "new_string": "x"}
                ]
            }),
        );
        assert_eq!(event.start_lines, Some(vec![3, 1, 1]));
    }

    #[test]
    fn errors_skip_after_snapshot_and_are_never_hidden() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let mut tracker = ToolCallTracker::new(workspace.path());
        tracker.on_tool_use(None, "Write".to_string(), json!({"file_path": "new.txt", "content": "x"}));
        let result = tracker.on_tool_result(None, &json!({"error": "denied"}), true);
        assert!(result.is_error);
        assert_eq!(result.file_content_before.as_deref(), Some(""));
        assert_eq!(result.file_content_after, None);
        assert!(result.content.contains("\"error\": \"denied\""));

        tracker.on_tool_use(None, "TodoWrite".to_string(), json!({}));
        let result = tracker.on_tool_result(None, &Value::Null, true);
        assert!(!result.hidden);
        assert_eq!(result.content, "Tool executed successfully");
    }
}
