use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use tether_types::{truncate_text, ToolInvoker};

use crate::store::write_atomic;
use crate::SchedError;

/// Tool that receives free-text lines.
pub const GENERIC_HANDLER_TOOL: &str = "process_pending_task";
pub const MAX_LINES_PER_TICK: usize = 100;

const PREVIEW_CHARS: usize = 300;

/// One line of the pending-task file.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingTask {
    Call { tool: String, input: Value },
    FreeText(String),
    Malformed { reason: String },
}

impl PendingTask {
    /// Accepts `{"tool": .., "input": {..}}`, `name|{json}` or anything else as free text.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.starts_with('{') {
            return match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(obj)) => {
                    let tool = obj
                        .get("tool")
                        .or_else(|| obj.get("tool_name"))
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .unwrap_or_default();
                    if tool.is_empty() {
                        return Self::malformed("JSON task has no tool");
                    }
                    match obj.get("input").cloned().unwrap_or_else(|| json!({})) {
                        input @ Value::Object(_) => Self::Call {
                            tool: tool.to_string(),
                            input,
                        },
                        _ => Self::malformed("JSON task input is not an object"),
                    }
                }
                Ok(_) => Self::malformed("JSON task is not an object"),
                Err(err) => Self::malformed(format!("invalid JSON task: {err}")),
            };
        }
        if let Some((name, rest)) = line.split_once('|') {
            let name = name.trim();
            if is_tool_name(name) {
                let rest = rest.trim();
                if rest.is_empty() {
                    return Self::Call {
                        tool: name.to_string(),
                        input: json!({}),
                    };
                }
                return match serde_json::from_str::<Value>(rest) {
                    Ok(input @ Value::Object(_)) => Self::Call {
                        tool: name.to_string(),
                        input,
                    },
                    Ok(_) => Self::malformed("pipe task input is not an object"),
                    Err(err) => Self::malformed(format!("invalid pipe task input: {err}")),
                };
            }
        }
        Self::FreeText(line.to_string())
    }

    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

fn is_tool_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[derive(Clone, Debug, Serialize)]
pub struct PendingResult {
    pub line: String,
    pub tool: Option<String>,
    pub ok: bool,
    pub preview: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PendingReport {
    /// Lines in the file when the drain started.
    pub pending_count: usize,
    pub results: Vec<PendingResult>,
}

impl PendingReport {
    pub fn ok_count(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn error_count(&self) -> usize {
        self.results.len() - self.ok_count()
    }
}

/// Run up to [`MAX_LINES_PER_TICK`] lines and keep only failures and the unprocessed rest.
pub async fn drain_pending<I>(path: &Path, invoker: &I) -> Result<PendingReport, SchedError>
where
    I: ToolInvoker + ?Sized,
{
    let original = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(PendingReport::default()),
        Err(err) => return Err(err.into()),
    };
    let lines: Vec<&str> = original.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut report = PendingReport {
        pending_count: lines.len(),
        results: Vec::new(),
    };

    let mut keep: Vec<String> = Vec::new();
    for line in lines.iter().take(MAX_LINES_PER_TICK) {
        let result = match PendingTask::parse(line) {
            PendingTask::Call { tool, input } => run_line(invoker, line, tool, input).await,
            PendingTask::FreeText(text) => {
                run_line(invoker, line, GENERIC_HANDLER_TOOL.to_string(), json!({"task": text})).await
            }
            PendingTask::Malformed { reason } => PendingResult {
                line: line.to_string(),
                tool: None,
                ok: false,
                preview: reason,
            },
        };
        if !result.ok {
            tracing::warn!(line = %line, reason = %result.preview, "pending task failed, will retry");
            keep.push(line.to_string());
        }
        report.results.push(result);
    }
    keep.extend(lines.iter().skip(MAX_LINES_PER_TICK).map(|l| l.to_string()));

    let snapshot = Snapshot::take(path, &original)?;
    keep.extend(snapshot.appended.iter().cloned());
    snapshot.commit(path, &keep)?;
    Ok(report)
}

fn task_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines().filter(|l| !l.trim().is_empty()).map(str::to_string)
}

/// The pending file as it stands right before the rewrite. The open handle
/// keeps pointing at the replaced file, so anything a writer appends to it
/// after the snapshot can still be read back and carried over.
struct Snapshot {
    file: Option<File>,
    appended: Vec<String>,
}

impl Snapshot {
    fn take(path: &Path, original: &str) -> Result<Self, SchedError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { file: None, appended: Vec::new() })
            }
            Err(err) => return Err(err.into()),
        };
        let mut current = String::new();
        file.read_to_string(&mut current)?;
        let appended = match current.strip_prefix(original) {
            Some(extra) => task_lines(extra).collect(),
            None => {
                tracing::warn!(file = %path.display(), "pending file was rewritten while draining");
                Vec::new()
            }
        };
        // Windows refuses to replace a file that is still open.
        let file = cfg!(unix).then_some(file);
        Ok(Self { file, appended })
    }

    /// Replace the file with `keep`, then re-append whatever reached the old
    /// file after the snapshot.
    fn commit(self, path: &Path, keep: &[String]) -> Result<(), SchedError> {
        if keep.is_empty() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        } else {
            let mut body = keep.join("\n");
            body.push('\n');
            write_atomic(path, body.as_bytes())?;
        }

        let Some(mut file) = self.file else {
            return Ok(());
        };
        let mut late = String::new();
        file.read_to_string(&mut late)?;
        let late: Vec<String> = task_lines(&late).collect();
        if late.is_empty() {
            return Ok(());
        }
        tracing::debug!(lines = late.len(), "carrying over lines appended during rewrite");
        let mut out = OpenOptions::new().create(true).append(true).open(path)?;
        for line in late {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}

async fn run_line<I>(invoker: &I, line: &str, tool: String, input: Value) -> PendingResult
where
    I: ToolInvoker + ?Sized,
{
    let outcome = invoker.invoke(&tool, input).await;
    PendingResult {
        line: line.to_string(),
        ok: !outcome.is_error,
        preview: truncate_text(&outcome.text, PREVIEW_CHARS),
        tool: Some(tool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tether_types::{ErrorKind, ToolOutcome};

    #[test]
    fn parses_each_line_shape() {
        assert_eq!(
            PendingTask::parse(r#"{"tool": "echo", "input": {"text": "hi"}}"#),
            PendingTask::Call {
                tool: "echo".into(),
                input: json!({"text": "hi"})
            }
        );
        assert_eq!(
            PendingTask::parse(r#"{"tool_name": "echo"}"#),
            PendingTask::Call {
                tool: "echo".into(),
                input: json!({})
            }
        );
        assert_eq!(
            PendingTask::parse(r#"echo|{"text": "hi"}"#),
            PendingTask::Call {
                tool: "echo".into(),
                input: json!({"text": "hi"})
            }
        );
        assert_eq!(
            PendingTask::parse("summarize today's mail | urgently"),
            PendingTask::FreeText("summarize today's mail | urgently".into())
        );
        assert!(matches!(PendingTask::parse("{broken"), PendingTask::Malformed { .. }));
        assert!(matches!(PendingTask::parse("echo|not json"), PendingTask::Malformed { .. }));
    }

    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolInvoker for Recorder {
        async fn invoke(&self, name: &str, input: Value) -> ToolOutcome {
            self.calls.lock().unwrap().push((name.to_string(), input.clone()));
            if name == "fails" {
                ToolOutcome::error(ErrorKind::Process, "nope")
            } else {
                ToolOutcome::ok(&json!({"ok": true}))
            }
        }
    }

    fn recorder() -> Recorder {
        Recorder {
            calls: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn failed_lines_are_kept_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.txt");
        std::fs::write(&path, "echo|{}\n\nfails|{}\n{oops\nwater the plants\n").unwrap();
        let inv = recorder();
        let report = drain_pending(&path, &inv).await.unwrap();
        assert_eq!(report.pending_count, 4);
        assert_eq!(report.ok_count(), 2);
        assert_eq!(report.error_count(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fails|{}\n{oops\n");

        let calls = inv.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, GENERIC_HANDLER_TOOL);
        assert_eq!(calls[2].1, json!({"task": "water the plants"}));
    }

    #[tokio::test]
    async fn fully_drained_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.txt");
        std::fs::write(&path, "echo|{}\n").unwrap();
        drain_pending(&path, &recorder()).await.unwrap();
        assert!(!path.exists());
        let report = drain_pending(&path, &recorder()).await.unwrap();
        assert_eq!(report.pending_count, 0);
    }

    #[cfg(unix)]
    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn appends_racing_the_rewrite_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.txt");
        std::fs::write(&path, "fails|{}\necho|{}\nbefore|{}\n").unwrap();

        let snapshot = Snapshot::take(&path, "fails|{}\necho|{}\n").unwrap();
        assert_eq!(snapshot.appended, vec!["before|{}".to_string()]);
        // lands in the old file between the snapshot and the rename
        append(&path, "during|{}\n");
        let mut keep = vec!["fails|{}".to_string()];
        keep.extend(snapshot.appended.iter().cloned());
        snapshot.commit(&path, &keep).unwrap();
        append(&path, "after|{}\n");

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "fails|{}\nbefore|{}\nduring|{}\nafter|{}\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn appends_racing_the_unlink_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.txt");
        std::fs::write(&path, "echo|{}\n").unwrap();

        let snapshot = Snapshot::take(&path, "echo|{}\n").unwrap();
        append(&path, "late|{}\n");
        snapshot.commit(&path, &[]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "late|{}\n");
    }

    #[tokio::test]
    async fn lines_past_the_cap_wait_for_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.txt");
        let body: String = (0..MAX_LINES_PER_TICK + 3).map(|i| format!("echo|{{\"n\": {i}}}\n")).collect();
        std::fs::write(&path, body).unwrap();
        let report = drain_pending(&path, &recorder()).await.unwrap();
        assert_eq!(report.results.len(), MAX_LINES_PER_TICK);
        let rest = std::fs::read_to_string(&path).unwrap();
        assert_eq!(rest.lines().count(), 3);
    }
}
