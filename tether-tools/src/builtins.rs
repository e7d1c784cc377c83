//! Tools that run inside the agent process.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tether_cap::normalize;
use tether_types::{ToolRef, ToolSpecification};

use crate::process::{clamp_timeout, run_process, ProcessSpec};
use crate::registry::is_eligible;
use crate::runner::Runner;
use crate::shell::parse_command;
use crate::ToolError;

const MAX_LIST_ENTRIES: usize = 500;
const DEFAULT_END_LINE: u64 = 200;

const PLUGIN_CONTRACT_MARKERS: [&str; 6] = [
    "name",
    "version",
    "--describe",
    "--run",
    "--input-json",
    "--context-json",
];

/// Built-ins that manage plugins, the registry or the scheduler itself.
/// None of them may be scheduled.
pub const ADMIN_TOOLS: [&str; 10] = [
    "save_plugin_file",
    "list_plugins",
    "reload_plugins",
    "plugin_registry_status",
    "create_or_update_plugin_file",
    "delete_plugin_file",
    "schedule_daily_tool",
    "list_scheduled_jobs",
    "delete_scheduled_job",
    "run_due_scheduled_jobs",
];

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

pub fn builtin_specs() -> Vec<ToolSpecification> {
    let timeout = json!({"type": "integer", "minimum": 1, "maximum": 300});
    vec![
        ToolSpecification::builtin(
            "list_files",
            "List entries under a workdir-relative directory. Directories end with '/'.",
            schema(json!({"path": {"type": "string"}}), &[]),
        ),
        ToolSpecification::builtin(
            "read_file",
            "Read a text file with line numbers.",
            schema(
                json!({
                    "path": {"type": "string"},
                    "start_line": {"type": "integer", "minimum": 1},
                    "end_line": {"type": "integer", "minimum": 1},
                }),
                &["path"],
            ),
        ),
        ToolSpecification::builtin(
            "write_file",
            "Write or append text to a file inside the workdir.",
            schema(
                json!({
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "append": {"type": "boolean"},
                }),
                &["path", "content"],
            ),
        ),
        ToolSpecification::builtin(
            "save_plugin_file",
            "Save a text file into the plugin directory.",
            schema(
                json!({"file_name": {"type": "string"}, "content": {"type": "string"}}),
                &["file_name", "content"],
            ),
        ),
        ToolSpecification::builtin(
            "run_shell",
            "Run one command without a shell, inside the workdir.",
            schema(
                json!({"command": {"type": "string"}, "timeout_seconds": timeout.clone()}),
                &["command"],
            ),
        ),
        ToolSpecification::builtin(
            "run_code",
            "Run a code snippet with the configured interpreter. Disabled in strict mode.",
            schema(
                json!({"code": {"type": "string"}, "timeout_seconds": timeout}),
                &["code"],
            ),
        ),
        ToolSpecification::builtin("list_plugins", "List loaded plugin tools.", schema(json!({}), &[])),
        ToolSpecification::builtin(
            "reload_plugins",
            "Rescan the plugin directory and reload every plugin.",
            schema(json!({}), &[]),
        ),
        ToolSpecification::builtin(
            "plugin_registry_status",
            "Loaded plugins, load errors and selection cache statistics.",
            schema(json!({}), &[]),
        ),
        ToolSpecification::builtin(
            "create_or_update_plugin_file",
            "Write a plugin implementing the describe/run contract and load it.",
            schema(
                json!({"file_name": {"type": "string"}, "content": {"type": "string"}}),
                &["file_name", "content"],
            ),
        ),
        ToolSpecification::builtin(
            "delete_plugin_file",
            "Delete a plugin file, optionally removing jobs that use its tools.",
            schema(
                json!({"file_name": {"type": "string"}, "purge_jobs": {"type": "boolean"}}),
                &["file_name"],
            ),
        ),
        ToolSpecification::builtin(
            "schedule_daily_tool",
            "Run a tool every day at HH:MM local time.",
            schema(
                json!({
                    "tool_name": {"type": "string"},
                    "time": {"type": "string", "pattern": "^\\d{2}:\\d{2}$"},
                    "tool_input": {"type": "object"},
                    "description": {"type": "string"},
                }),
                &["tool_name", "time"],
            ),
        ),
        ToolSpecification::builtin("list_scheduled_jobs", "List scheduled jobs.", schema(json!({}), &[])),
        ToolSpecification::builtin(
            "delete_scheduled_job",
            "Delete a scheduled job by id.",
            schema(json!({"job_id": {"type": "string"}}), &["job_id"]),
        ),
        ToolSpecification::builtin(
            "run_due_scheduled_jobs",
            "Run every scheduled job that is due now.",
            schema(json!({}), &[]),
        ),
    ]
}

struct Args<'a>(&'a Map<String, Value>);

impl<'a> Args<'a> {
    fn new(input: &'a Value) -> Result<Self, ToolError> {
        input
            .as_object()
            .map(Args)
            .ok_or_else(|| ToolError::Validation("tool input must be a JSON object".into()))
    }

    fn str(&self, key: &str) -> Result<&'a str, ToolError> {
        self.opt_str(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ToolError::Validation(format!("'{key}' is required")))
    }

    fn opt_str(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn u64(&self, key: &str) -> Result<Option<u64>, ToolError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| ToolError::Validation(format!("'{key}' must be a non-negative integer"))),
        }
    }
}

/// A bare file name: no separators, no traversal.
fn plugin_file_name(raw: &str) -> Result<&str, ToolError> {
    let name = raw.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(ToolError::Validation(format!(
            "'{raw}' is not a plain file name inside the plugin directory"
        )));
    }
    Ok(name)
}

impl Runner {
    pub(crate) async fn call_builtin(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let args = Args::new(&input)?;
        match name {
            "list_files" => self.list_files(&args),
            "read_file" => self.read_file(&args),
            "write_file" => self.write_file(&args),
            "save_plugin_file" => self.save_plugin_file(&args).await,
            "run_shell" => self.run_shell(&args).await,
            "run_code" => self.run_code(&args).await,
            "list_plugins" => {
                let plugins: Vec<ToolSpecification> =
                    self.registry().plugins().into_iter().map(|p| p.spec).collect();
                Ok(json!({"count": plugins.len(), "plugins": plugins}))
            }
            "reload_plugins" => {
                let changed = self.registry().sync(true).await?;
                Ok(json!({"changed": changed, "status": self.registry().status()}))
            }
            "plugin_registry_status" => Ok(json!(self.registry().status())),
            "create_or_update_plugin_file" => self.create_or_update_plugin(&args).await,
            "delete_plugin_file" => self.delete_plugin(&args).await,
            "schedule_daily_tool" => self.schedule_daily(&args).await,
            "list_scheduled_jobs" => {
                let jobs = self.jobs().list()?;
                Ok(json!({"count": jobs.len(), "jobs": jobs}))
            }
            "delete_scheduled_job" => {
                let id = args.str("job_id")?;
                if !self.jobs().delete(id)? {
                    return Err(ToolError::NotFound(format!("no scheduled job with id '{id}'")));
                }
                Ok(json!({"deleted": id}))
            }
            "run_due_scheduled_jobs" => {
                let executions = match self.job_executor() {
                    Some(host) => self.jobs().run_due(Utc::now(), host.as_ref()).await?,
                    None => self.jobs().run_due(Utc::now(), self).await?,
                };
                Ok(json!({"executed": executions.len(), "executions": executions}))
            }
            other => Err(ToolError::NotFound(format!("unknown built-in tool '{other}'"))),
        }
    }

    /// Resolve a path for reading. Strict mode keeps it lexically inside the workdir.
    fn read_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let raw = Path::new(raw);
        let abs = if raw.is_absolute() {
            normalize(raw)
        } else {
            normalize(&self.workdir().join(raw))
        };
        if self.strict() && !abs.starts_with(self.workdir()) {
            return Err(ToolError::Validation(format!(
                "path '{}' is outside the workdir",
                raw.display()
            )));
        }
        Ok(abs)
    }

    fn list_files(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let raw = args.opt_str("path").unwrap_or(".");
        let dir = self.read_path(raw)?;
        if !dir.is_dir() {
            return Err(ToolError::NotFound(format!("'{raw}' is not a directory")));
        }
        let mut entries: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .map(|e| {
                let mut name = e.file_name().to_string_lossy().into_owned();
                if e.path().is_dir() {
                    name.push('/');
                }
                name
            })
            .collect();
        entries.sort();
        let total = entries.len();
        entries.truncate(MAX_LIST_ENTRIES);
        Ok(json!({
            "path": raw,
            "entries": entries,
            "total": total,
            "truncated": total > MAX_LIST_ENTRIES,
        }))
    }

    fn read_file(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let raw = args.str("path")?;
        let path = self.read_path(raw)?;
        let start = args.u64("start_line")?.unwrap_or(1).max(1);
        let end = args.u64("end_line")?.unwrap_or(DEFAULT_END_LINE);
        if end < start {
            return Err(ToolError::Validation("end_line must not be before start_line".into()));
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound(format!("file '{raw}' does not exist")))
            }
            Err(err) => return Err(err.into()),
        };
        let total = text.lines().count();
        let numbered: Vec<String> = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i as u64 + 1, line))
            .filter(|(n, _)| *n >= start && *n <= end)
            .map(|(n, line)| format!("{n}: {line}"))
            .collect();
        Ok(json!({
            "path": raw,
            "start_line": start,
            "end_line": end.min(total as u64),
            "total_lines": total,
            "content": numbered.join("\n"),
        }))
    }

    fn write_file(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let raw = args.str("path")?;
        let content = args.opt_str("content").unwrap_or_default();
        let append = args.bool("append");
        let target = Path::new(raw);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.host_fs.create_dir_all(parent)?;
        }
        if append {
            self.host_fs.append(target, content.as_bytes())?;
        } else {
            self.host_fs.write(target, content.as_bytes())?;
        }
        Ok(json!({"path": raw, "bytes": content.len(), "appended": append}))
    }

    async fn save_plugin_file(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let file = plugin_file_name(args.str("file_name")?)?;
        let content = args.opt_str("content").unwrap_or_default();
        let dir = self.registry().plugin_dir().to_path_buf();
        self.host_fs.create_dir_all(&dir)?;
        self.host_fs.write(dir.join(file), content.as_bytes())?;
        let changed = self.registry().sync(false).await?;
        Ok(json!({
            "file": file,
            "path": self.stored_path(&dir.join(file)),
            "bytes": content.len(),
            "registry_changed": changed,
        }))
    }

    async fn run_shell(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let command = args.str("command")?;
        let argv = parse_command(command, self.strict(), &self.host_fs)?;
        let timeout = self.timeout_from(args)?;
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();
        let output = run_process(ProcessSpec {
            program: program.into(),
            args: argv.map(Into::into).collect(),
            cwd: self.workdir().to_path_buf(),
            env: Vec::new(),
            timeout,
        })
        .await?;
        Ok(json!({
            "command": command,
            "ok": output.success(),
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }

    async fn run_code(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        if self.strict() {
            return Err(ToolError::Validation(
                "run_code is disabled in strict workdir mode".into(),
            ));
        }
        let code = args.str("code")?;
        let timeout = self.timeout_from(args)?;
        let output = run_process(ProcessSpec {
            program: self.config.code_interpreter.clone().into(),
            args: vec!["-c".into(), code.into()],
            cwd: self.workdir().to_path_buf(),
            env: Vec::new(),
            timeout,
        })
        .await?;
        Ok(json!({
            "ok": output.success(),
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }

    fn timeout_from(&self, args: &Args<'_>) -> Result<std::time::Duration, ToolError> {
        Ok(args
            .u64("timeout_seconds")?
            .map(clamp_timeout)
            .unwrap_or(self.config.default_timeout))
    }

    async fn create_or_update_plugin(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let file = plugin_file_name(args.str("file_name")?)?;
        if !is_eligible(file) {
            return Err(ToolError::Validation(format!(
                "'{file}' starts with '_' or '.' and would never be loaded"
            )));
        }
        let content = args.str("content")?;
        let missing: Vec<&str> = PLUGIN_CONTRACT_MARKERS
            .iter()
            .copied()
            .filter(|m| !content.contains(m))
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::Validation(format!(
                "plugin source does not implement the contract, missing: {}",
                missing.join(", ")
            )));
        }

        let dir = self.registry().plugin_dir().to_path_buf();
        let path = dir.join(file);
        let existed = path.exists();
        self.host_fs.create_dir_all(&dir)?;
        self.host_fs.write(&path, content.as_bytes())?;
        #[cfg(unix)]
        self.host_fs.set_permissions(&path, 0o755)?;

        self.registry().sync(true).await?;
        let loaded: Vec<String> = self
            .registry()
            .plugins_in_file(file)
            .into_iter()
            .map(|p| p.spec.name)
            .collect();
        let load_error = self.registry().load_errors().get(file).cloned();
        tracing::info!(file = %file, loaded = ?loaded, error = ?load_error, "plugin file written");
        Ok(json!({
            "file": file,
            "path": self.stored_path(&path),
            "action": if existed { "updated" } else { "created" },
            "loaded_tools": loaded,
            "load_error": load_error,
            "ok": load_error.is_none() && !loaded.is_empty(),
        }))
    }

    async fn delete_plugin(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let file = plugin_file_name(args.str("file_name")?)?;
        let path = self.registry().plugin_dir().join(file);
        if !path.is_file() {
            return Err(ToolError::NotFound(format!("plugin file '{file}' does not exist")));
        }
        let removed: Vec<String> = self
            .registry()
            .plugins_in_file(file)
            .into_iter()
            .map(|p| p.spec.name)
            .collect();
        self.host_fs.remove_file(&path)?;
        self.registry().sync(true).await?;
        let purged = if args.bool("purge_jobs") {
            self.jobs().purge_tools(&removed)?
        } else {
            0
        };
        Ok(json!({"file": file, "removed_tools": removed, "purged_jobs": purged}))
    }

    async fn schedule_daily(&self, args: &Args<'_>) -> Result<Value, ToolError> {
        let tool_name = args.str("tool_name")?.trim();
        let time = args.str("time")?;
        let tool_input = args.0.get("tool_input").cloned().unwrap_or_else(|| json!({}));
        let description = args.opt_str("description").unwrap_or_default();

        if ADMIN_TOOLS.contains(&tool_name) {
            return Err(ToolError::Validation(format!(
                "'{tool_name}' manages the agent itself and cannot be scheduled"
            )));
        }
        let tool_ref = if self.registry().is_builtin(tool_name) {
            ToolRef::Builtin { tool_name: tool_name.to_string() }
        } else {
            let plugin = match self.registry().plugin(tool_name) {
                Some(p) => p,
                None => {
                    self.registry().sync(true).await?;
                    self.registry()
                        .plugin(tool_name)
                        .ok_or_else(|| ToolError::NotFound(format!("unknown tool '{tool_name}'")))?
                }
            };
            ToolRef::PluginFile {
                file: self.stored_path(&plugin.path),
                tool_name: plugin.spec.name,
            }
        };
        let job = self
            .jobs()
            .schedule_daily(tool_ref, time, tool_input, description, Utc::now())?;
        Ok(json!({"scheduled": job}))
    }
}
