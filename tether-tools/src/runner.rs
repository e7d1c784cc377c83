use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_cap::{CapabilityViolation, FsCap, SandboxController, EXIT_CAPABILITY_VIOLATION};
use tether_sched::JobStore;
use tether_types::{truncate_strings, truncate_text, JobExecutor, ToolInvoker, ToolOutcome, ToolRef};

use crate::builtins::builtin_specs;
use crate::process::{clamp_timeout, run_process, ProcessSpec, MAX_TIMEOUT};
use crate::registry::{parse_json_output, plugin_command, LoadedPlugin, ToolRegistry};
use crate::ToolError;

pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub plugin_dir: PathBuf,
    pub default_timeout: Duration,
    pub max_output_chars: usize,
    pub code_interpreter: String,
}

impl RunnerConfig {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            default_timeout: MAX_TIMEOUT,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            code_interpreter: "python3".into(),
        }
    }
}

/// Executes built-ins in-process and plugins as sandboxed children.
pub struct Runner {
    registry: Arc<ToolRegistry>,
    sandbox: SandboxController,
    pub(crate) host_fs: FsCap,
    jobs: Arc<JobStore>,
    pub(crate) config: RunnerConfig,
    job_route: OnceLock<Weak<dyn JobExecutor>>,
}

impl Runner {
    pub fn new(sandbox: SandboxController, jobs: Arc<JobStore>, config: RunnerConfig) -> Result<Self, ToolError> {
        let host_fs = sandbox.host_fs()?;
        let registry = Arc::new(ToolRegistry::new(
            config.plugin_dir.clone(),
            sandbox.clone(),
            builtin_specs(),
        ));
        Ok(Self {
            registry,
            sandbox,
            host_fs,
            jobs,
            config,
            job_route: OnceLock::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn workdir(&self) -> &Path {
        self.sandbox.root()
    }

    pub fn strict(&self) -> bool {
        self.sandbox.strict()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Send jobs fired by `run_due_scheduled_jobs` through `host` instead of
    /// straight to this runner. Only the first call takes effect.
    pub fn route_jobs_through(&self, host: Weak<dyn JobExecutor>) {
        let _ = self.job_route.set(host);
    }

    pub(crate) fn job_executor(&self) -> Option<Arc<dyn JobExecutor>> {
        self.job_route.get().and_then(Weak::upgrade)
    }

    /// Run one tool and return its raw JSON result.
    pub async fn call(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        if !input.is_object() {
            return Err(ToolError::Validation("tool input must be a JSON object".into()));
        }
        self.registry.sync(false).await?;
        if self.registry.is_builtin(name) {
            return self.call_builtin(name, input).await;
        }
        let plugin = match self.registry.plugin(name) {
            Some(plugin) => plugin,
            None => {
                self.registry.sync(true).await?;
                self.registry
                    .plugin(name)
                    .ok_or_else(|| ToolError::NotFound(format!("unknown tool '{name}'")))?
            }
        };
        self.run_plugin(&plugin, input).await
    }

    async fn run_plugin(&self, plugin: &LoadedPlugin, input: Value) -> Result<Value, ToolError> {
        let name = &plugin.spec.name;
        let timeout = input
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .map(clamp_timeout)
            .unwrap_or(self.config.default_timeout);
        let context = json!({
            "workdir": self.workdir().display().to_string(),
            "default_timeout_seconds": self.config.default_timeout.as_secs(),
            "max_output_chars": self.config.max_output_chars,
        });

        let (program, mut args) = plugin_command(&plugin.path);
        args.extend([
            "--run".into(),
            "--input-json".into(),
            input.to_string().into(),
            "--context-json".into(),
            context.to_string().into(),
        ]);
        let output = run_process(ProcessSpec {
            program,
            args,
            cwd: self.workdir().to_path_buf(),
            env: self.sandbox.plugin_policy(plugin.spec.network_access).env_vars(),
            timeout,
        })
        .await?;

        let parsed = parse_json_output(&output.stdout);
        if output.exit_code == Some(EXIT_CAPABILITY_VIOLATION) {
            let violation = parsed
                .as_ref()
                .and_then(|v| v.get("capability_violation"))
                .and_then(|v| serde_json::from_value::<CapabilityViolation>(v.clone()).ok());
            if let Some(violation) = violation {
                tracing::warn!(tool = %name, violation = %violation, "plugin hit the sandbox");
                return Err(ToolError::Sandbox(violation));
            }
        }
        if !output.success() {
            let reported = parsed
                .as_ref()
                .and_then(|v| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let detail = reported.unwrap_or_else(|| {
                let stderr = output.stderr.trim();
                if stderr.is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    stderr.to_string()
                }
            });
            let code = output.exit_code.map_or("signal".to_string(), |c| c.to_string());
            return Err(ToolError::Process(format!(
                "plugin '{name}' exited with {code}: {}",
                truncate_text(&detail, self.config.max_output_chars)
            )));
        }
        let result = parsed.ok_or_else(|| {
            ToolError::Process(format!("plugin '{name}' did not print a JSON result"))
        })?;
        Ok(json!({"tool": name, "result": result, "exit_code": 0}))
    }

    /// Name of the loaded tool a stored reference points at today.
    pub async fn resolve_ref(&self, tool_ref: &ToolRef) -> Result<String, ToolError> {
        let (file, tool_name) = match tool_ref {
            ToolRef::Builtin { tool_name } => return Ok(tool_name.clone()),
            ToolRef::PluginFile { file, tool_name } => (file, tool_name),
        };
        self.registry.sync(false).await?;
        let file_name = self
            .registry
            .plugin_file_name(file)
            .ok_or_else(|| ToolError::NotFound(format!("{file} is not inside the plugin directory")))?;
        let mut bound = self.registry.plugins_in_file(&file_name);
        if bound.is_empty() {
            self.registry.sync(true).await?;
            bound = self.registry.plugins_in_file(&file_name);
        }
        if bound.iter().any(|p| &p.spec.name == tool_name) {
            return Ok(tool_name.clone());
        }
        if let Some(first) = bound.first() {
            tracing::info!(file = %file, stored = %tool_name, now = %first.spec.name, "plugin tool was renamed");
            return Ok(first.spec.name.clone());
        }
        if self.registry.plugin(tool_name).is_some() {
            return Ok(tool_name.clone());
        }
        Err(ToolError::NotFound(format!(
            "scheduled tool '{tool_name}' from {file} is no longer loaded"
        )))
    }

    /// Workdir-relative form of a plugin path, for storing in job references.
    pub(crate) fn stored_path(&self, path: &Path) -> String {
        path.strip_prefix(self.workdir())
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[async_trait]
impl ToolInvoker for Runner {
    async fn invoke(&self, name: &str, input: Value) -> ToolOutcome {
        match self.call(name, input).await {
            Ok(value) => ToolOutcome::ok(&truncate_strings(value, self.config.max_output_chars)),
            Err(err) => {
                tracing::debug!(tool = %name, kind = err.kind().as_str(), error = %err, "tool failed");
                err.into_outcome()
            }
        }
    }
}

#[async_trait]
impl JobExecutor for Runner {
    async fn execute(&self, tool_ref: &ToolRef, input: Value) -> ToolOutcome {
        match self.resolve_ref(tool_ref).await {
            Ok(name) => self.invoke(&name, input).await,
            Err(err) => err.into_outcome(),
        }
    }
}
