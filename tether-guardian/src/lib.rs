//! Preflight audit of the agent's environment with optional auto-fix.
//!
//! Every check yields at most one issue per finding and, where a safe fix
//! exists, a [`RecoveryAction`]. Fixes are applied independently; one failing
//! action never stops the rest.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_cap::{normalize, CapabilityPolicy, FsCap, SandboxError};
use thiserror::Error;

mod probe;

pub use probe::{find_free_port, find_on_path, PortProbe, TcpPortProbe};

pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_RUNTIME_DIRS: [&str; 4] = ["logs", "schedules", "tasks", "tools"];
const OUTPUT_TAIL_CHARS: usize = 800;

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0}s")]
    Timeout(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardianIssue {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl GuardianIssue {
    fn warning(code: &str, message: String, detail: Value) -> Self {
        Self {
            code: code.into(),
            severity: Severity::Warning,
            message,
            detail: Some(detail),
        }
    }
}

/// A fix the guardian (or a diagnoser) may propose. Paths are workdir-relative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    CreateDir { path: String },
    RemoveFile { path: String },
    SetEnv { key: String, value: String },
    InstallDependencies { command: String, packages: Vec<String> },
}

impl RecoveryAction {
    /// Parse one proposed action, rejecting anything outside the known vocabulary.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Stable key used to drop duplicate proposals.
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: RecoveryAction,
    pub ok: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuardianReport {
    pub ok: bool,
    pub issue_count: usize,
    pub critical_count: usize,
    pub warning_count: usize,
    pub issues: Vec<GuardianIssue>,
    pub planned_actions: Vec<RecoveryAction>,
    pub applied_actions: Vec<ActionOutcome>,
    pub workdir: PathBuf,
}

impl GuardianReport {
    fn new(workdir: &Path, issues: Vec<GuardianIssue>, planned: Vec<RecoveryAction>) -> Self {
        let critical_count = issues.iter().filter(|i| i.severity == Severity::Critical).count();
        let warning_count = issues.len() - critical_count;
        Self {
            ok: critical_count == 0,
            issue_count: issues.len(),
            critical_count,
            warning_count,
            issues,
            planned_actions: planned,
            applied_actions: Vec::new(),
            workdir: workdir.to_path_buf(),
        }
    }
}

/// Human-readable rendering for terminals and logs.
pub fn format_report(report: &GuardianReport) -> String {
    let mut out = format!(
        "[guardian] preflight: issues={}, critical={}, warning={}",
        report.issue_count, report.critical_count, report.warning_count
    );
    for issue in &report.issues {
        let severity = match issue.severity {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        let _ = write!(out, "\n- [{severity}] {}: {}", issue.code, issue.message);
    }
    if !report.planned_actions.is_empty() {
        out.push_str("\n- planned_actions:");
        for action in &report.planned_actions {
            let _ = write!(out, "\n  - {}", json!(action));
        }
    }
    if !report.applied_actions.is_empty() {
        out.push_str("\n- applied_actions:");
        for outcome in &report.applied_actions {
            let status = if outcome.ok { "ok" } else { "failed" };
            let _ = write!(out, "\n  - {status} {}: {}", json!(outcome.action), outcome.message);
        }
    }
    out
}

pub trait ConfigValidator: Send + Sync {
    fn validate(&self) -> Vec<String>;
}

impl<F> ConfigValidator for F
where
    F: Fn() -> Vec<String> + Send + Sync,
{
    fn validate(&self) -> Vec<String> {
        self()
    }
}

#[derive(Clone, Debug)]
pub struct GuardianConfig {
    pub workdir: PathBuf,
    /// Directories that must exist, relative to the workdir.
    pub runtime_dirs: Vec<PathBuf>,
    /// Port the health server will bind, when it is enabled.
    pub health_port: Option<u16>,
    pub required_commands: Vec<String>,
    pub install_command: Option<String>,
    /// A leftover stop marker here is reported and can be removed.
    pub stop_marker: Option<PathBuf>,
}

impl GuardianConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            runtime_dirs: DEFAULT_RUNTIME_DIRS.iter().map(PathBuf::from).collect(),
            health_port: None,
            required_commands: Vec::new(),
            install_command: None,
            stop_marker: None,
        }
    }
}

pub struct Guardian {
    config: GuardianConfig,
    ports: Arc<dyn PortProbe>,
    validator: Option<Arc<dyn ConfigValidator>>,
    // Variables set by `SetEnv`; the process environment is never touched.
    env_overrides: Mutex<BTreeMap<String, String>>,
}

impl Guardian {
    pub fn new(config: GuardianConfig) -> Self {
        Self {
            config,
            ports: Arc::new(TcpPortProbe),
            validator: None,
            env_overrides: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.ports = probe;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConfigValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    /// Variables applied by `SetEnv` fixes, for re-inspection and child processes.
    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        self.env_overrides.lock().map(|env| env.clone()).unwrap_or_default()
    }

    pub fn inspect(&self) -> GuardianReport {
        self.inspect_with(&self.env_overrides())
    }

    fn inspect_with(&self, env: &BTreeMap<String, String>) -> GuardianReport {
        let workdir = &self.config.workdir;
        let mut issues = Vec::new();
        let mut planned = Vec::new();

        for dir in &self.config.runtime_dirs {
            let abs = if dir.is_absolute() { dir.clone() } else { workdir.join(dir) };
            if abs.exists() {
                continue;
            }
            let rel = relative_to(workdir, &abs);
            issues.push(GuardianIssue::warning(
                "missing_runtime_dir",
                format!("runtime directory is missing: {rel}"),
                json!({"path": rel}),
            ));
            planned.push(RecoveryAction::CreateDir { path: rel });
        }

        let port = env
            .get("HEALTH_PORT")
            .and_then(|p| p.parse::<u16>().ok())
            .or(self.config.health_port);
        if let Some(port) = port.filter(|p| *p > 0) {
            if self.ports.is_busy(port) {
                let free = find_free_port(self.ports.as_ref(), u32::from(port) + 1);
                issues.push(GuardianIssue::warning(
                    "health_port_conflict",
                    format!("HEALTH_PORT {port} is already in use"),
                    json!({"port": port, "suggested": free}),
                ));
                if let Some(free) = free {
                    planned.push(RecoveryAction::SetEnv {
                        key: "HEALTH_PORT".into(),
                        value: free.to_string(),
                    });
                }
            }
        }

        let missing: Vec<String> = self
            .config
            .required_commands
            .iter()
            .filter(|c| find_on_path(c).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            issues.push(GuardianIssue::warning(
                "missing_dependencies",
                format!("missing dependencies: {}", missing.join(", ")),
                json!({"packages": missing}),
            ));
            if let Some(command) = &self.config.install_command {
                planned.push(RecoveryAction::InstallDependencies {
                    command: command.clone(),
                    packages: missing,
                });
            }
        }

        if let Some(marker) = self.config.stop_marker.as_ref().filter(|m| m.exists()) {
            let rel = relative_to(workdir, marker);
            issues.push(GuardianIssue::warning(
                "stale_stop_marker",
                format!("stop marker left over from a previous run: {rel}"),
                json!({"path": rel}),
            ));
            planned.push(RecoveryAction::RemoveFile { path: rel });
        }

        if let Some(validator) = &self.validator {
            for message in validator.validate() {
                if message.trim().is_empty() {
                    continue;
                }
                issues.push(GuardianIssue {
                    code: "config_validation_error".into(),
                    severity: Severity::Critical,
                    message,
                    detail: None,
                });
            }
        }

        GuardianReport::new(workdir, issues, planned)
    }

    /// Apply each action on its own and report every outcome.
    pub async fn apply(&self, actions: &[RecoveryAction]) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let result = self.apply_one(action).await;
            let outcome = match result {
                Ok(message) => ActionOutcome { action: action.clone(), ok: true, message },
                Err(err) => ActionOutcome { action: action.clone(), ok: false, message: err.to_string() },
            };
            tracing::info!(
                action = %json!(action),
                ok = outcome.ok,
                message = %outcome.message,
                "recovery action applied"
            );
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn apply_one(&self, action: &RecoveryAction) -> Result<String, GuardianError> {
        match action {
            RecoveryAction::CreateDir { path } => {
                self.workdir_fs()?.create_dir_all(self.inside(path)?)?;
                Ok(format!("created {path}"))
            }
            RecoveryAction::RemoveFile { path } => {
                let target = self.inside(path)?;
                if !target.exists() {
                    return Ok(format!("{path} already gone"));
                }
                self.workdir_fs()?.remove_file(target)?;
                Ok(format!("removed {path}"))
            }
            RecoveryAction::SetEnv { key, value } => {
                if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(GuardianError::Invalid(format!("invalid environment key '{key}'")));
                }
                if value.contains('\n') {
                    return Err(GuardianError::Invalid("environment values must be one line".into()));
                }
                let env_file = self.config.workdir.join(".env");
                let current = match std::fs::read_to_string(&env_file) {
                    Ok(text) => text,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
                    Err(err) => return Err(err.into()),
                };
                self.workdir_fs()?.write(&env_file, upsert_env(&current, key, value).as_bytes())?;
                if let Ok(mut env) = self.env_overrides.lock() {
                    env.insert(key.clone(), value.clone());
                }
                Ok(format!("set {key}={value} in .env"))
            }
            RecoveryAction::InstallDependencies { command, packages } => {
                self.install(command, packages).await
            }
        }
    }

    async fn install(&self, command: &str, packages: &[String]) -> Result<String, GuardianError> {
        let configured = self
            .config
            .install_command
            .as_deref()
            .ok_or_else(|| GuardianError::Invalid("no dependency install command is configured".into()))?;
        if command.trim() != configured.trim() {
            return Err(GuardianError::Invalid(format!(
                "install command '{command}' does not match the configured one"
            )));
        }
        if packages.is_empty() {
            return Err(GuardianError::Invalid("no packages to install".into()));
        }
        let mut argv = shlex::split(configured)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| GuardianError::Invalid(format!("malformed install command '{configured}'")))?;
        argv.extend(packages.iter().cloned());
        let program = argv.remove(0);

        let mut child = tokio::process::Command::new(&program);
        child
            .args(&argv)
            .envs(self.env_overrides())
            .current_dir(&self.config.workdir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(INSTALL_TIMEOUT, child.output())
            .await
            .map_err(|_| GuardianError::Timeout(INSTALL_TIMEOUT.as_secs()))??;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(GuardianError::Invalid(format!(
                "install exited with {:?}: {}",
                output.status.code(),
                tail(&stderr, OUTPUT_TAIL_CHARS)
            )));
        }
        Ok(format!("installed {}", packages.join(", ")))
    }

    /// Inspect, optionally fix, and re-inspect after fixing.
    pub async fn run(&self, auto_fix: bool) -> GuardianReport {
        let first = self.inspect();
        if !auto_fix || first.planned_actions.is_empty() {
            return first;
        }
        let applied = self.apply(&first.planned_actions).await;
        let mut report = self.inspect();
        report.applied_actions = applied;
        report
    }

    fn workdir_fs(&self) -> Result<FsCap, SandboxError> {
        let mut policy = CapabilityPolicy::permissive(&self.config.workdir);
        policy.strict = true;
        FsCap::open(&policy)
    }

    fn inside(&self, rel: &str) -> Result<PathBuf, GuardianError> {
        let abs = normalize(&self.config.workdir.join(rel));
        if !abs.starts_with(normalize(&self.config.workdir)) || rel.trim().is_empty() {
            return Err(GuardianError::Invalid(format!("'{rel}' is outside the workdir")));
        }
        Ok(abs)
    }
}

fn relative_to(base: &Path, target: &Path) -> String {
    target
        .strip_prefix(base)
        .unwrap_or(target)
        .display()
        .to_string()
}

fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max)).collect()
}

/// Replace `key=...` in a dotenv body, or append it.
pub fn upsert_env(current: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}=");
    let mut found = false;
    let mut lines: Vec<String> = current
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let bare = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            if bare.starts_with(&prefix) {
                found = true;
                format!("{key}={value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(format!("{key}={value}"));
    }
    let mut body = lines.join("\n");
    body.push('\n');
    body
}
