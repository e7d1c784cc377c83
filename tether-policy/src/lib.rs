//! Permission gate in front of every tool invocation.
//!
//! Each tool maps to `allow`, `prompt` or `deny`. The gate applies deny and
//! prompt first; dry-run only short-circuits calls that would otherwise run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_journal::Journal;
use tether_types::{ErrorKind, JobExecutor, ToolHost, ToolInvoker, ToolOutcome, ToolRef};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Allow,
    Prompt,
    Deny,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::Allow => "allow",
            Permission::Prompt => "prompt",
            Permission::Deny => "deny",
        })
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Permission::Allow),
            "prompt" | "ask" => Ok(Permission::Prompt),
            "deny" => Ok(Permission::Deny),
            other => Err(format!("unknown permission '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("tool '{tool}' is denied by policy")]
    Denied { tool: String },
    #[error("tool '{tool}' requires approval and no approver is available")]
    ApprovalRequired { tool: String },
    #[error("approval for tool '{tool}' was refused")]
    ApprovalDenied { tool: String },
    #[error("invalid permissions: {0}")]
    Config(String),
}

impl PolicyError {
    pub fn into_outcome(self) -> ToolOutcome {
        ToolOutcome::error(ErrorKind::Policy, self.to_string())
    }
}

pub fn default_permissions() -> BTreeMap<String, Permission> {
    BTreeMap::from([
        ("run_shell".to_string(), Permission::Prompt),
        ("delete_plugin_file".to_string(), Permission::Prompt),
    ])
}

/// Permission table. Tools without an entry are allowed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolicyEngine {
    permissions: BTreeMap<String, Permission>,
}

impl PolicyEngine {
    pub fn new(permissions: BTreeMap<String, Permission>) -> Self {
        Self { permissions }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_permissions())
    }

    pub fn evaluate_tool(&self, tool: &str) -> Permission {
        self.permissions.get(tool).copied().unwrap_or(Permission::Allow)
    }

    pub fn permissions(&self) -> &BTreeMap<String, Permission> {
        &self.permissions
    }

    /// Overlay `other` on top of this table.
    pub fn merged(mut self, other: BTreeMap<String, Permission>) -> Self {
        self.permissions.extend(other);
        self
    }
}

fn from_entries(value: Value, source: &str) -> Result<BTreeMap<String, Permission>, PolicyError> {
    let Value::Object(map) = value else {
        return Err(PolicyError::Config(format!("{source} must be an object of tool -> permission")));
    };
    let mut out = BTreeMap::new();
    for (tool, raw) in map {
        let parsed = raw
            .as_str()
            .ok_or_else(|| format!("value for '{tool}' is not a string"))
            .and_then(Permission::from_str);
        match parsed {
            Ok(permission) => {
                out.insert(tool, permission);
            }
            Err(reason) => tracing::warn!(tool = %tool, source = source, reason = %reason, "ignoring permission entry"),
        }
    }
    Ok(out)
}

/// Parse a JSON permission object. Entries with unknown values are skipped.
pub fn parse_permissions_json(text: &str) -> Result<BTreeMap<String, Permission>, PolicyError> {
    let value: Value = serde_json::from_str(text).map_err(|e| PolicyError::Config(e.to_string()))?;
    from_entries(value, "permissions json")
}

/// Parse a YAML permission file. An empty document is an empty table.
pub fn parse_permissions_yaml(text: &str) -> Result<BTreeMap<String, Permission>, PolicyError> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: Value = serde_yaml::from_str(text).map_err(|e| PolicyError::Config(e.to_string()))?;
    from_entries(value, "permissions file")
}

/// Defaults, then the optional YAML file, then the JSON override.
pub fn load_permissions(json: Option<&str>, file: Option<&Path>) -> Result<PolicyEngine, PolicyError> {
    let mut engine = PolicyEngine::with_defaults();
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Config(format!("{}: {e}", path.display())))?;
        engine = engine.merged(parse_permissions_yaml(&text)?);
    }
    if let Some(json) = json.filter(|j| !j.trim().is_empty()) {
        engine = engine.merged(parse_permissions_json(json)?);
    }
    Ok(engine)
}

#[derive(Clone, Debug, Serialize)]
pub struct ApprovalRequest {
    pub tool: String,
    pub input: Value,
    /// Fired by the scheduler rather than asked for interactively.
    pub scheduled: bool,
}

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

enum Verdict {
    Run,
    DryRun,
}

/// Wraps a [`ToolHost`] and applies the permission table to every call.
pub struct PolicyGate {
    inner: Arc<dyn ToolHost>,
    engine: RwLock<Arc<PolicyEngine>>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    dry_run: AtomicBool,
    journal: Option<Arc<Journal>>,
}

impl PolicyGate {
    pub fn new(inner: Arc<dyn ToolHost>, engine: PolicyEngine) -> Self {
        Self {
            inner,
            engine: RwLock::new(Arc::new(engine)),
            approval: None,
            dry_run: AtomicBool::new(false),
            journal: None,
        }
    }

    pub fn with_approval(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_dry_run(self, enabled: bool) -> Self {
        self.set_dry_run(enabled);
        self
    }

    pub fn permissions(&self) -> Arc<PolicyEngine> {
        self.engine.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Swap the whole table; calls that start afterwards see the new one.
    pub fn replace_permissions(&self, engine: PolicyEngine) {
        *self.engine.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(engine);
        tracing::info!("tool permissions replaced");
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::SeqCst);
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    async fn decide(&self, tool: &str, input: &Value, scheduled: bool) -> Result<Verdict, PolicyError> {
        let permission = self.permissions().evaluate_tool(tool);
        let result = match permission {
            Permission::Deny => Err(PolicyError::Denied { tool: tool.to_string() }),
            Permission::Prompt => match &self.approval {
                None => Err(PolicyError::ApprovalRequired { tool: tool.to_string() }),
                Some(handler) => {
                    let request = ApprovalRequest {
                        tool: tool.to_string(),
                        input: input.clone(),
                        scheduled,
                    };
                    if handler.approve(&request).await {
                        Ok(())
                    } else {
                        Err(PolicyError::ApprovalDenied { tool: tool.to_string() })
                    }
                }
            },
            Permission::Allow => Ok(()),
        };
        let verdict = result.map(|()| if self.dry_run() { Verdict::DryRun } else { Verdict::Run });
        self.record(tool, permission, scheduled, &verdict);
        verdict
    }

    fn record(&self, tool: &str, permission: Permission, scheduled: bool, verdict: &Result<Verdict, PolicyError>) {
        let decision = match verdict {
            Ok(Verdict::Run) => "run".to_string(),
            Ok(Verdict::DryRun) => "dry_run".to_string(),
            Err(err) => err.to_string(),
        };
        if verdict.is_err() {
            tracing::info!(tool = %tool, permission = %permission, decision = %decision, "tool call blocked");
        }
        let Some(journal) = &self.journal else {
            return;
        };
        let payload = json!({
            "tool": tool,
            "permission": permission,
            "scheduled": scheduled,
            "allowed": verdict.is_ok(),
            "decision": decision,
        });
        if let Err(err) = journal.append("policy_decision", payload) {
            tracing::warn!(error = %err, "failed to journal policy decision");
        }
    }
}

fn dry_run_outcome(tool: &str, input: Value) -> ToolOutcome {
    ToolOutcome::ok(&json!({"dry_run": true, "tool": tool, "input": input}))
}

#[async_trait]
impl ToolInvoker for PolicyGate {
    async fn invoke(&self, name: &str, input: Value) -> ToolOutcome {
        match self.decide(name, &input, false).await {
            Ok(Verdict::Run) => self.inner.invoke(name, input).await,
            Ok(Verdict::DryRun) => dry_run_outcome(name, input),
            Err(err) => err.into_outcome(),
        }
    }
}

#[async_trait]
impl JobExecutor for PolicyGate {
    async fn execute(&self, tool_ref: &ToolRef, input: Value) -> ToolOutcome {
        let name = tool_ref.tool_name();
        match self.decide(name, &input, true).await {
            Ok(Verdict::Run) => self.inner.execute(tool_ref, input).await,
            Ok(Verdict::DryRun) => dry_run_outcome(name, input),
            Err(err) => err.into_outcome(),
        }
    }
}
