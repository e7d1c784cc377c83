use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

mod stop;

pub use stop::StopSignal;

/// Identity and contract of one tool, built-in or plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub version: String,
    pub input_schema: Value,
    #[serde(default)]
    pub network_access: bool,
    /// Owning plugin file; `None` for built-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Extra words the schema selector matches against.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl ToolSpecification {
    pub fn builtin(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: "builtin".into(),
            input_schema,
            network_access: false,
            source_path: None,
            keywords: Vec::new(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.source_path.is_none()
    }
}

pub fn default_input_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// How a scheduled job finds its tool again after restarts and reloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolRef {
    Builtin { tool_name: String },
    PluginFile { file: String, tool_name: String },
}

impl ToolRef {
    pub fn tool_name(&self) -> &str {
        match self {
            ToolRef::Builtin { tool_name } => tool_name,
            ToolRef::PluginFile { tool_name, .. } => tool_name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Policy,
    Sandbox,
    Timeout,
    Process,
    NotFound,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Policy => "policy",
            ErrorKind::Sandbox => "sandbox",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Process => "process",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io",
        }
    }
}

/// Result of one tool invocation as surfaced to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(value: &Value) -> Self {
        Self {
            text: value.to_string(),
            is_error: false,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        let body = json!({"error": message.into(), "error_kind": kind.as_str()});
        Self {
            text: body.to_string(),
            is_error: true,
        }
    }

    /// Error kind carried by an error outcome, if it has one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        if !self.is_error {
            return None;
        }
        let body: Value = serde_json::from_str(&self.text).ok()?;
        serde_json::from_value(body.get("error_kind")?.clone()).ok()
    }
}

/// Cut `text` to `max` chars, appending a marker with the dropped count.
pub fn truncate_text(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}...[truncated {} chars]", total - max)
}

/// Apply [`truncate_text`] to every string inside a JSON value.
pub fn truncate_strings(value: Value, max: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_text(&s, max)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| truncate_strings(v, max))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_strings(v, max)))
                .collect(),
        ),
        other => other,
    }
}

/// Anything that can run a tool by name.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, input: Value) -> ToolOutcome;
}

/// Runs the tool behind a stored [`ToolRef`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, tool_ref: &ToolRef, input: Value) -> ToolOutcome;
}

pub trait ToolHost: ToolInvoker + JobExecutor {}

impl<T: ToolInvoker + JobExecutor> ToolHost for T {}
