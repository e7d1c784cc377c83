use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_guardian::{GuardianReport, RecoveryAction};

use crate::config::{DEFAULT_DIAG_BASE_URL, DEFAULT_DIAG_MODEL};
use crate::WatchdogError;

pub const DIAG_TIMEOUT: Duration = Duration::from_secs(30);
pub const LOG_TAIL_LINES: usize = 80;
const MAX_TOKENS: u32 = 700;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    pub confidence: f64,
    pub actions: Vec<RecoveryAction>,
}

impl Diagnosis {
    /// Stand-in recorded when no diagnoser answered.
    pub fn heuristic() -> Self {
        Self {
            root_cause: "heuristic-only".into(),
            confidence: 0.0,
            actions: Vec::new(),
        }
    }
}

/// Proposes extra recovery actions after repeated crashes.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(&self, report: &GuardianReport) -> Result<Option<Diagnosis>, WatchdogError>;
}

/// Asks the Anthropic messages API for a root cause and actions.
pub struct HttpDiagnoser {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    agent_log: PathBuf,
}

impl HttpDiagnoser {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        agent_log: impl Into<PathBuf>,
    ) -> Result<Self, WatchdogError> {
        let client = reqwest::Client::builder()
            .timeout(DIAG_TIMEOUT)
            .build()
            .map_err(|e| WatchdogError::Diagnoser(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            agent_log: agent_log.into(),
        })
    }

    /// `None` when no API key is configured.
    pub fn from_env(agent_log: impl Into<PathBuf>) -> Result<Option<Self>, WatchdogError> {
        let var = |key: &str| std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let Some(api_key) = var("ANTHROPIC_API_KEY") else {
            return Ok(None);
        };
        let base_url = var("WATCHDOG_DIAG_BASE_URL").unwrap_or_else(|| DEFAULT_DIAG_BASE_URL.into());
        let model = var("WATCHDOG_DIAG_MODEL").unwrap_or_else(|| DEFAULT_DIAG_MODEL.into());
        Self::new(base_url, api_key, model, agent_log).map(Some)
    }

    fn prompt(&self, report: &GuardianReport) -> String {
        let log_tail = match std::fs::read_to_string(&self.agent_log) {
            Ok(text) => tail_lines(&text, LOG_TAIL_LINES),
            Err(_) => String::new(),
        };
        let report = serde_json::to_string(report).unwrap_or_default();
        format!(
            "You diagnose crash loops of a supervised automation agent.\n\
             Analyze the guardian report and the agent log tail, then return strict JSON only.\n\
             Allowed action types: create_dir(path), remove_file(path), set_env(key,value), \
             install_dependencies(command,packages).\n\
             Guardian report:\n{report}\n\n\
             Agent log tail:\n{log_tail}\n\n\
             Return JSON: {{\"root_cause\":\"...\",\"confidence\":0.0,\"actions\":[...]}}"
        )
    }
}

#[async_trait]
impl Diagnoser for HttpDiagnoser {
    async fn diagnose(&self, report: &GuardianReport) -> Result<Option<Diagnosis>, WatchdogError> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": self.prompt(report)}],
        });
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| WatchdogError::Diagnoser(format!("HTTP error: {e}")))?;
        if !resp.status().is_success() {
            return Err(WatchdogError::Diagnoser(format!("HTTP status: {}", resp.status())));
        }
        let raw = resp
            .text()
            .await
            .map_err(|e| WatchdogError::Diagnoser(e.to_string()))?;
        Ok(parse_response(&raw))
    }
}

/// Pull a diagnosis out of a messages API response, falling back to the raw body.
pub fn parse_response(raw: &str) -> Option<Diagnosis> {
    let from_blocks = serde_json::from_str::<Value>(raw).ok().and_then(|data| {
        let text: String = data
            .get("content")?
            .as_array()?
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
        extract_object(&text)
    });
    let parsed = from_blocks.or_else(|| extract_object(raw))?;
    if parsed.get("root_cause").is_none() && parsed.get("actions").is_none() {
        return None;
    }
    Some(Diagnosis {
        root_cause: parsed
            .get("root_cause")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        confidence: parsed.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
        actions: known_actions(parsed.get("actions")),
    })
}

/// Keep only actions in the recovery vocabulary.
pub fn known_actions(actions: Option<&Value>) -> Vec<RecoveryAction> {
    actions
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(RecoveryAction::from_value).collect())
        .unwrap_or_default()
}

// Whole text as an object, else the outermost `{...}` span.
fn extract_object(text: &str) -> Option<Value> {
    let raw = text.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
