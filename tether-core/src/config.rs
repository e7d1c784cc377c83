use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tether_policy::{load_permissions, PolicyEngine, PolicyError};
use tether_tools::{clamp_timeout, DEFAULT_MAX_OUTPUT_CHARS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Interactive,
    Daemon,
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interactive => "interactive",
            Self::Daemon => "daemon",
        })
    }
}

impl FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "daemon" => Ok(Self::Daemon),
            other => Err(format!("unknown AGENT_MODE '{other}' (expected interactive or daemon)")),
        }
    }
}

/// Agent settings read from the environment. Relative paths are resolved
/// against `workdir`.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub workdir: PathBuf,
    pub plugin_dir: PathBuf,
    pub strict_workdir: bool,
    pub tool_timeout: Duration,
    pub max_output_chars: usize,
    pub code_interpreter: String,
    pub scheduler_enabled: bool,
    pub scheduler_poll: Duration,
    pub schedule_file: PathBuf,
    pub pending_file: PathBuf,
    /// Raw `AGENT_MODE`; checked by [`AgentConfig::validate`].
    pub mode: String,
    pub dry_run: bool,
    pub permissions_json: Option<String>,
    pub permissions_file: Option<PathBuf>,
    pub health_enabled: bool,
    pub health_port: u16,
    pub required_commands: Vec<String>,
    pub install_command: Option<String>,
    pub journal_file: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str, default: bool| match get(key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        };
        let number = |key: &str, default: u64| {
            get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
        };

        let workdir = PathBuf::from(get("TOOL_WORKDIR").unwrap_or_else(|| ".".into()));
        let workdir = std::path::absolute(&workdir).unwrap_or(workdir);
        let path = |key: &str, default: &str| resolve(&workdir, &get(key).unwrap_or_else(|| default.into()));

        Self {
            plugin_dir: path(
                "PLUGIN_DIR",
                &get("CUSTOM_TOOL_DIR").unwrap_or_else(|| "tools".into()),
            ),
            strict_workdir: flag("STRICT_WORKDIR_ONLY", true),
            tool_timeout: clamp_timeout(number("TOOL_TIMEOUT_SECONDS", 300)),
            max_output_chars: number("TOOL_MAX_OUTPUT_CHARS", DEFAULT_MAX_OUTPUT_CHARS as u64).max(1) as usize,
            code_interpreter: get("CODE_INTERPRETER").unwrap_or_else(|| "python3".into()),
            scheduler_enabled: flag("SCHEDULER_ENABLED", true),
            scheduler_poll: Duration::from_secs(number("SCHEDULER_POLL_SECONDS", 30).max(5)),
            schedule_file: path("SCHEDULE_FILE", "schedules/jobs.json"),
            pending_file: path("PENDING_TASKS_FILE", "tasks/pending.txt"),
            mode: get("AGENT_MODE").unwrap_or_else(|| "interactive".into()),
            dry_run: flag("DRY_RUN", false),
            permissions_json: get("TOOL_PERMISSIONS_JSON"),
            permissions_file: get("TOOL_PERMISSIONS_FILE").map(|p| resolve(&workdir, &p)),
            health_enabled: flag("HEALTH_SERVER_ENABLED", true),
            health_port: match get("HEALTH_PORT") {
                Some(raw) => raw.parse::<u16>().unwrap_or(0),
                None => 8080,
            },
            required_commands: get("REQUIRED_COMMANDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            install_command: get("DEPENDENCY_INSTALL_COMMAND"),
            journal_file: path("JOURNAL_FILE", "logs/journal.jsonl"),
            workdir,
        }
    }

    /// Mode to run in; unknown values fall back to interactive after validation reported them.
    pub fn agent_mode(&self) -> AgentMode {
        self.mode.parse().unwrap_or(AgentMode::Interactive)
    }

    pub fn permissions(&self) -> Result<PolicyEngine, PolicyError> {
        load_permissions(self.permissions_json.as_deref(), self.permissions_file.as_deref())
    }

    /// Everything that would make startup pointless. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.workdir.is_dir() {
            errors.push(format!("TOOL_WORKDIR does not exist: {}", self.workdir.display()));
        }
        if self.health_port == 0 {
            errors.push("HEALTH_PORT must be between 1 and 65535".to_string());
        }
        if let Err(e) = self.mode.parse::<AgentMode>() {
            errors.push(e);
        }
        if let Err(e) = self.permissions() {
            errors.push(format!("tool permissions: {e}"));
        }
        errors
    }
}

fn resolve(workdir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}
