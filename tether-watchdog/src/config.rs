use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DIAG_MODEL: &str = "claude-haiku-4-5-20251001";
pub const DEFAULT_DIAG_BASE_URL: &str = "https://api.anthropic.com";

/// Supervisor tuning. Every knob maps to one `WATCHDOG_*` variable.
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    pub workdir: PathBuf,
    pub restart_backoff: Duration,
    pub max_backoff: Duration,
    pub min_uptime: Duration,
    /// Zero means unlimited.
    pub max_restarts: u32,
    pub health_url: Option<String>,
    pub health_timeout: Duration,
    pub health_failure_threshold: u32,
    pub health_interval: Duration,
    pub health_grace: Duration,
    pub guardian_interval: Duration,
    pub emergency_threshold: u32,
    pub auto_fix: bool,
    pub llm_diag: bool,
    /// Grace between SIGTERM and kill.
    pub term_grace: Duration,
    pub stop_file: PathBuf,
    pub pid_file: PathBuf,
    pub agent_log: PathBuf,
    pub metrics_file: PathBuf,
    pub feedback_file: PathBuf,
    pub alert_file: PathBuf,
}

impl WatchdogConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let logs = workdir.join("logs");
        Self {
            restart_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(60),
            min_uptime: Duration::from_secs(20),
            max_restarts: 0,
            health_url: Some("http://127.0.0.1:8080/health".into()),
            health_timeout: Duration::from_secs(2),
            health_failure_threshold: 3,
            health_interval: Duration::from_secs(5),
            health_grace: Duration::from_secs(20),
            guardian_interval: Duration::from_secs(180),
            emergency_threshold: 3,
            auto_fix: false,
            llm_diag: true,
            term_grace: Duration::from_secs(10),
            stop_file: logs.join("watchdog.stop"),
            pid_file: logs.join("watchdog.pid"),
            agent_log: logs.join("agent.log"),
            metrics_file: logs.join("recovery_metrics.jsonl"),
            feedback_file: logs.join("guardian_feedback.jsonl"),
            alert_file: logs.join("recovery_alerts.jsonl"),
            workdir,
        }
    }

    pub fn from_env(workdir: impl Into<PathBuf>) -> Self {
        Self::from_lookup(workdir, |key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults;
    /// values below a knob's minimum are raised to it.
    pub fn from_lookup(workdir: impl Into<PathBuf>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(workdir);
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: Duration, min: u64| {
            Duration::from_secs(int(get(key), default.as_secs(), min))
        };

        config.restart_backoff = secs("WATCHDOG_RESTART_BACKOFF_SECONDS", config.restart_backoff, 1);
        config.max_backoff = secs("WATCHDOG_MAX_BACKOFF_SECONDS", config.max_backoff, 1);
        config.min_uptime = secs("WATCHDOG_MIN_UPTIME_SECONDS", config.min_uptime, 1);
        config.max_restarts = int(get("WATCHDOG_MAX_RESTARTS"), 0, 0) as u32;
        config.health_timeout = secs("WATCHDOG_HEALTH_TIMEOUT_SECONDS", config.health_timeout, 1);
        config.health_failure_threshold =
            int(get("WATCHDOG_HEALTH_FAILURE_THRESHOLD"), 3, 1) as u32;
        config.health_interval =
            secs("WATCHDOG_HEALTH_CHECK_INTERVAL_SECONDS", config.health_interval, 1);
        config.health_grace = secs("WATCHDOG_HEALTH_GRACE_SECONDS", config.health_grace, 1);
        config.guardian_interval =
            secs("WATCHDOG_GUARDIAN_INTERVAL_SECONDS", config.guardian_interval, 15);
        config.emergency_threshold =
            int(get("WATCHDOG_EMERGENCY_RESTART_THRESHOLD"), 3, 1) as u32;
        config.auto_fix = flag(get("WATCHDOG_AUTO_FIX"), false);
        config.llm_diag = flag(get("WATCHDOG_LLM_DIAG_ENABLED"), true);

        config.health_url = match get("WATCHDOG_HEALTH_URL") {
            Some(url) if matches!(url.to_ascii_lowercase().as_str(), "off" | "none") => None,
            Some(url) => Some(url),
            None if !flag(get("HEALTH_SERVER_ENABLED"), true) => None,
            None => {
                let port = int(get("HEALTH_PORT"), 8080, 1).min(u16::MAX as u64);
                Some(format!("http://127.0.0.1:{port}/health"))
            }
        };

        let workdir = config.workdir.clone();
        let file = |key: &str, current: &mut PathBuf| {
            if let Some(rel) = get(key) {
                *current = resolve(&workdir, &rel);
            }
        };
        file("WATCHDOG_STOP_FILE", &mut config.stop_file);
        file("WATCHDOG_PID_FILE", &mut config.pid_file);
        file("WATCHDOG_AGENT_LOG", &mut config.agent_log);
        file("WATCHDOG_RECOVERY_METRICS_FILE", &mut config.metrics_file);
        file("WATCHDOG_FEEDBACK_FILE", &mut config.feedback_file);
        file("WATCHDOG_ALERT_FILE", &mut config.alert_file);
        config
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

fn int(raw: Option<String>, default: u64, min: u64) -> u64 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .map(|v| v.max(min as i64) as u64)
        .unwrap_or(default)
}

fn flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}
