use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tether_guardian::{ActionOutcome, Guardian, GuardianReport, RecoveryAction};
use tether_journal::Journal;
use tether_types::StopSignal;
use tokio::time::Instant;

use crate::config::WatchdogConfig;
use crate::diagnose::{Diagnoser, Diagnosis};
use crate::health::HealthProbe;
use crate::launcher::{ChildLauncher, ManagedChild};
use crate::WatchdogError;

/// Exit code recorded when the agent could not be started at all.
pub const LAUNCH_FAILED_CODE: i32 = 127;

/// Environment audit used for tier 3 and tier 4 recovery.
#[async_trait]
pub trait RecoveryAdvisor: Send + Sync {
    async fn assess(&self) -> GuardianReport;
    async fn apply(&self, actions: &[RecoveryAction]) -> Vec<ActionOutcome>;

    /// Environment set by applied fixes, passed to every later launch.
    fn env_overrides(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[async_trait]
impl RecoveryAdvisor for Guardian {
    async fn assess(&self) -> GuardianReport {
        self.inspect()
    }

    async fn apply(&self, actions: &[RecoveryAction]) -> Vec<ActionOutcome> {
        Guardian::apply(self, actions).await
    }

    fn env_overrides(&self) -> BTreeMap<String, String> {
        Guardian::env_overrides(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Starting,
    Running,
    Exited,
    Unhealthy,
    BackoffWait,
    EmergencyRecovery,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The agent exited with code 0.
    CleanExit,
    RestartLimitExceeded { exit_code: i32 },
    Stopped,
}

impl SupervisorOutcome {
    /// Process exit code for the watchdog itself.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CleanExit | Self::Stopped => 0,
            Self::RestartLimitExceeded { exit_code } if (1..=255).contains(exit_code) => *exit_code,
            Self::RestartLimitExceeded { .. } => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogState {
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub backoff: Duration,
    pub health_failure_count: u32,
}

/// The three recovery journals under `logs/`.
pub struct RecoveryRecords {
    metrics: Journal,
    feedback: Journal,
    alerts: Journal,
}

impl RecoveryRecords {
    pub fn open(config: &WatchdogConfig) -> Result<Self, WatchdogError> {
        Ok(Self {
            metrics: Journal::open(&config.metrics_file)?,
            feedback: Journal::open(&config.feedback_file)?,
            alerts: Journal::open(&config.alert_file)?,
        })
    }

    fn metric(&self, payload: Value) {
        record(&self.metrics, "recovery_metrics", payload);
    }

    fn feedback(&self, payload: Value) {
        record(&self.feedback, "guardian_feedback", payload);
    }

    fn alert(&self, event: &str, mut payload: Value) {
        tracing::error!(event, payload = %payload, "recovery alert");
        if let Value::Object(map) = &mut payload {
            map.insert("event".into(), json!(event));
        }
        record(&self.alerts, "recovery_alerts", payload);
    }
}

fn record(journal: &Journal, kind: &str, payload: Value) {
    if let Err(e) = journal.append(kind, payload) {
        tracing::warn!(kind, path = %journal.path().display(), error = %e, "failed to append record");
    }
}

struct PidFile(PathBuf);

impl PidFile {
    fn write(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Drop repeated proposals, keeping first occurrences in order.
pub fn dedupe_actions(actions: Vec<RecoveryAction>) -> Vec<RecoveryAction> {
    let mut seen = HashSet::new();
    actions
        .into_iter()
        .filter(|a| seen.insert(a.canonical_key()))
        .collect()
}

/// Keeps the agent alive.
///
/// Tier 1 restarts on a non-zero exit with exponential backoff. Tier 2
/// restarts a child that keeps failing its health probe. Tier 3 runs the
/// recovery advisor on every exit and periodically while the child runs.
/// Tier 4 merges advisor and diagnoser actions once failures pile up.
pub struct Supervisor {
    config: WatchdogConfig,
    launcher: Arc<dyn ChildLauncher>,
    advisor: Arc<dyn RecoveryAdvisor>,
    health: Option<Arc<dyn HealthProbe>>,
    diagnoser: Option<Arc<dyn Diagnoser>>,
    records: RecoveryRecords,
    state: WatchdogState,
    phase: SupervisorPhase,
}

impl Supervisor {
    pub fn new(
        config: WatchdogConfig,
        launcher: Arc<dyn ChildLauncher>,
        advisor: Arc<dyn RecoveryAdvisor>,
    ) -> Result<Self, WatchdogError> {
        let records = RecoveryRecords::open(&config)?;
        let state = WatchdogState {
            restart_count: 0,
            consecutive_failures: 0,
            backoff: config.restart_backoff,
            health_failure_count: 0,
        };
        Ok(Self {
            config,
            launcher,
            advisor,
            health: None,
            diagnoser: None,
            records,
            state,
            phase: SupervisorPhase::Starting,
        })
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(probe);
        self
    }

    pub fn with_diagnoser(mut self, diagnoser: Arc<dyn Diagnoser>) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    pub async fn run(&mut self, stop: &StopSignal) -> Result<SupervisorOutcome, WatchdogError> {
        if stop.clear_marker()? {
            tracing::info!("removed stale stop marker");
        }
        let _pid = PidFile::write(&self.config.pid_file)?;
        tracing::info!(
            pid = std::process::id(),
            workdir = %self.config.workdir.display(),
            auto_fix = self.config.auto_fix,
            llm_diag = self.config.llm_diag,
            guardian_interval_secs = self.config.guardian_interval.as_secs(),
            emergency_threshold = self.config.emergency_threshold,
            "watchdog started"
        );

        loop {
            if stop.is_stopped() {
                tracing::info!("stop marker present before launch");
                return Ok(self.stopped());
            }
            self.enter(SupervisorPhase::Starting);
            let started = Instant::now();
            let code = match self.launcher.launch(&self.advisor.env_overrides()).await {
                Ok(child) => match self.watch(child, started, stop).await? {
                    Some(code) => code,
                    None => return Ok(self.stopped()),
                },
                Err(e) => {
                    tracing::error!(error = %e, "agent launch failed");
                    LAUNCH_FAILED_CODE
                }
            };

            self.enter(SupervisorPhase::Exited);
            if let Some(outcome) = self.after_exit(code, started.elapsed(), stop).await {
                return Ok(outcome);
            }

            self.enter(SupervisorPhase::BackoffWait);
            tracing::info!(
                backoff_secs = self.state.backoff.as_secs(),
                restart_count = self.state.restart_count,
                "restarting agent after backoff"
            );
            self.records.metric(json!({
                "event": "restart_scheduled",
                "restart_count": self.state.restart_count,
                "backoff_seconds": self.state.backoff.as_secs(),
            }));
            if stop.sleep(self.state.backoff).await {
                tracing::info!("stop requested during backoff");
                return Ok(self.stopped());
            }
        }
    }

    fn stopped(&mut self) -> SupervisorOutcome {
        self.enter(SupervisorPhase::Stopped);
        SupervisorOutcome::Stopped
    }

    fn enter(&mut self, phase: SupervisorPhase) {
        if self.phase != phase {
            tracing::info!(from = ?self.phase, to = ?phase, "watchdog phase");
        }
        self.phase = phase;
    }

    /// Follow one child until it exits (`Some(code)`) or a stop is requested (`None`).
    async fn watch(
        &mut self,
        mut child: Box<dyn ManagedChild>,
        started: Instant,
        stop: &StopSignal,
    ) -> Result<Option<i32>, WatchdogError> {
        self.enter(SupervisorPhase::Running);
        self.state.health_failure_count = 0;
        let mut next_health = started + self.config.health_grace;
        let mut next_guardian = started + self.config.guardian_interval;

        loop {
            let deadline = match self.health {
                Some(_) => next_health.min(next_guardian),
                None => next_guardian,
            };
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    self.terminate_on_stop(child.as_mut()).await?;
                    return Ok(None);
                }
                code = child.wait() => return code.map(Some),
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let now = Instant::now();
            if now >= next_guardian {
                next_guardian = now + self.config.guardian_interval;
                let finished = tokio::select! {
                    biased;
                    _ = stop.stopped() => false,
                    _ = self.guardian_pass("guardian_periodic") => true,
                };
                if !finished {
                    self.terminate_on_stop(child.as_mut()).await?;
                    return Ok(None);
                }
            }
            let Some(probe) = self.health.clone() else {
                continue;
            };
            if now < next_health {
                continue;
            }
            next_health = now + self.config.health_interval;
            if probe.check().await {
                self.state.health_failure_count = 0;
                continue;
            }
            self.state.health_failure_count += 1;
            tracing::warn!(
                failures = self.state.health_failure_count,
                threshold = self.config.health_failure_threshold,
                url = ?self.config.health_url,
                "health check failed"
            );
            if self.state.health_failure_count >= self.config.health_failure_threshold {
                self.enter(SupervisorPhase::Unhealthy);
                self.records.metric(json!({
                    "event": "health_restart",
                    "health_url": self.config.health_url,
                    "failures": self.state.health_failure_count,
                }));
                let code = child.terminate(self.config.term_grace).await?;
                return Ok(Some(code));
            }
        }
    }

    async fn terminate_on_stop(&mut self, child: &mut dyn ManagedChild) -> Result<(), WatchdogError> {
        tracing::info!(pid = ?child.id(), "stop requested; terminating agent");
        let code = child.terminate(self.config.term_grace).await?;
        tracing::info!(exit_code = code, "agent terminated");
        Ok(())
    }

    async fn after_exit(&mut self, code: i32, uptime: Duration, stop: &StopSignal) -> Option<SupervisorOutcome> {
        tracing::info!(exit_code = code, uptime_secs = uptime.as_secs(), "agent exited");
        self.records.metric(json!({
            "event": "process_exit",
            "exit_code": code,
            "uptime_seconds": uptime.as_secs(),
            "restart_count": self.state.restart_count,
        }));
        if code == 0 {
            self.state.consecutive_failures = 0;
            tracing::info!("agent exited cleanly; not restarting");
            return Some(SupervisorOutcome::CleanExit);
        }

        self.state.restart_count += 1;
        let quick = uptime < self.config.min_uptime;
        if quick {
            self.state.consecutive_failures += 1;
        } else {
            self.state.consecutive_failures = 0;
        }

        let max = self.config.max_restarts;
        if max > 0 && self.state.restart_count > max {
            self.records.alert(
                "max_restarts_exceeded",
                json!({
                    "max_restarts": max,
                    "restart_count": self.state.restart_count,
                    "consecutive_failures": self.state.consecutive_failures,
                }),
            );
            self.enter(SupervisorPhase::Stopped);
            return Some(SupervisorOutcome::RestartLimitExceeded { exit_code: code });
        }

        let report = tokio::select! {
            biased;
            _ = stop.stopped() => None,
            report = self.guardian_pass("guardian_report_on_exit") => Some(report),
        };
        let Some(report) = report else {
            tracing::info!("stop requested during guardian pass");
            return Some(self.stopped());
        };
        if self.state.consecutive_failures >= self.config.emergency_threshold {
            let finished = tokio::select! {
                biased;
                _ = stop.stopped() => false,
                _ = self.emergency(&report) => true,
            };
            if !finished {
                tracing::info!("stop requested during emergency recovery");
                return Some(self.stopped());
            }
        }

        self.state.backoff = if quick {
            (self.state.backoff * 2)
                .max(self.config.restart_backoff)
                .min(self.config.max_backoff)
        } else {
            self.config.restart_backoff
        };
        None
    }

    async fn guardian_pass(&mut self, event: &str) -> GuardianReport {
        let report = self.advisor.assess().await;
        let mut feedback = json!({
            "event": event,
            "restart_count": self.state.restart_count,
            "consecutive_failures": self.state.consecutive_failures,
            "report": report,
        });
        if self.config.auto_fix && !report.planned_actions.is_empty() {
            let results = self.advisor.apply(&report.planned_actions).await;
            let ok_count = results.iter().filter(|r| r.ok).count();
            tracing::info!(event, ok_count, total = results.len(), "guardian auto-fix applied");
            self.records.metric(json!({
                "event": "guardian_autofix",
                "ok_count": ok_count,
                "total": results.len(),
            }));
            feedback["autofix"] = json!(results);
        }
        self.records.feedback(feedback);
        self.records.metric(json!({
            "event": event,
            "issues": report.issue_count,
            "consecutive_failures": self.state.consecutive_failures,
        }));
        report
    }

    async fn emergency(&mut self, report: &GuardianReport) {
        let previous = self.phase;
        self.enter(SupervisorPhase::EmergencyRecovery);

        let diagnosis = match (&self.diagnoser, self.config.llm_diag) {
            (Some(diagnoser), true) => match diagnoser.diagnose(report).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "diagnoser failed");
                    None
                }
            },
            _ => None,
        };

        let mut planned = report.planned_actions.clone();
        if let Some(d) = &diagnosis {
            planned.extend(d.actions.iter().cloned());
        }
        let planned = dedupe_actions(planned);
        let applied = if self.config.auto_fix && !planned.is_empty() {
            self.advisor.apply(&planned).await
        } else {
            Vec::new()
        };
        let success = !applied.is_empty() && applied.iter().all(|o| o.ok);
        let diagnosis = diagnosis.unwrap_or_else(Diagnosis::heuristic);

        self.records.feedback(json!({
            "event": "emergency_recovery",
            "restart_count": self.state.restart_count,
            "consecutive_failures": self.state.consecutive_failures,
            "diagnosis": diagnosis,
            "planned_actions": planned,
            "applied_actions": applied,
            "success": success,
        }));
        self.records.metric(json!({
            "event": "emergency_recovery",
            "success": success,
            "consecutive_failures": self.state.consecutive_failures,
        }));

        if success {
            tracing::info!(actions = applied.len(), "emergency recovery succeeded");
            self.state.consecutive_failures = 0;
        } else {
            self.records.alert(
                "emergency_recovery_failed",
                json!({
                    "restart_count": self.state.restart_count,
                    "consecutive_failures": self.state.consecutive_failures,
                    "diagnosis": diagnosis,
                    "actions": planned,
                }),
            );
        }
        self.enter(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tether_journal::read_entries;

    struct FakeChild {
        exits_at: Instant,
        code: i32,
    }

    #[async_trait]
    impl ManagedChild for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> Result<i32, WatchdogError> {
            tokio::time::sleep_until(self.exits_at).await;
            Ok(self.code)
        }

        async fn terminate(&mut self, _grace: Duration) -> Result<i32, WatchdogError> {
            Ok(143)
        }
    }

    /// Each launch pops `(uptime, exit code)`; an empty script exits cleanly.
    struct Script {
        runs: Mutex<VecDeque<(Duration, i32)>>,
        launches: AtomicUsize,
    }

    impl Script {
        fn new(runs: &[(u64, i32)]) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(runs.iter().map(|(s, c)| (Duration::from_secs(*s), *c)).collect()),
                launches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChildLauncher for Script {
        async fn launch(&self, _env: &BTreeMap<String, String>) -> Result<Box<dyn ManagedChild>, WatchdogError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (uptime, code) = self.runs.lock().unwrap().pop_front().unwrap_or((Duration::ZERO, 0));
            Ok(Box::new(FakeChild {
                exits_at: Instant::now() + uptime,
                code,
            }))
        }
    }

    struct FakeAdvisor {
        planned: Vec<RecoveryAction>,
        fixes_work: bool,
        assessments: AtomicUsize,
    }

    impl FakeAdvisor {
        fn new(planned: Vec<RecoveryAction>, fixes_work: bool) -> Arc<Self> {
            Arc::new(Self {
                planned,
                fixes_work,
                assessments: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoveryAdvisor for FakeAdvisor {
        async fn assess(&self) -> GuardianReport {
            self.assessments.fetch_add(1, Ordering::SeqCst);
            GuardianReport {
                ok: true,
                issue_count: self.planned.len(),
                critical_count: 0,
                warning_count: self.planned.len(),
                issues: Vec::new(),
                planned_actions: self.planned.clone(),
                applied_actions: Vec::new(),
                workdir: PathBuf::from("/agent"),
            }
        }

        async fn apply(&self, actions: &[RecoveryAction]) -> Vec<ActionOutcome> {
            actions
                .iter()
                .map(|a| ActionOutcome {
                    action: a.clone(),
                    ok: self.fixes_work,
                    message: String::new(),
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct CountingDiagnoser(AtomicUsize);

    #[async_trait]
    impl Diagnoser for CountingDiagnoser {
        async fn diagnose(&self, _report: &GuardianReport) -> Result<Option<Diagnosis>, WatchdogError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Diagnosis {
                root_cause: "bad config".into(),
                confidence: 0.5,
                actions: vec![RecoveryAction::CreateDir { path: "logs".into() }],
            }))
        }
    }

    struct AlwaysDown;

    #[async_trait]
    impl HealthProbe for AlwaysDown {
        async fn check(&self) -> bool {
            false
        }
    }

    fn config(dir: &Path) -> WatchdogConfig {
        let mut config = WatchdogConfig::new(dir);
        config.health_url = None;
        config
    }

    fn events(path: &Path, event: &str) -> Vec<Value> {
        if !path.exists() {
            return Vec::new();
        }
        read_entries(path)
            .unwrap()
            .into_iter()
            .map(|e| e.payload)
            .filter(|p| p["event"] == event)
            .collect()
    }

    fn backoffs(config: &WatchdogConfig) -> Vec<u64> {
        events(&config.metrics_file, "restart_scheduled")
            .iter()
            .map(|p| p["backoff_seconds"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn quick_failures_back_off_up_to_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.max_backoff = Duration::from_secs(10);
        config.max_restarts = 4;
        config.emergency_threshold = 100;
        let script = Script::new(&[(1, 1), (1, 1), (1, 1), (1, 1), (1, 1)]);
        let mut sup = Supervisor::new(config.clone(), script.clone(), FakeAdvisor::new(vec![], true)).unwrap();

        let outcome = sup.run(&StopSignal::new()).await.unwrap();
        assert_eq!(outcome, SupervisorOutcome::RestartLimitExceeded { exit_code: 1 });
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(script.launches.load(Ordering::SeqCst), 5);

        let waits = backoffs(&config);
        assert_eq!(waits, vec![6, 10, 10, 10]);
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        let alerts = events(&config.alert_file, "max_restarts_exceeded");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["restart_count"], 5);
        assert!(!config.pid_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn long_run_resets_backoff_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let script = Script::new(&[(1, 1), (1, 1), (30, 1)]);
        let mut sup = Supervisor::new(config.clone(), script, FakeAdvisor::new(vec![], true)).unwrap();

        assert_eq!(sup.run(&StopSignal::new()).await.unwrap(), SupervisorOutcome::CleanExit);
        assert_eq!(backoffs(&config), vec![6, 12, 3]);
        assert_eq!(sup.state().restart_count, 3);
        assert_eq!(sup.state().consecutive_failures, 0);
        assert_eq!(sup.state().backoff, Duration::from_secs(3));
        assert!(events(&config.feedback_file, "emergency_recovery").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_runs_one_emergency_and_alerts_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.max_restarts = 3;
        let script = Script::new(&[(1, 2), (1, 2), (1, 2), (1, 2)]);
        let diagnoser = Arc::new(CountingDiagnoser::default());
        let mut sup = Supervisor::new(config.clone(), script, FakeAdvisor::new(vec![], true))
            .unwrap()
            .with_diagnoser(diagnoser.clone());

        let outcome = sup.run(&StopSignal::new()).await.unwrap();
        assert_eq!(outcome, SupervisorOutcome::RestartLimitExceeded { exit_code: 2 });
        assert_eq!(diagnoser.0.load(Ordering::SeqCst), 1);
        assert_eq!(events(&config.feedback_file, "emergency_recovery").len(), 1);

        let alerts = events(&config.alert_file, "emergency_recovery_failed");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["restart_count"], 3);
        assert_eq!(alerts[0]["consecutive_failures"], 3);
        assert_eq!(alerts[0]["diagnosis"]["root_cause"], "bad config");
        assert_eq!(alerts[0]["actions"][0]["type"], "create_dir");
    }

    #[tokio::test(start_paused = true)]
    async fn successful_emergency_resets_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.emergency_threshold = 2;
        config.auto_fix = true;
        let planned = vec![RecoveryAction::CreateDir { path: "logs".into() }];
        let diagnoser = Arc::new(CountingDiagnoser::default());
        let script = Script::new(&[(1, 1), (1, 1), (1, 1)]);
        let mut sup = Supervisor::new(config.clone(), script, FakeAdvisor::new(planned, true))
            .unwrap()
            .with_diagnoser(diagnoser.clone());

        assert_eq!(sup.run(&StopSignal::new()).await.unwrap(), SupervisorOutcome::CleanExit);
        let emergencies = events(&config.feedback_file, "emergency_recovery");
        assert_eq!(emergencies.len(), 1);
        assert_eq!(emergencies[0]["success"], true);
        // The diagnoser proposed the same create_dir the advisor planned.
        assert_eq!(emergencies[0]["planned_actions"].as_array().unwrap().len(), 1);
        assert!(events(&config.alert_file, "emergency_recovery_failed").is_empty());
        assert_eq!(events(&config.metrics_file, "guardian_autofix").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_child_is_terminated_and_relaunched() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let script = Script::new(&[(3600, 0)]);
        let mut sup = Supervisor::new(config.clone(), script.clone(), FakeAdvisor::new(vec![], true))
            .unwrap()
            .with_health_probe(Arc::new(AlwaysDown));

        let started = Instant::now();
        assert_eq!(sup.run(&StopSignal::new()).await.unwrap(), SupervisorOutcome::CleanExit);
        assert_eq!(script.launches.load(Ordering::SeqCst), 2);
        let restarts = events(&config.metrics_file, "health_restart");
        assert_eq!(restarts.len(), 1);
        assert_eq!(restarts[0]["failures"], 3);
        let exits = events(&config.metrics_file, "process_exit");
        assert_eq!(exits[0]["exit_code"], 143);
        assert_eq!(exits[0]["uptime_seconds"], 30);
        // Uptime past min_uptime: base backoff only.
        assert_eq!(backoffs(&config), vec![3]);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn advisor_runs_periodically_while_child_is_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.guardian_interval = Duration::from_secs(15);
        let advisor = FakeAdvisor::new(vec![], true);
        let mut sup = Supervisor::new(config.clone(), Script::new(&[(40, 0)]), advisor.clone()).unwrap();

        assert_eq!(sup.run(&StopSignal::new()).await.unwrap(), SupervisorOutcome::CleanExit);
        assert_eq!(advisor.assessments.load(Ordering::SeqCst), 2);
        assert_eq!(events(&config.feedback_file, "guardian_periodic").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_marker_ends_supervision() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(config.stop_file.parent().unwrap()).unwrap();
        std::fs::write(&config.stop_file, "stale").unwrap();
        let stop = StopSignal::with_marker(&config.stop_file);
        let mut sup = Supervisor::new(config.clone(), Script::new(&[(3600, 1)]), FakeAdvisor::new(vec![], true))
            .unwrap();

        let marker = config.stop_file.clone();
        let pid_file = config.pid_file.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert!(pid_file.exists());
            std::fs::write(marker, "stop").unwrap();
        });

        assert_eq!(sup.run(&stop).await.unwrap(), SupervisorOutcome::Stopped);
        assert_eq!(sup.phase(), SupervisorPhase::Stopped);
        assert!(!config.pid_file.exists());
        assert!(events(&config.metrics_file, "process_exit").is_empty());
    }

    /// Assessment that takes far longer than any stop should wait for.
    struct StuckAdvisor;

    #[async_trait]
    impl RecoveryAdvisor for StuckAdvisor {
        async fn assess(&self) -> GuardianReport {
            tokio::time::sleep(Duration::from_secs(600)).await;
            FakeAdvisor::new(vec![], true).assess().await
        }

        async fn apply(&self, _actions: &[RecoveryAction]) -> Vec<ActionOutcome> {
            Vec::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_slow_guardian_pass() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let script = Script::new(&[(1, 1), (1, 1)]);
        let mut sup = Supervisor::new(config.clone(), script.clone(), Arc::new(StuckAdvisor)).unwrap();

        let stop = StopSignal::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.stop();
        });

        let started = Instant::now();
        assert_eq!(sup.run(&stop).await.unwrap(), SupervisorOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(60), "{:?}", started.elapsed());
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
        assert!(backoffs(&config).is_empty());
        assert!(events(&config.feedback_file, "guardian_report_on_exit").is_empty());
    }

    #[test]
    fn duplicate_actions_are_dropped_in_order() {
        let a = RecoveryAction::CreateDir { path: "logs".into() };
        let b = RecoveryAction::SetEnv { key: "HEALTH_PORT".into(), value: "8081".into() };
        assert_eq!(dedupe_actions(vec![a.clone(), b.clone(), a.clone()]), vec![a, b]);
    }
}
