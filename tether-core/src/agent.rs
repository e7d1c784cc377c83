use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tether_cap::SandboxController;
use tether_http::HealthState;
use tether_journal::Journal;
use tether_policy::{ApprovalHandler, PolicyGate};
use tether_sched::{Heartbeat, JobStore, PendingTask, Scheduler, SchedulerConfig, GENERIC_HANDLER_TOOL};
use tether_tools::{Runner, RunnerConfig};
use tether_types::{ErrorKind, JobExecutor, StopSignal, ToolInvoker, ToolOutcome};

use crate::config::AgentConfig;
use crate::queue::RequestQueue;

/// The wired agent: runner behind the policy gate, job store, journal and
/// the single-flight request lane.
pub struct Agent {
    config: AgentConfig,
    runner: Arc<Runner>,
    gate: Arc<PolicyGate>,
    jobs: Arc<JobStore>,
    journal: Arc<Journal>,
    queue: RequestQueue,
    health: HealthState,
}

impl Agent {
    pub fn build(config: AgentConfig, approval: Option<Arc<dyn ApprovalHandler>>) -> anyhow::Result<Self> {
        let sandbox = SandboxController::new(&config.workdir, config.strict_workdir)
            .with_context(|| format!("opening workdir {}", config.workdir.display()))?;
        let jobs = Arc::new(
            JobStore::load(&config.schedule_file)
                .with_context(|| format!("loading jobs from {}", config.schedule_file.display()))?,
        );
        let journal = Arc::new(
            Journal::open(&config.journal_file)
                .with_context(|| format!("opening journal {}", config.journal_file.display()))?,
        );

        let runner_config = RunnerConfig {
            plugin_dir: config.plugin_dir.clone(),
            default_timeout: config.tool_timeout,
            max_output_chars: config.max_output_chars,
            code_interpreter: config.code_interpreter.clone(),
        };
        let runner = Arc::new(Runner::new(sandbox, jobs.clone(), runner_config)?);

        let mut gate = PolicyGate::new(runner.clone(), config.permissions()?)
            .with_journal(journal.clone())
            .with_dry_run(config.dry_run);
        if let Some(handler) = approval {
            gate = gate.with_approval(handler);
        }
        let gate = Arc::new(gate);
        let executor: Arc<dyn JobExecutor> = gate.clone();
        runner.route_jobs_through(Arc::downgrade(&executor));

        let health = HealthState::new(config.agent_mode().to_string());
        Ok(Self {
            config,
            runner,
            gate,
            jobs,
            journal,
            queue: RequestQueue::new(),
            health,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn gate(&self) -> &Arc<PolicyGate> {
        &self.gate
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Load plugins once and log anything that failed to load.
    pub async fn load_plugins(&self) -> anyhow::Result<()> {
        let registry = self.runner.registry();
        registry.sync(true).await?;
        let status = registry.status();
        tracing::info!(
            plugin_dir = %status.plugin_dir.display(),
            loaded = status.loaded.len(),
            errors = status.load_errors.len(),
            "plugins loaded"
        );
        for (file, error) in &status.load_errors {
            tracing::warn!(file = %file, error = %error, "plugin failed to load");
        }
        Ok(())
    }

    /// Run one tool through the gate, waiting for the request lane.
    pub async fn invoke(&self, tool: &str, input: Value) -> ToolOutcome {
        self.queue.run(self.gate.invoke(tool, input)).await
    }

    /// Parse a line the way the pending-task file is parsed and run it.
    pub async fn submit_line(&self, line: &str) -> ToolOutcome {
        match PendingTask::parse(line) {
            PendingTask::Call { tool, input } => self.invoke(&tool, input).await,
            PendingTask::FreeText(text) => self.invoke(GENERIC_HANDLER_TOOL, json!({ "task": text })).await,
            PendingTask::Malformed { reason } => ToolOutcome::error(ErrorKind::Validation, reason),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        let journal = self.journal.clone();
        let config = SchedulerConfig {
            poll_interval: self.config.scheduler_poll,
            pending_file: self.config.pending_file.clone(),
        };
        Scheduler::new(self.jobs.clone(), self.gate.clone(), config).observe(Arc::new(
            move |beat: &Heartbeat| {
                if beat.jobs_executed + beat.pending_executed == 0 {
                    tracing::trace!("idle heartbeat");
                }
                let payload = serde_json::to_value(beat).unwrap_or(Value::Null);
                if let Err(e) = journal.append("heartbeat", payload) {
                    tracing::warn!(error = %e, "failed to journal heartbeat");
                }
            },
        ))
    }

    /// Start the scheduler and health server (when enabled) and return
    /// once `stop` fires and both have wound down.
    pub async fn serve(&self, stop: StopSignal) -> anyhow::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        if self.config.scheduler_enabled {
            let scheduler = Arc::new(self.scheduler());
            tasks.spawn(scheduler.run(stop.clone()));
        } else {
            tracing::info!("scheduler disabled");
        }
        if self.config.health_enabled {
            let (port, state, stop) = (self.config.health_port, self.health.clone(), stop.clone());
            tasks.spawn(async move {
                if let Err(e) = tether_http::serve(port, state, stop).await {
                    tracing::error!(port, error = %e, "health server failed");
                }
            });
        }

        stop.stopped().await;
        tracing::info!("stop requested; shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn agent(dir: &Path, extra: &[(&str, &str)]) -> Agent {
        std::fs::create_dir_all(dir.join("tools")).unwrap();
        let mut env: HashMap<String, String> =
            extra.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        env.insert("TOOL_WORKDIR".into(), dir.display().to_string());
        Agent::build(AgentConfig::from_lookup(|k| env.get(k).cloned()), None).unwrap()
    }

    #[tokio::test]
    async fn lines_run_through_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path(), &[("TOOL_PERMISSIONS_JSON", r#"{"write_file":"deny"}"#)]);

        let outcome = agent
            .submit_line(r#"{"tool":"write_file","input":{"path":"a.txt","content":"x"}}"#)
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Policy));
        assert!(!dir.path().join("a.txt").exists());

        let outcome = agent.submit_line("list_files|{}").await;
        assert!(!outcome.is_error, "{}", outcome.text);

        let outcome = agent.submit_line("{not json").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));

        let outcome = agent.submit_line(r#"run_shell|{"command":"echo hi"}"#).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Policy));

        let decisions = tether_journal::read_entries(agent.journal().path()).unwrap();
        assert!(decisions.iter().all(|e| e.kind == "policy_decision"));
        assert!(decisions.len() >= 3);
    }

    #[tokio::test]
    async fn dry_run_echoes_instead_of_running() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path(), &[("DRY_RUN", "true")]);
        let outcome = agent
            .invoke("write_file", json!({"path": "b.txt", "content": "x"}))
            .await;
        let value: Value = serde_json::from_str(&outcome.text).unwrap();
        assert_eq!(value["dry_run"], true);
        assert!(!dir.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn serve_returns_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path(), &[("HEALTH_SERVER_ENABLED", "false")]);
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        std::fs::write(dir.path().join("tasks/pending.txt"), "list_files|{}\n").unwrap();

        let stop = StopSignal::new();
        let s = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            s.stop();
        });
        tokio::time::timeout(std::time::Duration::from_secs(10), agent.serve(stop))
            .await
            .unwrap()
            .unwrap();
        // The first tick drained the pending file.
        assert!(!dir.path().join("tasks/pending.txt").exists());
        let kinds: Vec<String> = tether_journal::read_entries(agent.journal().path())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"heartbeat".to_string()), "{kinds:?}");
    }

    #[tokio::test]
    async fn idle_ticks_still_leave_a_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path(), &[("HEALTH_SERVER_ENABLED", "false")]);
        assert!(!dir.path().join("tasks/pending.txt").exists());

        let beat = agent.scheduler().tick(chrono::Utc::now()).await;
        assert_eq!(beat.jobs_executed + beat.pending_executed, 0);

        let beats: Vec<Value> = tether_journal::read_entries(agent.journal().path())
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == "heartbeat")
            .map(|e| e.payload)
            .collect();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0]["pending_count"], 0);
        assert_eq!(beats[0]["jobs_executed"], 0);
    }
}
