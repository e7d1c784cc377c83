use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_types::{StopSignal, ToolHost};
use thiserror::Error;

mod job;
mod pending;
mod store;

pub use job::{new_job_id, next_daily_run, parse_hhmm, JobStatus, ScheduleType, ScheduledJob};
pub use pending::{drain_pending, PendingReport, PendingResult, PendingTask, GENERIC_HANDLER_TOOL, MAX_LINES_PER_TICK};
pub use store::{write_atomic, Execution, JobStore};

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("invalid time '{0}', expected HH:MM between 00:00 and 23:59")]
    InvalidTime(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("job store lock poisoned")]
    Lock,
}

/// Liveness record emitted on every tick.
#[derive(Clone, Debug, Serialize)]
pub struct Heartbeat {
    pub event: &'static str,
    pub ts: DateTime<Utc>,
    pub pending_count: usize,
    pub pending_executed: usize,
    pub pending_ok: usize,
    pub pending_error: usize,
    pub jobs_executed: usize,
    pub jobs_ok: usize,
    pub jobs_error: usize,
    pub results: Vec<String>,
}

pub trait HeartbeatObserver: Send + Sync {
    fn on_heartbeat(&self, beat: &Heartbeat);
}

impl<F> HeartbeatObserver for F
where
    F: Fn(&Heartbeat) + Send + Sync,
{
    fn on_heartbeat(&self, beat: &Heartbeat) {
        self(beat)
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub pending_file: PathBuf,
}

/// Heartbeat loop: due jobs first, then the pending-task file.
pub struct Scheduler {
    jobs: Arc<JobStore>,
    host: Arc<dyn ToolHost>,
    config: SchedulerConfig,
    observers: Vec<Arc<dyn HeartbeatObserver>>,
}

impl Scheduler {
    pub fn new(jobs: Arc<JobStore>, host: Arc<dyn ToolHost>, mut config: SchedulerConfig) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        Self {
            jobs,
            host,
            config,
            observers: Vec::new(),
        }
    }

    pub fn observe(mut self, observer: Arc<dyn HeartbeatObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Heartbeat {
        let executions = match self.jobs.run_due(now, self.host.as_ref()).await {
            Ok(executions) => executions,
            Err(err) => {
                tracing::warn!(error = %err, "running due jobs failed");
                Vec::new()
            }
        };
        let pending = match drain_pending(&self.config.pending_file, self.host.as_ref()).await {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(error = %err, file = %self.config.pending_file.display(), "draining pending tasks failed");
                PendingReport::default()
            }
        };

        let jobs_ok = executions.iter().filter(|e| e.ok).count();
        let mut results: Vec<String> = executions
            .iter()
            .map(|e| format!("job {} ({}): {}", e.job_id, e.tool_name, if e.ok { "ok" } else { "error" }))
            .collect();
        results.extend(pending.results.iter().map(|r| {
            format!(
                "pending {}: {}",
                r.tool.as_deref().unwrap_or("-"),
                if r.ok { "ok" } else { "error" }
            )
        }));
        results.truncate(5);

        let beat = Heartbeat {
            event: "heartbeat",
            ts: now,
            pending_count: pending.pending_count,
            pending_executed: pending.results.len(),
            pending_ok: pending.ok_count(),
            pending_error: pending.error_count(),
            jobs_executed: executions.len(),
            jobs_ok,
            jobs_error: executions.len() - jobs_ok,
            results,
        };
        tracing::debug!(
            pending = beat.pending_count,
            jobs_executed = beat.jobs_executed,
            pending_executed = beat.pending_executed,
            "heartbeat"
        );
        for observer in &self.observers {
            observer.on_heartbeat(&beat);
        }
        beat
    }

    pub async fn run(self: Arc<Self>, stop: StopSignal) {
        tracing::info!(
            poll_seconds = self.config.poll_interval.as_secs(),
            pending_file = %self.config.pending_file.display(),
            "scheduler started"
        );
        while !stop.is_stopped() {
            self.tick(Utc::now()).await;
            if stop.sleep(self.config.poll_interval).await {
                break;
            }
        }
        tracing::info!("scheduler stopped");
    }
}
