use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::Value;
use tether_types::{truncate_text, JobExecutor, ToolRef};

use crate::job::{new_job_id, next_daily_run, parse_hhmm, JobStatus, ScheduleType, ScheduledJob};
use crate::SchedError;

const PREVIEW_CHARS: usize = 500;

/// Outcome of one job fired by [`JobStore::run_due`].
#[derive(Clone, Debug, Serialize)]
pub struct Execution {
    pub job_id: String,
    pub tool_name: String,
    pub ok: bool,
    pub output: String,
    pub next_run_at: DateTime<Utc>,
}

/// Authoritative job list, persisted as one JSON array.
pub struct JobStore {
    path: PathBuf,
    jobs: Mutex<Vec<ScheduledJob>>,
    drain: tokio::sync::Mutex<()>,
}

impl JobStore {
    /// Load the store. A missing file is an empty list; an unreadable one is set aside.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchedError> {
        let path = path.as_ref().to_path_buf();
        let jobs = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Vec::new(),
            Ok(text) => match serde_json::from_str::<Vec<ScheduledJob>>(&text) {
                Ok(jobs) => jobs,
                Err(err) => {
                    let aside = sibling(&path, &format!("corrupt-{}", Utc::now().timestamp()));
                    tracing::warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %err,
                        "job store unreadable, starting empty"
                    );
                    std::fs::rename(&path, &aside)?;
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(path = %path.display(), count = jobs.len(), "loaded scheduled jobs");
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
            drain: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Result<Vec<ScheduledJob>, SchedError> {
        Ok(self.lock()?.clone())
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledJob>, SchedError> {
        Ok(self.lock()?.iter().find(|j| j.id == id).cloned())
    }

    pub fn schedule_daily(
        &self,
        tool_ref: ToolRef,
        hhmm: &str,
        tool_input: Value,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedError> {
        let at = parse_hhmm(hhmm)?;
        if !tool_input.is_object() {
            return Err(SchedError::InvalidInput("tool_input must be a JSON object".into()));
        }
        let job = ScheduledJob {
            id: new_job_id(),
            schedule_type: ScheduleType::Daily,
            time: hhmm.trim().to_string(),
            tool_ref,
            tool_input,
            description: description.to_string(),
            enabled: true,
            created_at: now,
            next_run_at: next_daily_run(at, now, &Local),
            last_run_at: None,
            last_status: None,
            last_output_preview: None,
        };
        let mut jobs = self.lock()?;
        jobs.push(job.clone());
        self.persist(&jobs)?;
        tracing::info!(
            job_id = %job.id,
            tool = %job.tool_ref.tool_name(),
            time = %job.time,
            next_run_at = %job.next_run_at,
            "scheduled daily job"
        );
        Ok(job)
    }

    pub fn delete(&self, id: &str) -> Result<bool, SchedError> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.persist(&jobs)?;
        Ok(true)
    }

    /// Drop every job whose reference names one of `tool_names`.
    pub fn purge_tools(&self, tool_names: &[String]) -> Result<usize, SchedError> {
        if tool_names.is_empty() {
            return Ok(0);
        }
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|j| !tool_names.iter().any(|n| n == j.tool_ref.tool_name()));
        let removed = before - jobs.len();
        if removed > 0 {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    /// Fire every due job, then persist once for the whole drain.
    pub async fn run_due<E>(&self, now: DateTime<Utc>, executor: &E) -> Result<Vec<Execution>, SchedError>
    where
        E: JobExecutor + ?Sized,
    {
        let _drain = self.drain.lock().await;
        let due: Vec<ScheduledJob> = self.lock()?.iter().filter(|j| j.is_due(now)).cloned().collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut finished = Vec::with_capacity(due.len());
        for job in &due {
            let outcome = executor.execute(&job.tool_ref, job.tool_input.clone()).await;
            tracing::info!(
                job_id = %job.id,
                tool = %job.tool_ref.tool_name(),
                ok = !outcome.is_error,
                "scheduled job ran"
            );
            finished.push((job.id.clone(), outcome));
        }

        let mut jobs = self.lock()?;
        let mut executions = Vec::with_capacity(finished.len());
        for (id, outcome) in finished {
            // deleted while it was running
            let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                continue;
            };
            job.last_run_at = Some(now);
            job.last_status = Some(if outcome.is_error { JobStatus::Error } else { JobStatus::Ok });
            job.last_output_preview = Some(truncate_text(&outcome.text, PREVIEW_CHARS));
            match parse_hhmm(&job.time) {
                Ok(at) => job.next_run_at = next_daily_run(at, now, &Local),
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "disabling job with unreadable time");
                    job.enabled = false;
                }
            }
            executions.push(Execution {
                job_id: job.id.clone(),
                tool_name: job.tool_ref.tool_name().to_string(),
                ok: !outcome.is_error,
                output: outcome.text,
                next_run_at: job.next_run_at,
            });
        }
        self.persist(&jobs)?;
        Ok(executions)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<ScheduledJob>>, SchedError> {
        self.jobs.lock().map_err(|_| SchedError::Lock)
    }

    // Called with the list lock held so rewrites land in mutation order.
    fn persist(&self, jobs: &[ScheduledJob]) -> Result<(), SchedError> {
        let body = serde_json::to_string_pretty(jobs).map_err(|e| SchedError::Parse(e.to_string()))?;
        write_atomic(&self.path, body.as_bytes())
    }
}

/// Write `<path>.tmp`, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SchedError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sibling(path, "tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_types::ToolOutcome;

    struct CountingExecutor {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute(&self, tool_ref: &ToolRef, input: Value) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return ToolOutcome::error(tether_types::ErrorKind::Process, "boom");
            }
            ToolOutcome::ok(&json!({"tool": tool_ref.tool_name(), "input": input}))
        }
    }

    fn executor(fail: bool) -> CountingExecutor {
        CountingExecutor {
            calls: AtomicUsize::new(0),
            fail,
        }
    }

    fn builtin(name: &str) -> ToolRef {
        ToolRef::Builtin {
            tool_name: name.into(),
        }
    }

    fn hhmm_after(now: DateTime<Utc>, secs: i64) -> String {
        (now + chrono::Duration::seconds(secs))
            .with_timezone(&Local)
            .format("%H:%M")
            .to_string()
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(dir.path().join("schedules/jobs.json")).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JobStore::load(&path).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!path.exists());
        let aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("jobs.json.corrupt-"));
        assert!(aside);
    }

    #[test]
    fn schedule_validates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules/jobs.json");
        let store = JobStore::load(&path).unwrap();
        let now = Utc::now();
        assert!(matches!(
            store.schedule_daily(builtin("list_files"), "25:00", json!({}), "", now),
            Err(SchedError::InvalidTime(_))
        ));
        assert!(matches!(
            store.schedule_daily(builtin("list_files"), "08:00", json!([1]), "", now),
            Err(SchedError::InvalidInput(_))
        ));
        let job = store
            .schedule_daily(builtin("list_files"), "08:00", json!({"path": "."}), "morning", now)
            .unwrap();
        assert!(job.next_run_at > now);
        assert!(!dir.path().join("schedules/jobs.json.tmp").exists());

        let reloaded = JobStore::load(&path).unwrap();
        assert_eq!(reloaded.list().unwrap(), vec![job.clone()]);
        assert!(reloaded.delete(&job.id).unwrap());
        assert!(!reloaded.delete(&job.id).unwrap());
    }

    #[tokio::test]
    async fn two_drains_fire_twice_with_distinct_next_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(dir.path().join("jobs.json")).unwrap();
        let now = Utc::now();
        let hhmm = hhmm_after(now, 60);
        let first = store.schedule_daily(builtin("echo"), &hhmm, json!({}), "", now).unwrap();
        let second = store.schedule_daily(builtin("echo"), &hhmm, json!({}), "", now).unwrap();
        assert_ne!(first.id, second.id);
        store.delete(&second.id).unwrap();

        let exec = executor(false);
        let t1 = first.next_run_at + chrono::Duration::seconds(1);
        let run1 = store.run_due(t1, &exec).await.unwrap();
        assert_eq!(run1.len(), 1);
        // same instant again: nothing left to do
        assert!(store.run_due(t1, &exec).await.unwrap().is_empty());

        let t2 = run1[0].next_run_at + chrono::Duration::seconds(1);
        let run2 = store.run_due(t2, &exec).await.unwrap();
        assert_eq!(run2.len(), 1);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
        assert!(run1[0].next_run_at > first.next_run_at);
        assert!(run2[0].next_run_at > run1[0].next_run_at);
    }

    #[tokio::test]
    async fn failures_are_recorded_and_rescheduled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = JobStore::load(&path).unwrap();
        let now = Utc::now();
        let job = store
            .schedule_daily(builtin("flaky"), &hhmm_after(now, 60), json!({}), "", now)
            .unwrap();
        let later = job.next_run_at + chrono::Duration::seconds(5);
        let runs = store.run_due(later, &executor(true)).await.unwrap();
        assert!(!runs[0].ok);

        let stored = JobStore::load(&path).unwrap().get(&job.id).unwrap().unwrap();
        assert_eq!(stored.last_status, Some(JobStatus::Error));
        assert!(stored.last_output_preview.unwrap().contains("boom"));
        assert!(stored.next_run_at > later);
    }

    #[test]
    fn purge_removes_matching_tools_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(dir.path().join("jobs.json")).unwrap();
        let now = Utc::now();
        store.schedule_daily(builtin("a"), "01:00", json!({}), "", now).unwrap();
        store
            .schedule_daily(
                ToolRef::PluginFile {
                    file: "tools/b.py".into(),
                    tool_name: "b".into(),
                },
                "02:00",
                json!({}),
                "",
                now,
            )
            .unwrap();
        assert_eq!(store.purge_tools(&["b".to_string()]).unwrap(), 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
