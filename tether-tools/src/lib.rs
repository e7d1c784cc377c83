//! Tool registry and sandboxed execution.
//!
//! Plugins are executables living in one directory. Each answers
//! `--describe` with its specification and `--run --input-json <json>
//! --context-json <json>` with a JSON result on stdout. The [`Runner`] runs
//! built-ins in-process and plugins as children carrying a
//! [`tether_cap::CapabilityPolicy`] in their environment.

mod builtins;
mod error;
mod process;
mod registry;
mod runner;
pub mod select;
mod shell;

pub use builtins::{builtin_specs, ADMIN_TOOLS};
pub use error::ToolError;
pub use process::{clamp_timeout, run_process, ProcessOutput, ProcessSpec, MAX_TIMEOUT};
pub use registry::{
    is_eligible, parse_json_output, parse_spec, plugin_command, LoadedPlugin, PluginSummary,
    RegistryStatus, SnapshotDiff, ToolFileSnapshot, ToolRegistry, PROBE_TIMEOUT,
};
pub use runner::{Runner, RunnerConfig, DEFAULT_MAX_OUTPUT_CHARS};
pub use select::SelectionReport;
pub use shell::parse_command;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::{json, Value};
    use tether_cap::SandboxController;
    use tether_sched::{JobStatus, JobStore};
    use tether_types::{ErrorKind, ToolInvoker, ToolRef};

    fn runner(strict: bool) -> (tempfile::TempDir, Runner) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tools")).unwrap();
        let sandbox = SandboxController::new(dir.path(), strict).unwrap();
        let jobs = Arc::new(JobStore::load(dir.path().join("schedules/jobs.json")).unwrap());
        let mut config = RunnerConfig::new("tools");
        config.default_timeout = Duration::from_secs(10);
        (dir, Runner::new(sandbox, jobs, config).unwrap())
    }

    fn plugin(dir: &Path, file: &str, describe: &str, run: &str) {
        let body = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--describe\" ]; then\n  echo '{describe}'\n  exit 0\nfi\n{run}\n"
        );
        std::fs::write(dir.join("tools").join(file), body).unwrap();
    }

    fn body(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn plugin_result_is_wrapped() {
        let (dir, runner) = runner(true);
        plugin(
            dir.path(),
            "greet.sh",
            r#"{"name":"greet"}"#,
            r#"echo "starting up"; echo '{"greeting":"hi"}'"#,
        );
        let outcome = runner.invoke("greet", json!({})).await;
        assert!(!outcome.is_error, "{}", outcome.text);
        let value = body(&outcome.text);
        assert_eq!(value["tool"], "greet");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["result"]["greeting"], "hi");
    }

    #[tokio::test]
    async fn long_strings_are_truncated() {
        let (dir, mut runner) = runner(true);
        runner.config.max_output_chars = 100;
        plugin(
            dir.path(),
            "blob.sh",
            r#"{"name":"blob"}"#,
            r#"printf '{"blob":"%s"}\n' "$(head -c 300 /dev/zero | tr '\0' a)""#,
        );
        let outcome = runner.invoke("blob", json!({})).await;
        let blob = body(&outcome.text)["result"]["blob"].as_str().unwrap().to_string();
        assert!(blob.ends_with("...[truncated 200 chars]"), "{blob}");
    }

    #[tokio::test]
    async fn violation_exit_becomes_sandbox_error() {
        let (dir, runner) = runner(true);
        plugin(
            dir.path(),
            "escape.sh",
            r#"{"name":"escape"}"#,
            r#"echo '{"error":"blocked","capability_violation":{"action":"file_write","target":"/etc/x"}}'; exit 77"#,
        );
        let outcome = runner.invoke("escape", json!({})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Sandbox));
        assert!(outcome.text.contains("blocked by sandbox policy"));
    }

    #[tokio::test]
    async fn failing_plugin_is_a_process_error() {
        let (dir, runner) = runner(true);
        plugin(dir.path(), "bad.sh", r#"{"name":"bad"}"#, "echo broken >&2; exit 2");
        let outcome = runner.invoke("bad", json!({})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Process));
        assert!(outcome.text.contains("broken"));
    }

    #[tokio::test]
    async fn plugin_timeout_is_reported() {
        let (dir, runner) = runner(true);
        plugin(dir.path(), "slow.sh", r#"{"name":"slow"}"#, "sleep 30");
        let outcome = runner.invoke("slow", json!({"timeout_seconds": 1})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn bad_input_and_unknown_tools() {
        let (_dir, runner) = runner(true);
        let outcome = runner.invoke("list_files", json!(["not", "an", "object"])).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        let outcome = runner.invoke("does_not_exist", json!({})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn file_builtins_stay_in_workdir() {
        let (dir, runner) = runner(true);
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("x.txt");

        let outcome = runner
            .invoke("write_file", json!({"path": target.display().to_string(), "content": "x"}))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Sandbox));
        assert!(!target.exists());

        let outcome = runner
            .invoke("write_file", json!({"path": "notes/today.md", "content": "one\ntwo\nthree"}))
            .await;
        assert!(!outcome.is_error, "{}", outcome.text);
        assert!(dir.path().join("notes/today.md").exists());

        let outcome = runner
            .invoke("read_file", json!({"path": "notes/today.md", "start_line": 2}))
            .await;
        assert_eq!(body(&outcome.text)["content"], "2: two\n3: three");

        let outcome = runner.invoke("list_files", json!({})).await;
        let entries = body(&outcome.text)["entries"].clone();
        assert!(entries.as_array().unwrap().contains(&json!("notes/")));

        let outcome = runner.invoke("read_file", json!({"path": "../secret"})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn strict_mode_blocks_code_and_shell_escapes() {
        let (_dir, runner) = runner(true);
        let outcome = runner.invoke("run_code", json!({"code": "print(1)"})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        let outcome = runner.invoke("run_shell", json!({"command": "cat /etc/passwd"})).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        let outcome = runner.invoke("run_shell", json!({"command": "echo hello"})).await;
        assert_eq!(body(&outcome.text)["stdout"].as_str().unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn created_plugin_is_loaded_and_deletion_purges_jobs() {
        let (dir, runner) = runner(true);
        let outcome = runner
            .invoke("create_or_update_plugin_file", json!({"file_name": "x.sh", "content": "echo hi"}))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        assert!(outcome.text.contains("--describe"));

        let source = "#!/bin/sh\n# contract: --describe | --run --input-json --context-json\n\
            if [ \"$1\" = \"--describe\" ]; then\n  echo '{\"name\":\"daily_note\",\"version\":\"1.0.0\"}'\n  exit 0\nfi\n\
            echo '{\"written\":true}'\n";
        let outcome = runner
            .invoke("create_or_update_plugin_file", json!({"file_name": "daily_note.sh", "content": source}))
            .await;
        let report = body(&outcome.text);
        assert_eq!(report["ok"], true, "{report}");
        assert_eq!(report["loaded_tools"], json!(["daily_note"]));

        let outcome = runner
            .invoke("schedule_daily_tool", json!({"tool_name": "daily_note", "time": "07:30"}))
            .await;
        assert!(!outcome.is_error, "{}", outcome.text);
        assert_eq!(runner.jobs().list().unwrap().len(), 1);

        let outcome = runner
            .invoke("delete_plugin_file", json!({"file_name": "daily_note.sh", "purge_jobs": true}))
            .await;
        assert_eq!(body(&outcome.text)["purged_jobs"], 1);
        assert!(runner.jobs().list().unwrap().is_empty());
        assert!(!dir.path().join("tools/daily_note.sh").exists());
        assert!(runner.registry().plugin("daily_note").is_none());
    }

    #[tokio::test]
    async fn admin_tools_cannot_be_scheduled() {
        let (_dir, runner) = runner(true);
        for name in ["reload_plugins", "schedule_daily_tool", "delete_plugin_file"] {
            let outcome = runner
                .invoke("schedule_daily_tool", json!({"tool_name": name, "time": "08:00"}))
                .await;
            assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation), "{name}");
        }
        let outcome = runner
            .invoke("schedule_daily_tool", json!({"tool_name": "list_files", "time": "25:00"}))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn scheduled_plugin_job_runs_through_its_file() {
        let (dir, runner) = runner(true);
        plugin(dir.path(), "ping.sh", r#"{"name":"ping"}"#, r#"echo '{"pong":true}'"#);
        runner.registry().sync(false).await.unwrap();
        let job = runner
            .jobs()
            .schedule_daily(
                ToolRef::PluginFile { file: "tools/ping.sh".into(), tool_name: "ping".into() },
                "06:00",
                json!({}),
                "",
                Utc::now(),
            )
            .unwrap();

        let later = job.next_run_at + ChronoDuration::seconds(1);
        let executions = runner.jobs().run_due(later, &runner).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert!(executions[0].ok, "{}", executions[0].output);
        assert!(executions[0].output.contains("\"pong\":true"));
        let stored = runner.jobs().get(&job.id).unwrap().unwrap();
        assert_eq!(stored.last_status, Some(JobStatus::Ok));
        assert!(stored.next_run_at > later);
    }

    #[tokio::test]
    async fn renamed_plugin_tool_is_followed() {
        let (dir, runner) = runner(true);
        plugin(dir.path(), "ping.sh", r#"{"name":"ping_v2"}"#, r#"echo '{"pong":2}'"#);
        let name = runner
            .resolve_ref(&ToolRef::PluginFile { file: "ping.sh".into(), tool_name: "ping".into() })
            .await
            .unwrap();
        assert_eq!(name, "ping_v2");
        let err = runner
            .resolve_ref(&ToolRef::PluginFile { file: "gone.sh".into(), tool_name: "gone".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
