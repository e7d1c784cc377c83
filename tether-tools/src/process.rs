use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::AbortHandle;

use crate::ToolError;

pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Clamp a caller-supplied timeout to `1..=300` seconds.
pub fn clamp_timeout(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(1, MAX_TIMEOUT.as_secs()))
}

#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a child to completion within `spec.timeout`.
///
/// The child gets its own process group on unix. When the deadline passes,
/// whether the child is still running or something it left behind still
/// holds its output open, the whole group is killed.
pub async fn run_process(spec: ProcessSpec) -> Result<ProcessOutput, ToolError> {
    let started_at = Instant::now();
    let deadline = tokio::time::Instant::now() + spec.timeout;
    let program = spec.program.to_string_lossy().to_string();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .spawn()
        .map_err(|err| ToolError::Process(format!("failed to start '{program}': {err}")))?;
    let pid = child.id();

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ToolError::Process(format!("stdout unavailable for '{program}'")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ToolError::Process(format!("stderr unavailable for '{program}'")))?;

    let stdout_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        stdout.read_to_end(&mut buffer).await.map(|_| buffer)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        stderr.read_to_end(&mut buffer).await.map(|_| buffer)
    });
    let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(result) => result?,
        Err(_) => {
            kill_group(pid);
            let _ = child.kill().await;
            readers.iter().for_each(AbortHandle::abort);
            tracing::warn!(
                program = %program,
                timeout_secs = spec.timeout.as_secs(),
                "child process timed out and was killed"
            );
            return Err(ToolError::Timeout(spec.timeout.as_secs()));
        }
    };

    let joined = tokio::time::timeout_at(deadline, async {
        let stdout = join_reader(stdout_task, &program).await?;
        let stderr = join_reader(stderr_task, &program).await?;
        Ok::<_, ToolError>((stdout, stderr))
    })
    .await;
    let (stdout, stderr) = match joined {
        Ok(result) => result?,
        Err(_) => {
            kill_group(pid);
            readers.iter().for_each(AbortHandle::abort);
            tracing::warn!(
                program = %program,
                exit_code = ?status.code(),
                timeout_secs = spec.timeout.as_secs(),
                "child exited but its output stayed open past the timeout; group killed"
            );
            return Err(ToolError::Timeout(spec.timeout.as_secs()));
        }
    };

    tracing::debug!(
        program = %program,
        exit_code = ?status.code(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "child process finished"
    );

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // ESRCH just means the group is already gone.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn join_reader(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    program: &str,
) -> Result<String, ToolError> {
    let bytes = task
        .await
        .map_err(|err| ToolError::Process(format!("output reader for '{program}' failed: {err}")))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env: vec![("GREETING".into(), "hi".into())],
            timeout,
        }
    }

    #[test]
    fn timeouts_are_clamped() {
        assert_eq!(clamp_timeout(0), Duration::from_secs(1));
        assert_eq!(clamp_timeout(30), Duration::from_secs(30));
        assert_eq!(clamp_timeout(10_000), MAX_TIMEOUT);
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run_process(sh("echo $GREETING; echo oops >&2; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn slow_child_is_killed() {
        let started = Instant::now();
        let err = run_process(sh("sleep 30", Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(1)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_holder_does_not_outlive_timeout() {
        let run = run_process(sh("sleep 30 & echo hi", Duration::from_secs(2)));
        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("run_process hung past its own timeout");
        assert!(matches!(result, Err(ToolError::Timeout(2))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let mark = dir.path().join("late.txt");
        let mut spec = sh("(sleep 3; touch \"$MARK\") & sleep 30", Duration::from_secs(1));
        spec.env.push(("MARK".into(), mark.display().to_string()));
        let err = run_process(spec).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(1)));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!mark.exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_process_error() {
        let mut spec = sh("", Duration::from_secs(1));
        spec.program = "definitely-not-a-real-binary-tether".into();
        let err = run_process(spec).await.unwrap_err();
        assert!(matches!(err, ToolError::Process(_)));
    }
}
