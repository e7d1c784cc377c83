use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::WatchdogError;

/// Starts one instance of the supervised agent. `env` holds variables set by
/// recovery actions since the watchdog started.
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn launch(&self, env: &BTreeMap<String, String>) -> Result<Box<dyn ManagedChild>, WatchdogError>;
}

/// A running child. `wait` must be cancel safe: the supervisor races it
/// against timers and the stop signal.
#[async_trait]
pub trait ManagedChild: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves with the exit code once the child is gone.
    async fn wait(&mut self) -> Result<i32, WatchdogError>;

    /// Ask the child to stop, killing it if it outlives `grace`.
    async fn terminate(&mut self, grace: Duration) -> Result<i32, WatchdogError>;
}

/// Runs the agent binary with output appended to the agent log.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub workdir: PathBuf,
    pub log_file: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ProcessLauncher {
    /// `<program> daemon` with `AGENT_MODE=daemon` unless already set.
    pub fn daemon(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        let mut env = Vec::new();
        if std::env::var_os("AGENT_MODE").is_none() {
            env.push(("AGENT_MODE".to_string(), "daemon".to_string()));
        }
        Self {
            program: program.into(),
            args: vec!["daemon".into()],
            workdir: workdir.into(),
            log_file: log_file.into(),
            env,
        }
    }

    pub fn with_args(mut self, args: Vec<OsString>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn launch(&self, env: &BTreeMap<String, String>) -> Result<Box<dyn ManagedChild>, WatchdogError> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(&self.log_file)?;
        let err_log = log.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.workdir)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| {
            WatchdogError::Launch(format!("{}: {e}", self.program.display()))
        })?;
        tracing::info!(pid = ?child.id(), program = %self.program.display(), "agent launched");
        Ok(Box::new(ProcessChild { child }))
    }
}

struct ProcessChild {
    child: Child,
}

#[async_trait]
impl ManagedChild for ProcessChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<i32, WatchdogError> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<i32, WatchdogError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(exit_code(status));
        }
        send_term(&mut self.child)?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(exit_code(status?)),
            Err(_) => {
                tracing::warn!(pid = ?self.child.id(), grace_secs = grace.as_secs(), "agent ignored SIGTERM; killing");
                self.child.kill().await?;
                Ok(exit_code(self.child.wait().await?))
            }
        }
    }
}

#[cfg(unix)]
fn send_term(child: &mut Child) -> Result<(), WatchdogError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| WatchdogError::Io(std::io::Error::from(e))),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) -> Result<(), WatchdogError> {
    child.start_kill()?;
    Ok(())
}

/// Exit code, or `128 + signal` for a child killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
