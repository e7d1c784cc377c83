use tether_cap::{CapabilityViolation, SandboxError};
use tether_sched::SchedError;
use tether_types::{ErrorKind, ToolOutcome};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Sandbox(#[from] CapabilityViolation),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Process(String),
    #[error("{0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Validation(_) => ErrorKind::Validation,
            ToolError::Sandbox(_) => ErrorKind::Sandbox,
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::Process(_) => ErrorKind::Process,
            ToolError::NotFound(_) => ErrorKind::NotFound,
            ToolError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn into_outcome(self) -> ToolOutcome {
        ToolOutcome::error(self.kind(), self.to_string())
    }
}

impl From<SandboxError> for ToolError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Violation(v) => ToolError::Sandbox(v),
            SandboxError::Io(e) => ToolError::Io(e),
            SandboxError::Env(msg) => ToolError::Validation(msg),
        }
    }
}

impl From<SchedError> for ToolError {
    fn from(err: SchedError) -> Self {
        match err {
            SchedError::Io(e) => ToolError::Io(e),
            other => ToolError::Validation(other.to_string()),
        }
    }
}
