//! Watchdog supervisor for the agent process.
//!
//! The supervisor only sees the agent from the outside: exit codes, the HTTP
//! health probe and the files under its workdir. Recovery decisions are
//! recorded in three journals (metrics, guardian feedback, alerts).

mod config;
mod diagnose;
mod health;
mod launcher;
mod supervisor;

use tether_journal::JournalError;
use thiserror::Error;

pub use config::{WatchdogConfig, DEFAULT_DIAG_BASE_URL, DEFAULT_DIAG_MODEL};
pub use diagnose::{known_actions, parse_response, Diagnoser, Diagnosis, HttpDiagnoser, DIAG_TIMEOUT, LOG_TAIL_LINES};
pub use health::{HealthProbe, HttpHealthProbe};
pub use launcher::{exit_code, ChildLauncher, ManagedChild, ProcessLauncher};
pub use supervisor::{
    dedupe_actions, RecoveryAdvisor, RecoveryRecords, Supervisor, SupervisorOutcome, SupervisorPhase,
    WatchdogState, LAUNCH_FAILED_CODE,
};

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("failed to launch agent: {0}")]
    Launch(String),
    #[error("diagnoser error: {0}")]
    Diagnoser(String),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
