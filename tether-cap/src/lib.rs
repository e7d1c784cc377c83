//! Capability policy for plugin processes.
//!
//! The policy is a plain value object. The runner encodes it into a child's
//! environment and the plugin SDK decodes it into mediated capabilities
//! ([`FsCap`], [`NetCap`], [`ProcCap`]). Enforcement is cooperative: a plugin
//! that bypasses these capabilities is not confined.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fs;
mod net;
mod proc;

pub use fs::{normalize, FsCap};
pub use net::{Connection, Connector, NetCap, TcpConnector};
pub use proc::ProcCap;

pub const ENV_ROOT: &str = "TETHER_SANDBOX_ROOT";
pub const ENV_STRICT: &str = "TETHER_SANDBOX_STRICT";
pub const ENV_ALLOW_NETWORK: &str = "TETHER_SANDBOX_ALLOW_NETWORK";
pub const ENV_ALLOW_SUBPROCESS: &str = "TETHER_SANDBOX_ALLOW_SUBPROCESS";

/// Exit code a plugin uses to report a capability violation.
pub const EXIT_CAPABILITY_VIOLATION: i32 = 77;

const PROXY_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];
// discard port; connections through it go nowhere
const DEAD_PROXY: &str = "http://127.0.0.1:9";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxAction {
    FileWrite,
    CreateDir,
    Rename,
    Remove,
    Chmod,
    Symlink,
    Subprocess,
    Network,
}

impl fmt::Display for SandboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxAction::FileWrite => "file write",
            SandboxAction::CreateDir => "create dir",
            SandboxAction::Rename => "rename",
            SandboxAction::Remove => "delete",
            SandboxAction::Chmod => "chmod",
            SandboxAction::Symlink => "symlink",
            SandboxAction::Subprocess => "subprocess",
            SandboxAction::Network => "network",
        };
        f.write_str(s)
    }
}

/// A mediated operation the active policy refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityViolation {
    pub action: SandboxAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl CapabilityViolation {
    pub fn new(action: SandboxAction, target: impl Into<String>) -> Self {
        Self {
            action,
            target: Some(target.into()),
        }
    }
}

impl fmt::Display for CapabilityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target.as_deref().unwrap_or("-");
        match self.action {
            SandboxAction::Subprocess => {
                write!(f, "blocked by sandbox policy: subprocess spawn not allowed ({target})")
            }
            SandboxAction::Network => {
                write!(f, "blocked by sandbox policy: network access not allowed ({target})")
            }
            action => write!(f, "blocked by sandbox policy: {action} outside workdir ({target})"),
        }
    }
}

impl std::error::Error for CapabilityViolation {}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Violation(#[from] CapabilityViolation),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid sandbox environment: {0}")]
    Env(String),
}

/// What one plugin process may do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    pub allowed_root: PathBuf,
    pub strict: bool,
    pub allow_subprocess: bool,
    pub allow_network: bool,
}

impl CapabilityPolicy {
    pub fn permissive(root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: root.into(),
            strict: false,
            allow_subprocess: true,
            allow_network: true,
        }
    }

    pub fn permits_subprocess(&self) -> bool {
        !self.strict || self.allow_subprocess
    }

    pub fn permits_network(&self) -> bool {
        !self.strict || self.allow_network
    }

    /// Environment variables that carry this policy into a child process.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (ENV_ROOT.to_string(), self.allowed_root.display().to_string()),
            (ENV_STRICT.to_string(), flag(self.strict)),
            (ENV_ALLOW_NETWORK.to_string(), flag(self.allow_network)),
            (ENV_ALLOW_SUBPROCESS.to_string(), flag(self.allow_subprocess)),
        ];
        if !self.permits_network() {
            for var in PROXY_VARS {
                vars.push((var.to_string(), DEAD_PROXY.to_string()));
            }
            vars.push(("NO_PROXY".to_string(), String::new()));
            vars.push(("no_proxy".to_string(), String::new()));
        }
        vars
    }

    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SandboxError> {
        let root = lookup(ENV_ROOT)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SandboxError::Env(format!("{ENV_ROOT} is not set")))?;
        let read_flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };
        Ok(Self {
            allowed_root: PathBuf::from(root),
            strict: read_flag(ENV_STRICT, true),
            allow_network: read_flag(ENV_ALLOW_NETWORK, false),
            allow_subprocess: read_flag(ENV_ALLOW_SUBPROCESS, false),
        })
    }
}

fn flag(v: bool) -> String {
    if v { "1" } else { "0" }.to_string()
}

/// Process-owned source of per-invocation policies.
#[derive(Clone, Debug)]
pub struct SandboxController {
    root: PathBuf,
    strict: bool,
}

impl SandboxController {
    pub fn new(root: impl AsRef<Path>, strict: bool) -> io::Result<Self> {
        Ok(Self {
            root: std::fs::canonicalize(root.as_ref())?,
            strict,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Policy for running a plugin that declared `network_access`.
    pub fn plugin_policy(&self, network_access: bool) -> CapabilityPolicy {
        CapabilityPolicy {
            allowed_root: self.root.clone(),
            strict: self.strict,
            allow_subprocess: !self.strict,
            allow_network: !self.strict || network_access,
        }
    }

    /// Filesystem capability for built-in tools running in this process.
    pub fn host_fs(&self) -> Result<FsCap, SandboxError> {
        FsCap::open(&self.plugin_policy(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn policy_survives_env_encoding() {
        let policy = CapabilityPolicy {
            allowed_root: PathBuf::from("/srv/agent"),
            strict: true,
            allow_subprocess: false,
            allow_network: true,
        };
        let vars: HashMap<String, String> = policy.env_vars().into_iter().collect();
        assert!(!vars.contains_key("HTTP_PROXY"));
        let decoded = CapabilityPolicy::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(decoded, policy);
    }

    #[test]
    fn denied_network_poisons_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SandboxController::new(dir.path(), true).unwrap();
        let vars: HashMap<String, String> =
            controller.plugin_policy(false).env_vars().into_iter().collect();
        assert_eq!(vars.get("HTTPS_PROXY").map(String::as_str), Some(DEAD_PROXY));
        assert_eq!(vars.get(ENV_ALLOW_NETWORK).map(String::as_str), Some("0"));
    }

    #[test]
    fn missing_root_is_an_env_error() {
        let err = CapabilityPolicy::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, SandboxError::Env(_)));
    }

    #[test]
    fn advisory_mode_permits_everything() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SandboxController::new(dir.path(), false).unwrap();
        let policy = controller.plugin_policy(false);
        assert!(policy.permits_network());
        assert!(policy.permits_subprocess());
    }

    #[test]
    fn violation_message_names_action() {
        let v = CapabilityViolation::new(SandboxAction::FileWrite, "/etc/passwd");
        assert_eq!(
            v.to_string(),
            "blocked by sandbox policy: file write outside workdir (/etc/passwd)"
        );
    }
}
