use std::ffi::OsStr;
use std::process::Command;

use crate::{CapabilityPolicy, CapabilityViolation, SandboxAction, SandboxError};

/// Subprocess capability. Denied by default under strict mode.
pub struct ProcCap {
    allowed: bool,
}

impl ProcCap {
    pub fn new(policy: &CapabilityPolicy) -> Self {
        Self {
            allowed: policy.permits_subprocess(),
        }
    }

    pub fn command(&self, program: impl AsRef<OsStr>) -> Result<Command, SandboxError> {
        let program = program.as_ref();
        if !self.allowed {
            return Err(
                CapabilityViolation::new(SandboxAction::Subprocess, program.to_string_lossy()).into(),
            );
        }
        Ok(Command::new(program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_policy_denies_spawn() {
        let mut policy = CapabilityPolicy::permissive("/srv");
        policy.strict = true;
        policy.allow_subprocess = false;
        let err = ProcCap::new(&policy).command("ls").unwrap_err();
        assert_eq!(
            err.to_string(),
            "blocked by sandbox policy: subprocess spawn not allowed (ls)"
        );
        assert!(ProcCap::new(&CapabilityPolicy::permissive("/srv")).command("ls").is_ok());
    }
}
