use std::path::Path;

use tether_cap::{FsCap, SandboxAction};

use crate::ToolError;

const BLOCKED_TOKENS: [&str; 9] = [
    "rm -rf", "sudo ", "shutdown", "reboot", "mkfs", ":(){", "dd if=", "chroot", "mount ",
];
const METACHARACTERS: [&str; 8] = [";", "|", "&", ">", "<", "`", "$(", "\n"];
const INTERPRETERS: [&str; 11] = [
    "python", "python3", "bash", "sh", "zsh", "node", "perl", "ruby", "php", "pwsh", "powershell",
];
const NETWORK_CLIENTS: [&str; 11] = [
    "curl", "wget", "ftp", "sftp", "ssh", "scp", "telnet", "nc", "ncat", "ping", "traceroute",
];
// Programs that run another program named later on their command line.
const WRAPPERS: [&str; 8] = ["env", "nice", "nohup", "timeout", "xargs", "stdbuf", "time", "command"];

/// Split a command line into argv, applying the denylist and, in strict mode,
/// the workdir-only rules. No shell is ever involved in running the result.
pub fn parse_command(command: &str, strict: bool, fs: &FsCap) -> Result<Vec<String>, ToolError> {
    if command.trim().is_empty() {
        return Err(ToolError::Validation("command is required".into()));
    }
    let lowered = command.to_lowercase();
    if let Some(token) = BLOCKED_TOKENS.iter().find(|t| lowered.contains(*t)) {
        return Err(ToolError::Validation(format!(
            "command blocked by security policy (contains '{}')",
            token.trim()
        )));
    }
    if strict {
        if let Some(meta) = METACHARACTERS.iter().find(|m| command.contains(*m)) {
            return Err(ToolError::Validation(format!(
                "shell metacharacter {meta:?} is not allowed in strict mode"
            )));
        }
    }
    let args = shlex::split(command)
        .ok_or_else(|| ToolError::Validation("malformed command (unbalanced quotes)".into()))?;
    if args.is_empty() {
        return Err(ToolError::Validation("command is required".into()));
    }
    if strict {
        check_strict_args(&args, fs)?;
    }
    Ok(args)
}

fn check_strict_args(args: &[String], fs: &FsCap) -> Result<(), ToolError> {
    let program = &args[0];
    if program.starts_with('/') {
        return Err(ToolError::Validation(
            "absolute executable paths are not allowed in strict mode".into(),
        ));
    }
    for exec_name in launched_programs(args) {
        if INTERPRETERS.contains(&exec_name.as_str()) {
            return Err(ToolError::Validation(format!(
                "interpreter '{exec_name}' is blocked in strict mode"
            )));
        }
        if NETWORK_CLIENTS.contains(&exec_name.as_str()) {
            return Err(ToolError::Validation(format!(
                "network command '{exec_name}' is blocked in strict mode"
            )));
        }
    }

    for arg in &args[1..] {
        let arg = arg.trim();
        if arg.is_empty() || arg.starts_with('-') {
            continue;
        }
        if arg.starts_with('~') || arg.starts_with('$') {
            return Err(ToolError::Validation(format!(
                "home or variable expansion '{arg}' is not allowed in strict mode"
            )));
        }
        if arg.starts_with('/') {
            return Err(ToolError::Validation(format!(
                "absolute path '{arg}' is not allowed in strict mode"
            )));
        }
        if Path::new(arg).components().any(|c| c.as_os_str() == "..") {
            return Err(ToolError::Validation(format!(
                "parent traversal in '{arg}' is not allowed in strict mode"
            )));
        }
        if arg.contains('/') || arg.starts_with('.') {
            fs.check(SandboxAction::FileWrite, arg).map_err(|_| {
                ToolError::Validation(format!("path '{arg}' resolves outside the workdir"))
            })?;
        }
    }
    Ok(())
}

fn exec_name(arg: &str) -> String {
    Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// argv[0] plus whatever a chain of wrappers (`env`, `nice -n 5`, ...) would
/// go on to execute. Flags, `VAR=value` and numeric operands are skipped.
fn launched_programs(args: &[String]) -> Vec<String> {
    let mut names = vec![exec_name(&args[0])];
    let mut rest = args[1..].iter();
    while names.last().is_some_and(|n| WRAPPERS.contains(&n.as_str())) {
        let next = rest.find(|arg| {
            !(arg.starts_with('-')
                || arg.contains('=')
                || arg.trim_end_matches(['s', 'm', 'h', 'd']).parse::<f64>().is_ok())
        });
        match next {
            Some(arg) => names.push(exec_name(arg)),
            None => break,
        }
    }
    names
}
