//! SDK for tether plugins.
//!
//! A plugin is an executable with two modes:
//!
//! - `--describe` prints its tool specification as JSON;
//! - `--run --input-json <json> --context-json <json>` prints a JSON result.
//!
//! Side effects should go through [`Capabilities`], which are rebuilt from the
//! `TETHER_SANDBOX_*` variables the runner sets. A refused operation is
//! reported as `{"error", "capability_violation"}` with exit code 77.

use std::ffi::OsString;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};
use tether_cap::{
    CapabilityPolicy, CapabilityViolation, FsCap, NetCap, ProcCap, SandboxError, EXIT_CAPABILITY_VIOLATION,
};
use thiserror::Error;

pub mod probe;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Violation(CapabilityViolation),
    #[error("sandbox error: {0}")]
    Sandbox(SandboxError),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("{0}")]
    Failed(String),
}

impl From<SandboxError> for PluginError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Violation(v) => Self::Violation(v),
            other => Self::Sandbox(other),
        }
    }
}

/// Host context passed with every run.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunContext {
    pub workdir: Option<PathBuf>,
    pub default_timeout_seconds: Option<u64>,
    pub max_output_chars: Option<usize>,
}

#[derive(Debug, PartialEq)]
pub enum Invocation {
    Describe,
    Run { input: Value, context: Value },
}

/// Parse plugin arguments (without the program name).
pub fn parse_args<I>(args: I) -> Result<Invocation, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter().map(|a| a.to_string_lossy().into_owned());
    let mut run = false;
    let mut input = None;
    let mut context = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--describe" => return Ok(Invocation::Describe),
            "--run" => run = true,
            "--input-json" => input = Some(args.next().ok_or("--input-json needs a value")?),
            "--context-json" => context = Some(args.next().ok_or("--context-json needs a value")?),
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }
    if !run {
        return Err("expected --describe or --run".into());
    }
    let parse = |raw: Option<String>, flag: &str| -> Result<Value, String> {
        match raw {
            None => Ok(json!({})),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("{flag} is not valid JSON: {e}")),
        }
    };
    Ok(Invocation::Run {
        input: parse(input, "--input-json")?,
        context: parse(context, "--context-json")?,
    })
}

/// Mediated side effects for one run.
pub struct Capabilities {
    policy: CapabilityPolicy,
    fs: FsCap,
    net: NetCap,
    proc: ProcCap,
}

impl Capabilities {
    pub fn new(policy: CapabilityPolicy) -> Result<Self, SandboxError> {
        Ok(Self {
            fs: FsCap::open(&policy)?,
            net: NetCap::new(&policy),
            proc: ProcCap::new(&policy),
            policy,
        })
    }

    /// Policy from the environment the runner prepared.
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::new(CapabilityPolicy::from_env()?)
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    pub fn fs(&self) -> &FsCap {
        &self.fs
    }

    pub fn net(&self) -> &NetCap {
        &self.net
    }

    pub fn proc(&self) -> &ProcCap {
        &self.proc
    }
}

/// What a plugin process prints and exits with.
#[derive(Debug, PartialEq)]
pub struct Response {
    pub exit_code: i32,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { exit_code: 0, body }
    }

    pub fn from_error(err: PluginError) -> Self {
        match err {
            PluginError::Violation(violation) => Self {
                exit_code: EXIT_CAPABILITY_VIOLATION,
                body: json!({
                    "error": violation.to_string(),
                    "capability_violation": violation,
                }),
            },
            other => Self {
                exit_code: EXIT_FAILURE,
                body: json!({"error": other.to_string()}),
            },
        }
    }
}

/// Dispatch one invocation. `caps` is only built for runs.
pub fn respond<C, F>(invocation: Invocation, spec: &Value, caps: C, handler: F) -> Response
where
    C: FnOnce() -> Result<Capabilities, SandboxError>,
    F: FnOnce(Value, &RunContext, &Capabilities) -> Result<Value, PluginError>,
{
    let (input, context) = match invocation {
        Invocation::Describe => return Response::ok(spec.clone()),
        Invocation::Run { input, context } => (input, context),
    };
    let context: RunContext = serde_json::from_value(context).unwrap_or_default();
    let result = caps()
        .map_err(PluginError::from)
        .and_then(|caps| handler(input, &context, &caps));
    match result {
        Ok(body) => Response::ok(body),
        Err(err) => Response::from_error(err),
    }
}

/// Entry point for plugin binaries: parse argv, run, print, exit.
pub fn main<F>(spec: Value, handler: F) -> !
where
    F: FnOnce(Value, &RunContext, &Capabilities) -> Result<Value, PluginError>,
{
    let response = match parse_args(std::env::args_os().skip(1)) {
        Ok(invocation) => respond(invocation, &spec, Capabilities::from_env, handler),
        Err(usage) => {
            eprintln!("{usage}");
            std::process::exit(EXIT_USAGE);
        }
    };
    println!("{}", response.body);
    std::process::exit(response.exit_code);
}

/// String field from a run's input.
pub fn input_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, PluginError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PluginError::Input(format!("'{key}' must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    #[test]
    fn parses_both_modes() {
        assert_eq!(parse_args(args(&["--describe"])).unwrap(), Invocation::Describe);
        let parsed = parse_args(args(&[
            "--run",
            "--input-json",
            r#"{"text":"hi"}"#,
            "--context-json",
            r#"{"workdir":"/tmp"}"#,
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            Invocation::Run {
                input: json!({"text": "hi"}),
                context: json!({"workdir": "/tmp"}),
            }
        );
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["--run", "--input-json"])).is_err());
        assert!(parse_args(args(&["--run", "--input-json", "{"])).is_err());
    }

    #[test]
    fn violations_exit_77_with_details() {
        let spec = json!({"name": "t"});
        let dir = tempfile::tempdir().unwrap();
        let policy = CapabilityPolicy {
            allowed_root: dir.path().to_path_buf(),
            strict: true,
            allow_subprocess: false,
            allow_network: false,
        };
        let response = respond(
            Invocation::Run { input: json!({}), context: json!({}) },
            &spec,
            || Capabilities::new(policy),
            |_, _, caps| {
                caps.proc().command("ls")?;
                Ok(json!({}))
            },
        );
        assert_eq!(response.exit_code, 77);
        assert_eq!(response.body["capability_violation"]["action"], "subprocess");
        assert!(response.body["error"].as_str().unwrap().starts_with("blocked by sandbox policy"));
    }

    #[test]
    fn describe_skips_capabilities_and_errors_exit_1() {
        let spec = json!({"name": "t"});
        let response = respond(
            Invocation::Describe,
            &spec,
            || panic!("capabilities built for describe"),
            |_, _, _| Ok(json!({})),
        );
        assert_eq!(response, Response { exit_code: 0, body: spec.clone() });

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let response = respond(
            Invocation::Run { input: json!({}), context: json!({"max_output_chars": 10}) },
            &spec,
            || Capabilities::new(CapabilityPolicy::permissive(root)),
            |input, context, _| {
                assert_eq!(context.max_output_chars, Some(10));
                input_str(&input, "text").map(|t| json!(t))
            },
        );
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.body["error"], "invalid input: 'text' must be a string");
    }
}
