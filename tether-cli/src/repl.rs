use std::io::IsTerminal;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_core::Agent;
use tether_policy::{parse_permissions_json, ApprovalHandler, ApprovalRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Stdin lines shared by the REPL and the approval prompt.
pub type SharedStdin = Arc<Mutex<Lines<BufReader<Stdin>>>>;

pub fn shared_stdin() -> SharedStdin {
    Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
}

async fn prompt(text: &str) {
    let mut out = tokio::io::stdout();
    let _ = out.write_all(text.as_bytes()).await;
    let _ = out.flush().await;
}

/// Asks on the terminal. Scheduled calls and non-interactive stdin are refused.
pub struct StdinApproval {
    input: SharedStdin,
}

impl StdinApproval {
    pub fn new(input: SharedStdin) -> Self {
        Self { input }
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl ApprovalHandler for StdinApproval {
    async fn approve(&self, request: &ApprovalRequest) -> bool {
        if request.scheduled || !std::io::stdin().is_terminal() {
            return false;
        }
        let mut input = self.input.lock().await;
        prompt(&format!(
            "\nApprove tool '{}' with input {}? [y/N] ",
            request.tool, request.input
        ))
        .await;
        match input.next_line().await {
            Ok(Some(answer)) => is_yes(&answer),
            _ => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    Empty,
    Tools,
    Select(String),
    Permissions(Option<String>),
    DryRun(Option<bool>),
    Jobs,
    Quit,
    Unknown(String),
    Submit(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        if !line.starts_with('/') {
            return Self::Submit(line.to_string());
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head {
            "/tools" => Self::Tools,
            "/select" if !rest.is_empty() => Self::Select(rest.to_string()),
            "/permissions" => Self::Permissions((!rest.is_empty()).then(|| rest.to_string())),
            "/dry-run" => match rest {
                "" => Self::DryRun(None),
                "on" => Self::DryRun(Some(true)),
                "off" => Self::DryRun(Some(false)),
                _ => Self::Unknown(line.to_string()),
            },
            "/jobs" => Self::Jobs,
            "/quit" | "/exit" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

const HELP: &str = "commands: /tools, /select <intent>, /permissions [json], /dry-run on|off, /jobs, /quit\n\
                    anything else is run as a task: tool|{json}, {\"tool\":..,\"input\":..} or free text";

/// Read lines until `/quit` or end of input.
pub async fn run(agent: &Agent, input: SharedStdin) -> anyhow::Result<()> {
    println!("tether interactive mode. {HELP}");
    loop {
        prompt("> ").await;
        let line = input.lock().await.next_line().await?;
        let Some(line) = line else {
            break;
        };
        match ReplCommand::parse(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Tools => {
                let registry = agent.runner().registry();
                if let Err(e) = registry.sync(false).await {
                    tracing::warn!(error = %e, "plugin sync failed");
                }
                for spec in registry.describe() {
                    println!("{:<24} {}", spec.name, spec.description);
                }
                for (file, error) in registry.status().load_errors {
                    println!("! {file}: {error}");
                }
            }
            ReplCommand::Select(intent) => {
                let registry = agent.runner().registry();
                if let Err(e) = registry.sync(false).await {
                    tracing::warn!(error = %e, "plugin sync failed");
                }
                let (_, report) = registry.select_for_intent(&intent, true);
                println!("{}", pretty(&json!(report)));
            }
            ReplCommand::Permissions(None) => {
                println!("{}", pretty(&json!(agent.gate().permissions().permissions())));
            }
            ReplCommand::Permissions(Some(raw)) => match parse_permissions_json(&raw) {
                Ok(overrides) => {
                    let merged = (*agent.gate().permissions()).clone().merged(overrides);
                    println!("{}", pretty(&json!(merged.permissions())));
                    agent.gate().replace_permissions(merged);
                }
                Err(e) => println!("error: {e}"),
            },
            ReplCommand::DryRun(Some(enabled)) => {
                agent.gate().set_dry_run(enabled);
                println!("dry-run {}", if enabled { "on" } else { "off" });
            }
            ReplCommand::DryRun(None) => {
                println!("dry-run {}", if agent.gate().dry_run() { "on" } else { "off" });
            }
            ReplCommand::Jobs => match agent.jobs().list() {
                Ok(jobs) if jobs.is_empty() => println!("no scheduled jobs"),
                Ok(jobs) => println!("{}", pretty(&json!(jobs))),
                Err(e) => println!("error: {e}"),
            },
            ReplCommand::Unknown(line) => println!("unknown command '{line}'. {HELP}"),
            ReplCommand::Submit(line) => {
                let outcome = agent.submit_line(&line).await;
                match serde_json::from_str::<Value>(&outcome.text) {
                    Ok(value) => println!("{}", pretty(&value)),
                    Err(_) => println!("{}", outcome.text),
                }
            }
        }
    }
    Ok(())
}
