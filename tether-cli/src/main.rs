mod repl;
mod service;
mod shutdown;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_core::{Agent, AgentConfig};
use tether_guardian::{format_report, Guardian, GuardianConfig};
use tether_journal::{tail, verify_journal};
use tether_policy::ApprovalHandler;
use tether_types::StopSignal;
use tether_watchdog::{HttpDiagnoser, HttpHealthProbe, ProcessLauncher, Supervisor, WatchdogConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether", about = "Personal automation agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive session; the scheduler runs in the background.
    Run,
    /// Scheduler and health server until stopped.
    Daemon,
    /// Keep the daemon alive, restarting and repairing as needed.
    Watchdog {
        /// Command to supervise instead of `tether daemon`.
        #[arg(last = true)]
        args: Vec<OsString>,
    },
    /// Audit the runtime environment.
    Guardian {
        #[arg(long)]
        fix: bool,
        #[arg(long)]
        json: bool,
    },
    Service {
        #[command(subcommand)]
        action: ServiceCommand,
    },
    Journal {
        #[command(subcommand)]
        action: JournalCommand,
        #[arg(long, global = true, default_value = "logs/journal.jsonl")]
        path: PathBuf,
    },
    /// Ask a running watchdog and daemon to stop.
    Stop,
}

#[derive(Subcommand)]
enum ServiceCommand {
    Install {
        #[arg(long)]
        dry_run: bool,
    },
    Uninstall {
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum JournalCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the process environment wins over it.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run => run().await?,
        Command::Daemon => daemon().await?,
        Command::Watchdog { args } => watchdog(args).await?,
        Command::Guardian { fix, json } => guardian_command(fix, json).await?,
        Command::Service { action } => {
            let workdir = AgentConfig::from_env().workdir;
            match action {
                ServiceCommand::Install { dry_run } => service::install(&workdir, dry_run).await?,
                ServiceCommand::Uninstall { dry_run } => service::uninstall(dry_run).await?,
            }
        }
        Command::Journal { action, path } => match action {
            JournalCommand::Tail { lines } => {
                for entry in tail(&path, lines)? {
                    println!("{}", serde_json::to_string(&entry)?);
                }
                0
            }
            JournalCommand::Verify => {
                let count = verify_journal(&path)?;
                println!("journal ok ({count} entries)");
                0
            }
        },
        Command::Stop => stop()?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn guardian(config: &AgentConfig, stop_marker: Option<PathBuf>) -> Guardian {
    let mut guardian_config = GuardianConfig::new(&config.workdir);
    guardian_config.health_port = config.health_enabled.then_some(config.health_port);
    guardian_config.required_commands = config.required_commands.clone();
    guardian_config.install_command = config.install_command.clone();
    guardian_config.stop_marker = stop_marker;
    let validated = config.clone();
    Guardian::new(guardian_config).with_validator(Arc::new(move || validated.validate()))
}

/// Config validation plus a guardian pass. `Some(code)` means do not start.
async fn preflight(config: &AgentConfig) -> Option<i32> {
    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("config error: {error}");
        }
        return Some(1);
    }
    let report = guardian(config, None).run(env_flag("GUARDIAN_AUTO_FIX")).await;
    if report.issue_count > 0 {
        eprintln!("{}", format_report(&report));
    }
    (report.critical_count > 0).then_some(1)
}

async fn run() -> anyhow::Result<i32> {
    let config = AgentConfig::from_env();
    if let Some(code) = preflight(&config).await {
        return Ok(code);
    }
    let input = repl::shared_stdin();
    let approval: Arc<dyn ApprovalHandler> = Arc::new(repl::StdinApproval::new(input.clone()));
    let agent = Arc::new(Agent::build(config, Some(approval))?);
    agent.load_plugins().await?;

    let stop = StopSignal::new();
    let background = {
        let (agent, stop) = (agent.clone(), stop.clone());
        tokio::spawn(async move { agent.serve(stop).await })
    };
    let result = repl::run(&agent, input).await;
    stop.stop();
    background.await.context("background tasks panicked")??;
    result.map(|()| 0)
}

async fn daemon() -> anyhow::Result<i32> {
    let config = AgentConfig::from_env();
    if let Some(code) = preflight(&config).await {
        return Ok(code);
    }
    let stop_file = WatchdogConfig::from_env(&config.workdir).stop_file;
    let agent = Agent::build(config, None)?;
    agent.load_plugins().await?;

    let stop = StopSignal::with_marker(stop_file);
    if stop.clear_marker()? {
        tracing::info!("removed stale stop marker");
    }
    shutdown::listen(stop.clone());
    tracing::info!("daemon started");
    agent.serve(stop).await?;
    tracing::info!("daemon stopped");
    Ok(0)
}

async fn watchdog(args: Vec<OsString>) -> anyhow::Result<i32> {
    let agent_config = AgentConfig::from_env();
    let config = WatchdogConfig::from_env(&agent_config.workdir);

    let launcher = match args.split_first() {
        Some((program, rest)) => {
            ProcessLauncher::daemon(program, &config.workdir, &config.agent_log).with_args(rest.to_vec())
        }
        None => {
            let exe = std::env::current_exe().context("locating the tether binary")?;
            ProcessLauncher::daemon(exe, &config.workdir, &config.agent_log)
        }
    };

    // The agent owns the health port while it runs; tier 2 covers it.
    let mut advisor_config = agent_config.clone();
    advisor_config.health_enabled = false;
    let advisor = Arc::new(guardian(&advisor_config, None));

    let mut supervisor = Supervisor::new(config.clone(), Arc::new(launcher), advisor)?;
    if let Some(url) = &config.health_url {
        supervisor = supervisor.with_health_probe(Arc::new(HttpHealthProbe::new(url.clone(), config.health_timeout)?));
    }
    if config.llm_diag {
        match HttpDiagnoser::from_env(&config.agent_log)? {
            Some(diagnoser) => supervisor = supervisor.with_diagnoser(Arc::new(diagnoser)),
            None => tracing::info!("ANTHROPIC_API_KEY not set; emergency diagnosis is heuristic only"),
        }
    }

    let stop = StopSignal::with_marker(&config.stop_file);
    shutdown::listen(stop.clone());
    let outcome = supervisor.run(&stop).await?;
    tracing::info!(?outcome, "watchdog finished");
    Ok(outcome.exit_code())
}

async fn guardian_command(fix: bool, json: bool) -> anyhow::Result<i32> {
    let config = AgentConfig::from_env();
    let stop_file = WatchdogConfig::from_env(&config.workdir).stop_file;
    let report = guardian(&config, Some(stop_file)).run(fix).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_report(&report));
    }
    Ok(if report.critical_count > 0 { 1 } else { 0 })
}

fn write_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, "stop\n")
}

fn stop() -> anyhow::Result<i32> {
    let workdir = AgentConfig::from_env().workdir;
    let marker = WatchdogConfig::from_env(workdir).stop_file;
    write_marker(&marker).with_context(|| format!("writing {}", marker.display()))?;
    println!("stop requested: {}", marker.display());
    Ok(0)
}
