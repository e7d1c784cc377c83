use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::process::Command;

const SYSTEMD_UNIT: &str = "tether.service";
const LAUNCHD_LABEL: &str = "dev.tether.agent";

/// Systemd user unit running the watchdog in `workdir`.
pub fn systemd_unit(exe: &Path, workdir: &Path) -> String {
    let (exe, root) = (exe.display(), workdir.display());
    format!(
        "[Unit]
Description=tether automation agent
After=network.target

[Service]
Type=simple
WorkingDirectory={root}
ExecStart={exe} watchdog
Restart=always
RestartSec=10
Environment=\"AGENT_MODE=daemon\"
StandardOutput=append:{root}/logs/daemon_stdout.log
StandardError=append:{root}/logs/daemon_stderr.log

[Install]
WantedBy=default.target
"
    )
}

/// LaunchAgent plist running the watchdog in `workdir`.
pub fn launchd_plist(exe: &Path, workdir: &Path) -> String {
    let (exe, root) = (exe.display(), workdir.display());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
        <string>watchdog</string>
    </array>
    <key>WorkingDirectory</key>
    <string>{root}</string>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <dict>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>StandardOutPath</key>
    <string>{root}/logs/daemon_stdout.log</string>
    <key>StandardErrorPath</key>
    <string>{root}/logs/daemon_stderr.log</string>
    <key>EnvironmentVariables</key>
    <dict>
        <key>AGENT_MODE</key>
        <string>daemon</string>
    </dict>
</dict>
</plist>
"#
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Platform {
    Systemd,
    Launchd,
}

fn platform() -> Option<Platform> {
    if cfg!(target_os = "linux") {
        Some(Platform::Systemd)
    } else if cfg!(target_os = "macos") {
        Some(Platform::Launchd)
    } else {
        None
    }
}

fn service_path(platform: Platform) -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    let home = PathBuf::from(home);
    Ok(match platform {
        Platform::Systemd => home.join(".config/systemd/user").join(SYSTEMD_UNIT),
        Platform::Launchd => home.join("Library/LaunchAgents").join(format!("{LAUNCHD_LABEL}.plist")),
    })
}

async fn run(program: &str, args: &[&str], check: bool) -> anyhow::Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("running {program}"))?;
    if check && !status.success() {
        bail!("{program} {} failed with {status}", args.join(" "));
    }
    Ok(())
}

/// Write and load the service definition. Returns the process exit code.
pub async fn install(workdir: &Path, dry_run: bool) -> anyhow::Result<i32> {
    let Some(platform) = platform() else {
        eprintln!("service install is supported on Linux (systemd) and macOS (launchd) only");
        return Ok(1);
    };
    let exe = std::env::current_exe().context("locating the tether binary")?;
    let path = service_path(platform)?;
    let contents = match platform {
        Platform::Systemd => systemd_unit(&exe, workdir),
        Platform::Launchd => launchd_plist(&exe, workdir),
    };
    if dry_run {
        println!("[dry-run] would write {}:\n{contents}", path.display());
        return Ok(0);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(workdir.join("logs"))?;
    std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
    let path_str = path.display().to_string();
    match platform {
        Platform::Systemd => {
            run("systemctl", &["--user", "daemon-reload"], true).await?;
            run("systemctl", &["--user", "enable", SYSTEMD_UNIT], true).await?;
            run("systemctl", &["--user", "start", SYSTEMD_UNIT], true).await?;
        }
        Platform::Launchd => {
            run("launchctl", &["unload", &path_str], false).await?;
            run("launchctl", &["load", &path_str], true).await?;
        }
    }
    tracing::info!(path = %path_str, "service installed");
    println!("service installed: {path_str}");
    Ok(0)
}

pub async fn uninstall(dry_run: bool) -> anyhow::Result<i32> {
    let Some(platform) = platform() else {
        eprintln!("service uninstall is supported on Linux (systemd) and macOS (launchd) only");
        return Ok(1);
    };
    let path = service_path(platform)?;
    let path_str = path.display().to_string();
    if dry_run {
        println!("[dry-run] would stop the service and delete {path_str}");
        return Ok(0);
    }
    match platform {
        Platform::Systemd => {
            run("systemctl", &["--user", "stop", SYSTEMD_UNIT], false).await?;
            run("systemctl", &["--user", "disable", SYSTEMD_UNIT], false).await?;
        }
        Platform::Launchd if path.exists() => run("launchctl", &["unload", &path_str], false).await?,
        Platform::Launchd => {}
    }
    match std::fs::remove_file(&path) {
        Ok(()) => println!("service uninstalled: {path_str}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => println!("no service installed at {path_str}"),
        Err(e) => return Err(e).with_context(|| format!("removing {path_str}")),
    }
    Ok(0)
}
