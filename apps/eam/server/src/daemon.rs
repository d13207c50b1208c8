//! Background server management for `eam start` / `eam stop`.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::routes::{PidValidation, PONG};

pub const PID_FILE_NAME: &str = "pid";
pub const START_LOG_NAME: &str = "start.log";

const PING_ATTEMPTS: u32 = 25;
const PING_INTERVAL: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// The pid of the detached server, stored under the daemon directory.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(daemon_dir: &Path) -> Self {
        Self {
            path: daemon_dir.join(PID_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` if the file is missing or does not hold a pid.
    pub async fn read(&self) -> Option<u32> {
        let text = tokio::fs::read_to_string(&self.path).await.ok()?;
        text.trim().parse().ok().filter(|pid| *pid > 0)
    }

    pub async fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, pid.to_string())
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub async fn remove(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

/// HTTP base URL for a listen host; wildcard binds are reached over loopback.
pub fn base_url(host: &str, port: u16) -> String {
    let host = match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "[::1]",
        other => other,
    };
    format!("http://{host}:{port}")
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build http client")
}

pub async fn ping(client: &reqwest::Client, base: &str) -> bool {
    match client.get(format!("{base}/ping")).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => body == PONG,
            Err(_) => false,
        },
        Err(err) => {
            debug!(error = %err, "ping failed");
            false
        }
    }
}

/// Asks the server at `base` whether it is the process `pid`.
pub async fn validate_pid(client: &reqwest::Client, base: &str, pid: u32) -> bool {
    let resp = match client
        .post(format!("{base}/pid/validate"))
        .json(&serde_json::json!({ "pid": pid }))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            debug!(error = %err, pid, "pid validation request failed");
            return false;
        }
    };
    match resp.json::<PidValidation>().await {
        Ok(body) => body.validated,
        Err(_) => false,
    }
}

pub struct StartOptions {
    pub daemon_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub config: Option<PathBuf>,
}

/// Spawns `eam serve` detached and records its pid once it answers `/ping`.
pub async fn start(options: StartOptions) -> Result<u32> {
    let client = http_client()?;
    let base = base_url(&options.host, options.port);
    let pid_file = PidFile::new(&options.daemon_dir);

    if let Some(pid) = pid_file.read().await {
        if validate_pid(&client, &base, pid).await {
            bail!("eam is already running (pid {pid})");
        }
        warn!(pid, "stale pid file; replacing");
    }
    if ping(&client, &base).await {
        bail!("eam may be running at {base}, but not as the recorded pid");
    }

    tokio::fs::create_dir_all(&options.daemon_dir)
        .await
        .with_context(|| format!("failed to create {}", options.daemon_dir.display()))?;
    let log_path = options.daemon_dir.join(START_LOG_NAME);
    let log = std::fs::File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log_err = log.try_clone().context("failed to clone log handle")?;

    let exe = std::env::current_exe().context("failed to locate eam executable")?;
    let mut command = Command::new(exe);
    if let Some(config) = &options.config {
        command.arg("--config").arg(config);
    }
    command
        .arg("serve")
        .arg("--host")
        .arg(&options.host)
        .arg("--port")
        .arg(options.port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    let mut child = command.spawn().context("failed to spawn eam serve")?;
    let pid = child
        .id()
        .context("spawned server exited before reporting a pid")?;

    for _ in 0..PING_ATTEMPTS {
        if let Some(status) = child.try_wait().context("failed to poll eam serve")? {
            bail!(
                "eam serve exited early ({status}); see {}",
                log_path.display()
            );
        }
        if ping(&client, &base).await {
            pid_file.write(pid).await?;
            info!(pid, url = %base, "eam started");
            return Ok(pid);
        }
        tokio::time::sleep(PING_INTERVAL).await;
    }
    if let Err(err) = child.start_kill() {
        warn!(pid, error = %err, "failed to kill unresponsive eam serve");
    }
    bail!(
        "eam did not answer {base}/ping in time; see {}",
        log_path.display()
    )
}

/// Kills the recorded server process and removes the pid file.
pub async fn stop(daemon_dir: &Path) -> Result<u32> {
    let pid_file = PidFile::new(daemon_dir);
    let Some(pid) = pid_file.read().await else {
        bail!("no pid recorded in {}", pid_file.path().display());
    };
    let status = kill_command(pid)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("failed to run kill command")?;
    if !status.success() {
        warn!(pid, %status, "kill command failed; process may already be gone");
    }
    pid_file.remove().await?;
    info!(pid, "eam stopped");
    Ok(pid)
}

#[cfg(unix)]
fn kill_command(pid: u32) -> Command {
    let mut command = Command::new("kill");
    command.arg("-TERM").arg(pid.to_string());
    command
}

#[cfg(windows)]
fn kill_command(pid: u32) -> Command {
    let mut command = Command::new("taskkill");
    command.arg("/PID").arg(pid.to_string()).arg("/F");
    command
}
