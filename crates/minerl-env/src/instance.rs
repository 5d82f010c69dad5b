//! Remote client instances and the providers that launch them.
//!
//! The environment owns exactly one `Box<dyn Instance>` and replaces it
//! wholesale when recovery decides to relaunch.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const BIND_EXCEPTION: &str = "java.net.BindException";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Build or start-up race in the client; worth another attempt.
    #[error("intermittent build failure: {0}")]
    IntermittentBuild(String),
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("launch failed: {0}")]
    Other(String),
}

/// Handle to one running remote client.
pub trait Instance: Send + Sync {
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn is_running(&mut self) -> bool;
    /// Stop the client. Best-effort; never fails.
    fn kill(&mut self);
    /// Client working directory, if known. Logs live under `run/logs`.
    fn minecraft_dir(&self) -> Option<&Path>;
}

/// Extension point for different launch strategies.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Instance>, LaunchError>;
}

/// An already-running client reachable at `host:port`.
///
/// Launching re-attaches; killing only forgets the client.
#[derive(Debug, Clone)]
pub struct AttachedInstance {
    host: String,
    port: u16,
    minecraft_dir: Option<PathBuf>,
    running: bool,
}

impl AttachedInstance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            minecraft_dir: None,
            running: true,
        }
    }

    pub fn with_minecraft_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.minecraft_dir = Some(dir.into());
        self
    }
}

impl Instance for AttachedInstance {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn kill(&mut self) {
        tracing::debug!(host = %self.host, port = self.port, "Detaching from client");
        self.running = false;
    }

    fn minecraft_dir(&self) -> Option<&Path> {
        self.minecraft_dir.as_deref()
    }
}

#[async_trait]
impl InstanceProvider for AttachedInstance {
    async fn launch(&self) -> Result<Box<dyn Instance>, LaunchError> {
        let mut instance = self.clone();
        instance.running = true;
        Ok(Box::new(instance))
    }
}

/// Spawns the client with a configured command and waits until its mission
/// port accepts connections.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    host: String,
    port: u16,
    minecraft_dir: Option<PathBuf>,
    ready_timeout: Duration,
    probe_interval: Duration,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            port,
            minecraft_dir: None,
            ready_timeout: Duration::from_secs(300),
            probe_interval: Duration::from_secs(1),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_minecraft_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.minecraft_dir = Some(dir.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    fn spawn(&self) -> Result<Child, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.minecraft_dir {
            command.current_dir(dir);
        }
        Ok(command.spawn()?)
    }
}

#[async_trait]
impl InstanceProvider for CommandLauncher {
    async fn launch(&self) -> Result<Box<dyn Instance>, LaunchError> {
        tracing::info!(
            program = %self.program.display(),
            port = self.port,
            "Launching Minecraft client"
        );
        let mut child = self.spawn()?;
        let deadline = tokio::time::Instant::now() + self.ready_timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(LaunchError::IntermittentBuild(format!(
                    "client exited with {} before accepting connections",
                    status
                )));
            }
            if TcpStream::connect((self.host.as_str(), self.port)).await.is_ok() {
                tracing::info!(port = self.port, pid = ?child.id(), "Minecraft client ready");
                return Ok(Box::new(CommandInstance {
                    child,
                    host: self.host.clone(),
                    port: self.port,
                    minecraft_dir: self.minecraft_dir.clone(),
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(LaunchError::Other(format!(
                    "client not accepting connections on port {} after {:?}",
                    self.port, self.ready_timeout
                )));
            }
            tokio::time::sleep(self.probe_interval).await;
        }
    }
}

/// Client process spawned by `CommandLauncher`.
pub struct CommandInstance {
    child: Child,
    host: String,
    port: u16,
    minecraft_dir: Option<PathBuf>,
}

impl Instance for CommandInstance {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        tracing::info!(pid = ?self.child.id(), port = self.port, "Killing Minecraft client");
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "Failed to kill Minecraft client");
        }
    }

    fn minecraft_dir(&self) -> Option<&Path> {
        self.minecraft_dir.as_deref()
    }
}

/// Path of the client's current log file.
pub fn log_path(minecraft_dir: &Path) -> PathBuf {
    minecraft_dir.join("run").join("logs").join("latest.log")
}

/// Last `n` lines of the client's log, or nothing when the instance has no
/// known directory or the log cannot be read.
pub fn recent_logs(instance: &dyn Instance, n: usize) -> Vec<String> {
    let Some(dir) = instance.minecraft_dir() else {
        tracing::warn!("Cannot read logs, as there is no launched instance directory");
        return Vec::new();
    };
    let path = log_path(dir);
    match std::fs::read_to_string(&path) {
        Ok(text) => tail(&text, n),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Log file unavailable");
            Vec::new()
        }
    }
}

fn tail(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}

/// Whether any of `lines` reports a port bind collision.
pub fn shows_bind_exception(lines: &[String]) -> bool {
    match lines.iter().find(|l| l.contains(BIND_EXCEPTION)) {
        Some(line) => {
            tracing::warn!(%line, "Detected BindException");
            true
        }
        None => false,
    }
}
