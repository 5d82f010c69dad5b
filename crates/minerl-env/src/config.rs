//! Environment configuration.
//!
//! Defaults match the Malmo client's expectations; each timing knob can be
//! overridden with a `MINERL_*` environment variable or a `with_*` builder.

use std::path::PathBuf;
use std::time::Duration;

/// Default environment id substituted for `$(ENV_NAME)` in mission templates.
pub const DEFAULT_ENV_NAME: &str = "MineRLCustomEnv";

/// Upper bound on busy replies: mission-init attempts, and seconds spent
/// waiting for a first frame or an integrated server port.
pub const MAX_WAIT: u32 = 80;

/// Read timeout applied to every receive on the mission socket.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(240);

#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Bound on every socket receive (and connect).
    pub socket_timeout: Duration,
    /// Mission-init attempts before the handshake counts as timed out.
    pub init_attempts: u32,
    /// Delay between mission-init attempts that were not acknowledged.
    pub init_retry_delay: Duration,
    /// Total time allowed for a non-empty first frame (and for `find_server`).
    pub first_frame_timeout: Duration,
    /// Sleep between peek and quit polls.
    pub poll_interval: Duration,
    /// Start-up attempts made by one `reset()` call.
    pub reset_attempts: u32,
    /// Pause between start-up attempts.
    pub reset_backoff: Duration,
    /// Launch attempts before giving up on a relaunch.
    pub launch_attempts: u32,
    /// Pause between launch attempts.
    pub launch_backoff: Duration,
    /// Step option code embedded in `<Step{opt}>`.
    pub step_option: u8,
    /// Whether the remote ticks only when stepped.
    pub synchronous: bool,
    /// Remote log lines echoed with every error diagnostic.
    pub log_tail_lines: usize,
    /// Remote log lines scanned for a bind collision.
    pub bind_scan_lines: usize,
    /// Substituted for `$(ENV_NAME)`.
    pub env_name: String,
    /// Substituted for `$(MISSIONS_DIR)`.
    pub missions_dir: Option<PathBuf>,
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|s| s.parse::<u32>().ok())
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            socket_timeout: env_secs("MINERL_SOCKET_TIMEOUT").unwrap_or(SOCKET_TIMEOUT),
            init_attempts: env_u32("MINERL_MAX_WAIT").unwrap_or(MAX_WAIT),
            init_retry_delay: Duration::from_secs(1),
            first_frame_timeout: Duration::from_secs(
                env_u32("MINERL_MAX_WAIT").unwrap_or(MAX_WAIT) as u64,
            ),
            poll_interval: Duration::from_millis(100),
            reset_attempts: env_u32("MINERL_RESET_ATTEMPTS").unwrap_or(3).max(1),
            reset_backoff: env_secs("MINERL_RESET_BACKOFF").unwrap_or(Duration::from_secs(1)),
            launch_attempts: 3,
            launch_backoff: Duration::from_secs(3),
            step_option: 0,
            synchronous: true,
            log_tail_lines: 5,
            bind_scan_lines: 10,
            env_name: std::env::var("MINERL_ENV_NAME")
                .unwrap_or_else(|_| DEFAULT_ENV_NAME.to_string()),
            missions_dir: std::env::var_os("MINERL_MISSIONS_DIR").map(PathBuf::from),
        }
    }
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_init_attempts(mut self, attempts: u32) -> Self {
        self.init_attempts = attempts;
        self
    }

    pub fn with_init_retry_delay(mut self, delay: Duration) -> Self {
        self.init_retry_delay = delay;
        self
    }

    pub fn with_first_frame_timeout(mut self, timeout: Duration) -> Self {
        self.first_frame_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reset_attempts(mut self, attempts: u32) -> Self {
        self.reset_attempts = attempts.max(1);
        self
    }

    pub fn with_reset_backoff(mut self, backoff: Duration) -> Self {
        self.reset_backoff = backoff;
        self
    }

    pub fn with_launch_attempts(mut self, attempts: u32) -> Self {
        self.launch_attempts = attempts.max(1);
        self
    }

    pub fn with_launch_backoff(mut self, backoff: Duration) -> Self {
        self.launch_backoff = backoff;
        self
    }

    pub fn with_step_option(mut self, option: u8) -> Self {
        self.step_option = option;
        self
    }

    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_env_name(mut self, name: impl Into<String>) -> Self {
        self.env_name = name.into();
        self
    }

    pub fn with_missions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.missions_dir = Some(dir.into());
        self
    }
}
