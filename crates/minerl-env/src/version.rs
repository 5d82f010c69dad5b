//! Version information for minerl-env and the Malmo protocol it speaks.

/// minerl-env version from Cargo.toml
pub const MINERL_ENV_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Malmo platform version. Sent in the greeting banner and the MissionInit
/// envelope; the remote client rejects sessions from other versions.
pub const MALMO_VERSION: &str = "0.37.0";

/// Greeting banner sent once on every new connection.
pub fn greeting() -> String {
    format!("<MalmoEnv{}/>", MALMO_VERSION)
}

/// Version information reported alongside remote status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// minerl-env crate version.
    pub minerl_env: &'static str,
    /// Malmo protocol version.
    pub malmo: &'static str,
    /// Status string reported by the remote client (if queried).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            minerl_env: MINERL_ENV_VERSION,
            malmo: MALMO_VERSION,
            remote_status: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_status(mut self, status: String) -> Self {
        self.remote_status = Some(status);
        self
    }
}
