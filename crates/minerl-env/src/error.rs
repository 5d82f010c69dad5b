//! Errors surfaced by environment operations.

use crate::action::ActionError;
use crate::bridge::connection::TransportError;
use crate::bridge::protocol::ProtocolError;
use crate::instance::LaunchError;
use crate::mission::DescriptorError;

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("no observation handler registered for '{0}'")]
    MissingHandler(String),

    /// Reset could not bring up a connection; recovery has already run.
    #[error("failed to reset (socket error): {0}")]
    ConnectionFailure(#[source] TransportError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Mission init was never acknowledged.
    #[error("mission init failed: {0}")]
    MissionInit(String),

    /// No observation or server port arrived in time.
    #[error("too long {0}")]
    MissionInitTimeout(&'static str),

    #[error("Port is unusable")]
    PortUnusable,

    #[error("failed to build and launch Minecraft instance {attempts} times, giving up")]
    LaunchExhausted { attempts: u32 },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("attempted to step an environment with done=True")]
    SteppedFinishedEpisode,

    #[error("something went wrong resetting the environment: `done` was true on first frame")]
    DoneOnFirstFrame,

    #[error("invalid action: {0}")]
    InvalidAction(#[from] ActionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("environment is closed")]
    Closed,
}

impl EnvError {
    /// Whether a reset should make another start-up attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure(_)
                | Self::Transport(_)
                | Self::MissionInit(_)
                | Self::MissionInitTimeout(_)
                | Self::PortUnusable
                | Self::Protocol(_)
        )
    }
}
