//! Lifecycle and recovery states for an environment session.

use serde::{Deserialize, Serialize};

/// Where an environment is in its mission lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// No session descriptor built yet
    #[default]
    Idle,
    /// Descriptor built, no connection
    Ready,
    /// Greeting sent, no active episode
    Connected,
    /// Mission-init handshake in flight
    InitPending,
    /// Episode steppable
    Active,
    /// Remote signaled completion, not yet reset
    EpisodeDone,
    /// Recovering from a failure; the next reset starts a fresh cycle
    Cleaning,
    /// Terminal
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Escalation memory for the recovery procedure.
///
/// `Clean` → first failure only drops the socket and moves to `FirstFailure`.
/// `FirstFailure` → the next failure kills and relaunches the remote client,
/// then returns to `Clean`. A successful reset also returns to `Clean`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    #[default]
    Clean,
    FirstFailure,
}

/// What the recovery procedure decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Socket dropped; the next reset reconnects to the same client.
    Reconnect,
    /// Client killed and replaced.
    Relaunch,
}

impl RecoveryState {
    /// Decide the action for a failure and return the state that follows it.
    ///
    /// `forced` escalates straight to a relaunch (bind collisions, remote
    /// inconsistencies).
    pub fn on_failure(self, forced: bool) -> (RecoveryAction, RecoveryState) {
        match (self, forced) {
            (RecoveryState::Clean, false) => (RecoveryAction::Reconnect, RecoveryState::FirstFailure),
            (RecoveryState::FirstFailure, _) | (_, true) => {
                (RecoveryAction::Relaunch, RecoveryState::Clean)
            }
        }
    }
}
