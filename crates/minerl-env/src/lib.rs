//! minerl-env: mission session engine for Malmo-backed MineRL environments.
//!
//! Drives a remote Minecraft client through reset/step/close episodes over a
//! single framed TCP connection, recovering from dropped sockets, stuck
//! mission handshakes and crashed client processes.

mod lifecycle;
mod version;

pub mod action;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod env;
pub mod error;
pub mod instance;
pub mod mission;
pub mod observation;

#[cfg(test)]
mod testing;

pub use action::{Action, ActionError, ActionKind, ActionSpace, ActionValue};
pub use catalog::{CatalogError, ItemCatalog};
pub use config::EnvConfig;
pub use env::{EnvBuilder, MineRlEnv, StepResult};
pub use error::EnvError;
pub use instance::{AttachedInstance, CommandLauncher, Instance, InstanceProvider, LaunchError};
pub use lifecycle::{LifecycleState, RecoveryState};
pub use mission::{
    DescriptorError, FrameGeometry, MissionParams, MissionSource, SessionDescriptor,
    SessionIdentity,
};
pub use observation::{
    Frame, HandlerRegistry, InfoPayload, Observation, ObservationHandler, ObservationKind,
    ObservationSpace, ObservationValue,
};
pub use version::{MALMO_VERSION, MINERL_ENV_VERSION, VersionInfo};
