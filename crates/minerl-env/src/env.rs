//! Mission lifecycle: reset, step, quit and failure recovery.
//!
//! Flow of a reset:
//! 1. Build the session descriptor (once per environment)
//! 2. Quit the previous episode if one is still running
//! 3. Connect and greet if no socket is open
//! 4. Mission-init handshake
//! 5. Peek until the first non-empty frame arrives
//!
//! A socket failure in 3-5 runs recovery and the start-up is retried a bounded
//! number of times. A socket failure during a step runs recovery and returns a
//! sampled observation with `done = true`.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::time::{Instant, sleep};
use tokio_util::bytes::Bytes;

use crate::action::{Action, ActionSpace};
use crate::bridge::connection::{self, Connection, TransportError};
use crate::bridge::protocol::{self, Command, StepReply};
use crate::config::EnvConfig;
use crate::error::EnvError;
use crate::instance::{self, Instance, InstanceProvider, LaunchError};
use crate::lifecycle::{LifecycleState, RecoveryAction, RecoveryState};
use crate::mission::{FrameGeometry, MissionParams, MissionSource, SessionDescriptor, SessionIdentity};
use crate::observation::{
    Frame, HandlerRegistry, InfoPayload, Observation, ObservationHandler, ObservationSpace,
};

/// Agents per mission. Multi-agent missions are rejected.
const AGENT_COUNT: u32 = 1;

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: Map<String, Value>,
}

pub struct EnvBuilder {
    source: MissionSource,
    observation_space: ObservationSpace,
    action_space: ActionSpace,
    handlers: HandlerRegistry,
    config: EnvConfig,
    role: u32,
}

impl EnvBuilder {
    pub fn new(
        source: MissionSource,
        observation_space: ObservationSpace,
        action_space: ActionSpace,
    ) -> Self {
        Self {
            source,
            observation_space,
            action_space,
            handlers: HandlerRegistry::default(),
            config: EnvConfig::default(),
            role: 0,
        }
    }

    pub fn with_config(mut self, config: EnvConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, key: impl Into<String>, handler: ObservationHandler) -> Self {
        self.handlers.register(key, handler);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_role(mut self, role: u32) -> Self {
        self.role = role;
        self
    }

    /// Check handler coverage and launch the first instance.
    pub async fn build(self, provider: Arc<dyn InstanceProvider>) -> Result<MineRlEnv, EnvError> {
        if let Some(key) = self.handlers.missing_for(&self.observation_space) {
            return Err(EnvError::MissingHandler(key.to_string()));
        }
        let instance = launch_with_retry(provider.as_ref(), &self.config).await?;

        Ok(MineRlEnv {
            config: self.config,
            source: self.source,
            observation_space: self.observation_space,
            action_space: self.action_space,
            handlers: self.handlers,
            provider,
            instance,
            descriptor: None,
            identity: SessionIdentity::new(self.role),
            connection: None,
            done: true,
            recovery: RecoveryState::Clean,
            state: LifecycleState::Idle,
            last_frame: None,
        })
    }
}

/// Launch an instance, retrying intermittent build failures.
async fn launch_with_retry(
    provider: &dyn InstanceProvider,
    config: &EnvConfig,
) -> Result<Box<dyn Instance>, EnvError> {
    let attempts = config.launch_attempts.max(1);
    for attempt in 1..=attempts {
        match provider.launch().await {
            Ok(instance) => {
                tracing::info!(
                    host = %instance.host(),
                    port = instance.port(),
                    "Minecraft instance launched"
                );
                return Ok(instance);
            }
            Err(LaunchError::IntermittentBuild(reason)) => {
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    %reason,
                    "Minecraft build or launch just failed, probably an intermittent race condition"
                );
                if attempt < attempts {
                    sleep(config.launch_backoff).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(EnvError::LaunchExhausted { attempts })
}

/// One environment: one instance, at most one mission socket, one request at
/// a time.
pub struct MineRlEnv {
    config: EnvConfig,
    source: MissionSource,
    observation_space: ObservationSpace,
    action_space: ActionSpace,
    handlers: HandlerRegistry,
    provider: Arc<dyn InstanceProvider>,
    instance: Box<dyn Instance>,
    descriptor: Option<SessionDescriptor>,
    identity: SessionIdentity,
    connection: Option<Connection>,
    done: bool,
    recovery: RecoveryState,
    state: LifecycleState,
    last_frame: Option<Frame>,
}

impl MineRlEnv {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn observation_space(&self) -> &ObservationSpace {
        &self.observation_space
    }

    pub fn action_space(&self) -> &ActionSpace {
        &self.action_space
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Seed for the next reset only.
    pub fn seed(&mut self, seed: i64) {
        self.identity.seed = Some(seed);
    }

    /// Last frame received, if any.
    pub fn render(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// Tail of the client's log file.
    pub fn recent_logs(&self, n: usize) -> Vec<String> {
        instance::recent_logs(self.instance.as_ref(), n)
    }

    /// Start a new episode and return its first observation.
    pub async fn reset(&mut self) -> Result<Observation, EnvError> {
        self.ensure_open()?;
        let result = self.reset_inner().await;
        // The seed applies to a single reset, successful or not.
        self.identity.seed = None;
        result
    }

    async fn reset_inner(&mut self) -> Result<Observation, EnvError> {
        self.ensure_descriptor()?;
        self.quit_episode().await?;

        let attempts = self.config.reset_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.start_up().await {
                Ok(observation) => {
                    self.recovery = RecoveryState::Clean;
                    return Ok(observation);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %e, "Reset failed, retrying");
                    attempt += 1;
                    sleep(self.config.reset_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Take one step of the running episode.
    pub async fn step(&mut self, action: &Action) -> Result<StepResult, EnvError> {
        self.ensure_open()?;
        if self.done {
            return Err(EnvError::SteppedFinishedEpisode);
        }
        let body = self.action_space.marshal(action)?;

        match self.exchange_step(&body).await {
            Ok(result) => Ok(result),
            Err(e @ (EnvError::Transport(_) | EnvError::Protocol(_))) => {
                tracing::warn!(error = %e, "Step failed");
                self.log_error(
                    "Failed to take step (timeout or error). Terminating episode and sending \
                     random observation, check for 'error' in info",
                );
                self.recover(false).await?;
                Ok(self.degraded_step())
            }
            Err(e) => Err(e),
        }
    }

    /// Close the socket and kill the instance. Idempotent.
    pub async fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(conn) = self.connection.take() {
            conn.shutdown().await;
        }
        if self.instance.is_running() {
            self.instance.kill();
        }
        self.done = true;
        self.state = LifecycleState::Closed;
        tracing::debug!("Environment closed");
    }

    /// Status string from the client, over a separate connection.
    pub async fn status(&self) -> Result<String, EnvError> {
        self.ensure_open()?;
        let host = self.instance.host().to_string();
        let port = self.instance.port();
        Ok(connection::query_status(&host, port, self.config.socket_timeout).await?)
    }

    /// Reset the client's episode counter. Returns whether it acknowledged.
    pub async fn reinit(&mut self) -> Result<bool, EnvError> {
        self.ensure_open()?;
        self.ensure_descriptor()?;
        let token = self.identity.token();
        let host = self.instance.host().to_string();
        let port = self.instance.port();
        let reply = connection::one_shot(
            &host,
            port,
            self.config.socket_timeout,
            Command::Init(&token),
        )
        .await?;
        Ok(protocol::decode_ack("reinit", &reply)?)
    }

    /// Poll for the integrated server port of this session and inject it into
    /// the descriptor.
    pub async fn find_server(&mut self) -> Result<u16, EnvError> {
        self.ensure_open()?;
        self.ensure_descriptor()?;
        let token = self.identity.token();
        let host = self.instance.host().to_string();
        let port = self.instance.port();
        let mut conn = Connection::connect(&host, port, self.config.socket_timeout).await?;

        let deadline = Instant::now() + self.config.first_frame_timeout;
        let server_port = loop {
            conn.send_command(Command::Find(&token)).await?;
            let reply = conn.recv().await?;
            let found = protocol::decode_u32("find", &reply)?;
            if found != 0 {
                break found;
            }
            if Instant::now() >= deadline {
                conn.shutdown().await;
                self.drop_connection().await;
                return Err(EnvError::MissionInitTimeout("finding mission to join"));
            }
            sleep(self.config.init_retry_delay).await;
        };
        conn.shutdown().await;

        let server_port = u16::try_from(server_port).map_err(|_| {
            EnvError::MissionInit(format!("integrated server port {} out of range", server_port))
        })?;
        tracing::debug!(server_port, "Found mission integrated server port");
        if let Some(descriptor) = self.descriptor.as_mut() {
            descriptor.set_server_port(server_port);
        }
        Ok(server_port)
    }

    fn ensure_open(&self) -> Result<(), EnvError> {
        if self.state.is_terminal() {
            return Err(EnvError::Closed);
        }
        Ok(())
    }

    fn ensure_descriptor(&mut self) -> Result<&SessionDescriptor, EnvError> {
        let descriptor = match self.descriptor.take() {
            Some(descriptor) => descriptor,
            None => {
                let params = MissionParams {
                    role: self.identity.role,
                    env_name: self.config.env_name.clone(),
                    missions_dir: self.config.missions_dir.clone(),
                    ..MissionParams::default()
                };
                let descriptor = SessionDescriptor::build(&self.source, &params)?;
                self.identity.experiment_id = descriptor.experiment_id().to_string();
                if self.state == LifecycleState::Idle {
                    self.state = LifecycleState::Ready;
                }
                descriptor
            }
        };
        let descriptor: &SessionDescriptor = self.descriptor.insert(descriptor);
        Ok(descriptor)
    }

    fn geometry(&self) -> FrameGeometry {
        self.descriptor
            .as_ref()
            .map(SessionDescriptor::geometry)
            .unwrap_or(FrameGeometry::new(0, 0, 3))
    }

    fn conn(&mut self) -> Result<&mut Connection, TransportError> {
        self.connection.as_mut().ok_or(TransportError::Closed)
    }

    async fn drop_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.shutdown().await;
        }
    }

    /// Quit the running episode, polling until the client acknowledges.
    async fn quit_episode(&mut self) -> Result<(), EnvError> {
        while !self.done {
            if self.connection.is_none() {
                self.done = true;
                break;
            }
            match self.send_quit().await {
                Ok(true) => {
                    tracing::debug!("Episode quit acknowledged");
                    self.done = true;
                }
                Ok(false) => sleep(self.config.poll_interval).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Quit failed, treating episode as ended");
                    self.recover(false).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_quit(&mut self) -> Result<bool, TransportError> {
        let conn = self.conn()?;
        conn.send_command(Command::Quit).await?;
        conn.recv_ack("quit").await
    }

    /// One start-up attempt. Failures run recovery before they are returned.
    async fn start_up(&mut self) -> Result<Observation, EnvError> {
        self.identity.reset_count += 1;
        match self.start_up_inner().await {
            Ok(observation) => Ok(observation),
            Err(e) => Err(self.fail_start_up(e).await),
        }
    }

    async fn start_up_inner(&mut self) -> Result<Observation, EnvError> {
        if self.connection.is_none() {
            let host = self.instance.host().to_string();
            let port = self.instance.port();
            let conn = Connection::connect(&host, port, self.config.socket_timeout).await?;
            self.connection = Some(conn);
            self.state = LifecycleState::Connected;
        }
        self.init_mission().await?;
        self.done = false;
        self.peek_first_observation().await
    }

    async fn fail_start_up(&mut self, err: EnvError) -> EnvError {
        let (forced, surfaced) = match err {
            EnvError::Transport(e) => (false, EnvError::ConnectionFailure(e)),
            EnvError::Protocol(e) => (false, EnvError::ConnectionFailure(e.into())),
            e @ (EnvError::PortUnusable | EnvError::DoneOnFirstFrame) => (true, e),
            e @ (EnvError::MissionInit(_) | EnvError::MissionInitTimeout(_)) => (false, e),
            other => return other,
        };
        self.log_error(&format!("Failed to reset ({}), trying again", surfaced));
        match self.recover(forced).await {
            Ok(()) => surfaced,
            Err(fatal) => fatal,
        }
    }

    async fn init_mission(&mut self) -> Result<(), EnvError> {
        self.state = LifecycleState::InitPending;
        let document = Bytes::from(self.ensure_descriptor()?.document());
        let token = Bytes::from(self.identity.init_token(AGENT_COUNT, self.config.synchronous));
        tracing::debug!(token = %String::from_utf8_lossy(&token), "Sending mission init");

        let mut retries = 0;
        loop {
            let conn = self.conn()?;
            conn.send(document.clone()).await?;
            conn.send(token.clone()).await?;
            let reply = conn.recv().await?;
            if protocol::decode_u32("init", &reply)? == 1 {
                return Ok(());
            }

            retries += 1;
            if retries > self.config.init_attempts {
                return Err(EnvError::MissionInit(format!(
                    "not acknowledged after {} attempts",
                    retries
                )));
            }
            let lines = self.recent_logs(self.config.bind_scan_lines);
            if instance::shows_bind_exception(&lines) {
                tracing::error!(
                    "Malmo server failed to bind to port, possibly due to collision with a \
                     parallel Malmo instance. Starting a new one; the abandoned server may \
                     need to be closed manually"
                );
                return Err(EnvError::PortUnusable);
            }
            self.log_error("Did not get an OK from Malmo, trying again");
            sleep(self.config.init_retry_delay).await;
        }
    }

    async fn peek_first_observation(&mut self) -> Result<Observation, EnvError> {
        let deadline = Instant::now() + self.config.first_frame_timeout;
        loop {
            let (pixels, info, done) = self.peek().await?;
            self.done = done;
            if done {
                return Err(EnvError::DoneOnFirstFrame);
            }
            if pixels.is_empty() {
                if Instant::now() >= deadline {
                    self.drop_connection().await;
                    return Err(EnvError::MissionInitTimeout("waiting for first observation"));
                }
                sleep(self.config.poll_interval).await;
                continue;
            }

            let (observation, _) = self.process_observation(&pixels, &info)?;
            self.state = LifecycleState::Active;
            tracing::debug!(reset_count = self.identity.reset_count, "Episode started");
            return Ok(observation);
        }
    }

    async fn peek(&mut self) -> Result<(Bytes, Bytes, bool), EnvError> {
        let conn = self.conn()?;
        conn.send_command(Command::Peek).await?;
        let pixels = conn.recv().await?;
        let info = conn.recv().await?;
        let flag = conn.recv().await?;
        Ok((pixels, info, protocol::decode_done_flag(&flag)?))
    }

    async fn exchange_step(&mut self, body: &str) -> Result<StepResult, EnvError> {
        let option = self.config.step_option;
        let conn = self.conn()?;
        conn.send_command(Command::Step { option, body }).await?;
        let mut pixels = conn.recv().await?;
        let reply = StepReply::decode(&conn.recv().await?)?;
        let mut info = if reply.info_sent {
            conn.recv().await?
        } else {
            Bytes::new()
        };

        let mut done = reply.done;
        if pixels.is_empty() && !done {
            let (polled, polled_info, polled_done) = self.poll_frame().await?;
            pixels = polled;
            if info.is_empty() {
                info = polled_info;
            }
            done = polled_done;
        }

        let (observation, info) = self.process_observation(&pixels, &info)?;
        self.done = done;
        if done {
            self.state = LifecycleState::EpisodeDone;
            tracing::debug!("Episode done");
        }
        Ok(StepResult {
            observation,
            reward: reply.reward,
            done,
            info,
        })
    }

    /// Peek until a frame arrives or the episode ends. Running out of time
    /// counts as a socket timeout.
    async fn poll_frame(&mut self) -> Result<(Bytes, Bytes, bool), EnvError> {
        let deadline = Instant::now() + self.config.first_frame_timeout;
        loop {
            let (pixels, info, done) = self.peek().await?;
            if !pixels.is_empty() || done {
                return Ok((pixels, info, done));
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout.into());
            }
            sleep(self.config.poll_interval).await;
        }
    }

    fn process_observation(
        &mut self,
        pixels: &[u8],
        info: &[u8],
    ) -> Result<(Observation, Map<String, Value>), EnvError> {
        let frame = Frame::from_remote(pixels, self.geometry())?;
        let payload = InfoPayload::new(protocol::decode_info(info)?, frame);
        let observation = self.handlers.process(&payload, &self.observation_space);
        self.last_frame = Some(payload.pov);
        Ok((observation, payload.json))
    }

    fn degraded_step(&self) -> StepResult {
        let observation = self.observation_space.sample(&mut rand::thread_rng());
        let mut info = Map::new();
        info.insert(
            "error".to_string(),
            Value::String(TransportError::Timeout.to_string()),
        );
        StepResult {
            observation,
            reward: 0.0,
            done: true,
            info,
        }
    }

    /// Drop the socket; on a repeated (or forced) failure also replace the
    /// instance.
    async fn recover(&mut self, forced: bool) -> Result<(), EnvError> {
        self.log_error("Cleaning connection! Something must have gone wrong");
        self.drop_connection().await;
        self.done = true;
        self.state = LifecycleState::Cleaning;

        let (action, next) = self.recovery.on_failure(forced);
        self.recovery = next;
        if action == RecoveryAction::Relaunch {
            tracing::error!(forced, "Connection with Minecraft client cleaned more than once, restarting");
            self.instance.kill();
            let instance = launch_with_retry(self.provider.as_ref(), &self.config).await?;
            self.instance = instance;
        }
        Ok(())
    }

    fn log_error(&self, msg: &str) {
        tracing::error!("{}", msg);
        let lines = self.recent_logs(self.config.log_tail_lines);
        if lines.is_empty() {
            return;
        }
        tracing::error!("Last {} lines of the log file:", lines.len());
        for line in &lines {
            tracing::error!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::action::ActionValue;
    use crate::observation::ObservationValue;
    use crate::testing::{FakeMalmo, MockLauncher, Script, mission_xml};

    fn config() -> EnvConfig {
        EnvConfig::new()
            .with_socket_timeout(Duration::from_secs(2))
            .with_init_retry_delay(Duration::from_millis(5))
            .with_first_frame_timeout(Duration::from_millis(500))
            .with_poll_interval(Duration::from_millis(5))
            .with_reset_attempts(3)
            .with_reset_backoff(Duration::from_millis(5))
            .with_launch_attempts(3)
            .with_launch_backoff(Duration::from_millis(5))
            .with_env_name("MineRLTreechop-v0")
    }

    fn builder() -> EnvBuilder {
        let geometry = FrameGeometry::new(3, 4, 3);
        EnvBuilder::new(
            MissionSource::inline(mission_xml(4, 3, false)),
            ObservationSpace::new()
                .with_pixels("pov", geometry)
                .with_scalar("compassAngle", -180.0, 180.0),
            ActionSpace::new()
                .with_enum("turn", ["none", "left", "right"])
                .with_box("camera", vec![2], -180.0, 180.0),
        )
        .with_config(config())
    }

    async fn start(script: Script) -> (FakeMalmo, MockLauncher, MineRlEnv) {
        start_with(script, config()).await
    }

    async fn start_with(script: Script, config: EnvConfig) -> (FakeMalmo, MockLauncher, MineRlEnv) {
        let fake = FakeMalmo::start(script).await;
        let launcher = MockLauncher::new(fake.port());
        let env = builder()
            .with_config(config)
            .build(Arc::new(launcher.clone()))
            .await
            .unwrap();
        (fake, launcher, env)
    }

    fn turn_left() -> Action {
        [("turn".to_string(), ActionValue::Index(1))]
            .into_iter()
            .collect()
    }

    fn init_tokens(fake: &FakeMalmo) -> Vec<String> {
        let messages = fake.messages();
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.starts_with("<MissionInit"))
            .filter_map(|(i, _)| messages.get(i + 1).cloned())
            .collect()
    }

    #[tokio::test]
    async fn reset_returns_first_observation() {
        let (fake, launcher, mut env) = start(Script::default()).await;
        assert_eq!(env.state(), LifecycleState::Idle);

        let observation = env.reset().await.unwrap();
        assert_eq!(env.state(), LifecycleState::Active);
        assert!(!env.is_done());

        match &observation["pov"] {
            ObservationValue::Pixels(frame) => {
                assert_eq!(frame.shape(), [3, 4, 3]);
                // Last wire row is the top of the image.
                assert_eq!(frame.pixel(0, 0), Some(&[2, 2, 2][..]));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(observation["compassAngle"], ObservationValue::Scalar(45.0));

        let messages = fake.messages();
        assert_eq!(messages[0], "<MalmoEnv0.37.0/>");
        assert!(messages[1].starts_with("<MissionInit"));
        assert!(messages[1].contains("<Summary>MineRLTreechop-v0</Summary>"));
        let experiment_id = env.identity().experiment_id.clone();
        assert_eq!(messages[2], format!("{}:0:1:1:true", experiment_id));
        assert_eq!(messages[3], "<Peek/>");
        assert_eq!(launcher.events(), ["launch"]);
    }

    #[tokio::test]
    async fn seed_applies_to_one_reset() {
        let (fake, _launcher, mut env) = start(Script::default()).await;
        env.seed(42);
        env.reset().await.unwrap();
        assert_eq!(env.identity().seed, None);
        env.reset().await.unwrap();

        let id = env.identity().experiment_id.clone();
        assert_eq!(
            init_tokens(&fake),
            [format!("{}:0:1:1:true:42", id), format!("{}:0:2:1:true", id)]
        );
    }

    #[tokio::test]
    async fn seed_is_cleared_when_reset_fails() {
        let port = crate::testing::dead_port().await;
        let launcher = MockLauncher::new(port);
        let mut env = builder()
            .with_config(config().with_reset_attempts(1))
            .build(Arc::new(launcher))
            .await
            .unwrap();

        env.seed(7);
        assert!(env.reset().await.is_err());
        assert_eq!(env.identity().seed, None);
    }

    #[tokio::test]
    async fn reset_twice_keeps_one_socket() {
        let (fake, _launcher, mut env) = start(Script::default()).await;
        env.reset().await.unwrap();
        env.reset().await.unwrap();

        let stats = fake.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.quits, 1);
        assert_eq!(stats.inits, 2);
    }

    #[tokio::test]
    async fn quit_is_polled_until_acknowledged() {
        let (fake, _launcher, mut env) = start(Script {
            quit_nacks: 2,
            ..Script::default()
        })
        .await;
        env.reset().await.unwrap();
        env.reset().await.unwrap();
        assert_eq!(fake.stats().quits, 3);
    }

    #[tokio::test]
    async fn step_marshals_action_and_reads_reply() {
        let (fake, _launcher, mut env) = start(Script::default()).await;
        env.reset().await.unwrap();

        let result = env.step(&turn_left()).await.unwrap();
        assert_eq!(result.reward, 1.5);
        assert!(!result.done);
        assert_eq!(result.info["compassAngle"], 45.0);
        assert!(fake.messages().contains(&"<Step0>turn left</Step0>".to_string()));
        assert!(env.render().is_some());
    }

    #[tokio::test]
    async fn step_option_is_embedded() {
        let (fake, _launcher, mut env) = start_with(Script::default(), config().with_step_option(2)).await;
        env.reset().await.unwrap();
        env.step(&turn_left()).await.unwrap();
        assert!(fake.messages().contains(&"<Step2>turn left</Step2>".to_string()));
    }

    #[tokio::test]
    async fn step_after_done_sends_nothing() {
        let (fake, _launcher, mut env) = start(Script {
            step_done_after: Some(1),
            ..Script::default()
        })
        .await;
        env.reset().await.unwrap();

        let result = env.step(&turn_left()).await.unwrap();
        assert!(result.done);
        assert_eq!(env.state(), LifecycleState::EpisodeDone);

        let err = env.step(&turn_left()).await.unwrap_err();
        assert!(matches!(err, EnvError::SteppedFinishedEpisode));
        assert_eq!(fake.stats().steps, 1);
    }

    #[tokio::test]
    async fn step_before_reset_is_rejected() {
        let (fake, _launcher, mut env) = start(Script::default()).await;
        let err = env.step(&turn_left()).await.unwrap_err();
        assert!(matches!(err, EnvError::SteppedFinishedEpisode));
        assert_eq!(fake.stats().connections, 0);
    }

    #[tokio::test]
    async fn invalid_action_is_not_sent() {
        let (fake, _launcher, mut env) = start(Script::default()).await;
        env.reset().await.unwrap();

        let action: Action = [("turn".to_string(), ActionValue::Index(9))]
            .into_iter()
            .collect();
        let err = env.step(&action).await.unwrap_err();
        assert!(matches!(err, EnvError::InvalidAction(_)));
        assert_eq!(fake.stats().steps, 0);
        assert!(!env.is_done());
    }

    #[tokio::test]
    async fn step_timeout_returns_degraded_result() {
        let (_fake, launcher, mut env) = start_with(
            Script {
                stall_on_step: Some(1),
                ..Script::default()
            },
            config().with_socket_timeout(Duration::from_millis(200)),
        )
        .await;
        env.reset().await.unwrap();

        let result = env.step(&turn_left()).await.unwrap();
        assert!(result.done);
        assert_eq!(result.reward, 0.0);
        assert_eq!(result.info["error"], "Connection timed out!");
        assert!(result.observation.contains_key("pov"));
        assert!(result.observation.contains_key("compassAngle"));

        assert_eq!(env.state(), LifecycleState::Cleaning);
        assert_eq!(env.recovery_state(), RecoveryState::FirstFailure);
        assert_eq!(launcher.events(), ["launch"]);
    }

    #[tokio::test]
    async fn consecutive_failures_relaunch_once() {
        let (_fake, launcher, mut env) = start_with(
            Script {
                drop_on_steps: vec![1],
                max_connections: Some(1),
                ..Script::default()
            },
            config().with_reset_attempts(1),
        )
        .await;

        env.reset().await.unwrap();
        let degraded = env.step(&turn_left()).await.unwrap();
        assert!(degraded.info.contains_key("error"));
        assert_eq!(env.recovery_state(), RecoveryState::FirstFailure);
        assert_eq!(launcher.events(), ["launch"]);

        // The client now refuses the mission socket: second failure in a row.
        let err = env.reset().await.unwrap_err();
        assert!(matches!(err, EnvError::ConnectionFailure(_)), "{err}");
        assert_eq!(launcher.events(), ["launch", "kill", "launch"]);
        assert_eq!(env.recovery_state(), RecoveryState::Clean);
    }

    #[tokio::test]
    async fn successful_reset_clears_recovery() {
        let (_fake, _launcher, mut env) = start(Script {
            drop_on_steps: vec![1],
            ..Script::default()
        })
        .await;
        env.reset().await.unwrap();
        env.step(&turn_left()).await.unwrap();
        assert_eq!(env.recovery_state(), RecoveryState::FirstFailure);

        env.reset().await.unwrap();
        assert_eq!(env.recovery_state(), RecoveryState::Clean);
    }

    #[tokio::test]
    async fn done_on_first_frame_is_not_retried() {
        let (fake, launcher, mut env) = start(Script {
            peek_done: true,
            ..Script::default()
        })
        .await;

        let err = env.reset().await.unwrap_err();
        assert!(matches!(err, EnvError::DoneOnFirstFrame));
        assert_eq!(fake.stats().inits, 1);
        assert_eq!(launcher.events(), ["launch", "kill", "launch"]);
    }

    #[tokio::test]
    async fn empty_done_first_frame_fails_reset() {
        let (fake, launcher, mut env) = start(Script {
            peek_empty: 1,
            peek_done: true,
            ..Script::default()
        })
        .await;

        let err = env.reset().await.unwrap_err();
        assert!(matches!(err, EnvError::DoneOnFirstFrame), "{err}");
        assert_eq!(fake.stats().peeks, 1);
        assert_eq!(launcher.events(), ["launch", "kill", "launch"]);
    }

    #[tokio::test]
    async fn step_without_info_frame() {
        let (fake, _launcher, mut env) = start(Script {
            step_info: false,
            ..Script::default()
        })
        .await;
        env.reset().await.unwrap();

        let first = env.step(&turn_left()).await.unwrap();
        assert!(!first.done);
        assert_eq!(first.reward, 1.5);
        assert!(first.info.is_empty());

        // Stream stays aligned: no stray info frame was consumed.
        let second = env.step(&turn_left()).await.unwrap();
        assert!(second.info.is_empty());
        assert!(second.observation.contains_key("pov"));
        assert_eq!(fake.stats().steps, 2);
        assert_eq!(fake.stats().connections, 1);
    }

    #[tokio::test]
    async fn reset_after_close_and_rebuild() {
        let (fake, launcher, mut env) = start(Script::default()).await;
        env.reset().await.unwrap();
        env.close().await;

        let mut env = builder().build(Arc::new(launcher.clone())).await.unwrap();
        let observation = env.reset().await.unwrap();

        let mut keys: Vec<&String> = observation.keys().collect();
        let mut declared: Vec<&String> = env.observation_space().keys().collect();
        keys.sort();
        declared.sort();
        assert_eq!(keys, declared);
        assert!(!keys.is_empty());
        assert_eq!(launcher.events(), ["launch", "kill", "launch"]);
        assert_eq!(fake.stats().inits, 2);
    }

    #[tokio::test]
    async fn empty_first_frames_are_polled() {
        let (fake, _launcher, mut env) = start(Script {
            peek_empty: 3,
            ..Script::default()
        })
        .await;

        env.reset().await.unwrap();
        assert_eq!(fake.stats().peeks, 4);
        assert_eq!(fake.stats().inits, 1);
    }

    #[tokio::test]
    async fn first_frame_never_arriving_times_out() {
        let (_fake, _launcher, mut env) = start_with(
            Script {
                peek_empty: u32::MAX,
                ..Script::default()
            },
            config()
                .with_first_frame_timeout(Duration::from_millis(50))
                .with_reset_attempts(1),
        )
        .await;

        let err = env.reset().await.unwrap_err();
        assert!(matches!(err, EnvError::MissionInitTimeout(_)));
        assert_eq!(env.recovery_state(), RecoveryState::FirstFailure);
        assert!(env.is_done());
    }

    #[tokio::test]
    async fn unacknowledged_init_is_resent() {
        let (fake, _launcher, mut env) = start(Script {
            init_nacks: 2,
            ..Script::default()
        })
        .await;

        env.reset().await.unwrap();
        let stats = fake.stats();
        assert_eq!(stats.inits, 3);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test]
    async fn init_never_acknowledged_fails() {
        let (fake, _launcher, mut env) = start_with(
            Script {
                init_nacks: u32::MAX,
                ..Script::default()
            },
            config().with_init_attempts(2).with_reset_attempts(1),
        )
        .await;

        let err = env.reset().await.unwrap_err();
        assert!(matches!(err, EnvError::MissionInit(_)));
        assert_eq!(fake.stats().inits, 3);
    }

    #[tokio::test]
    async fn bind_exception_forces_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("run").join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(
            logs.join("latest.log"),
            "[Server thread/WARN]: **** FAILED TO BIND TO PORT!\n\
             java.net.BindException: Address already in use\n",
        )
        .unwrap();

        let fake = FakeMalmo::start(Script {
            init_nacks: 1,
            ..Script::default()
        })
        .await;
        let launcher = MockLauncher::new(fake.port()).with_log_dir(dir.path());
        let mut env = builder().build(Arc::new(launcher.clone())).await.unwrap();

        env.reset().await.unwrap();
        assert_eq!(launcher.events(), ["launch", "kill", "launch"]);
        assert_eq!(fake.stats().inits, 2);
        // The relaunch opened a fresh connection.
        assert_eq!(fake.stats().connections, 2);
    }

    #[tokio::test]
    async fn unreachable_client_surfaces_connection_failure() {
        let port = crate::testing::dead_port().await;
        let launcher = MockLauncher::new(port);
        let mut env = builder()
            .with_config(config().with_reset_attempts(2))
            .build(Arc::new(launcher.clone()))
            .await
            .unwrap();

        let err = env.reset().await.unwrap_err();
        assert!(matches!(err, EnvError::ConnectionFailure(_)), "{err}");
        // Two failures: one reconnect, one relaunch.
        assert_eq!(launcher.events(), ["launch", "kill", "launch"]);
        assert_eq!(env.identity().reset_count, 2);
    }

    #[tokio::test]
    async fn empty_step_frame_falls_back_to_peek() {
        let (fake, _launcher, mut env) = start(Script {
            step_empty_frames: 1,
            ..Script::default()
        })
        .await;
        env.reset().await.unwrap();

        let result = env.step(&turn_left()).await.unwrap();
        assert!(!result.info.contains_key("error"));
        assert_eq!(fake.stats().peeks, 2);
        match &result.observation["pov"] {
            ObservationValue::Pixels(frame) => assert_eq!(frame.pixel(0, 0), Some(&[2, 2, 2][..])),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (fake, launcher, mut env) = start(Script::default()).await;
        env.reset().await.unwrap();

        env.close().await;
        env.close().await;
        assert_eq!(env.state(), LifecycleState::Closed);
        assert_eq!(launcher.events(), ["launch", "kill"]);
        fake.wait_for_open(0).await;

        assert!(matches!(env.reset().await, Err(EnvError::Closed)));
        assert!(matches!(env.step(&turn_left()).await, Err(EnvError::Closed)));
        assert!(matches!(env.status().await, Err(EnvError::Closed)));
    }

    #[tokio::test]
    async fn status_uses_separate_connection() {
        let (fake, _launcher, env) = start(Script {
            status: "{\"episode\": 0}".to_string(),
            ..Script::default()
        })
        .await;

        assert_eq!(env.status().await.unwrap(), "{\"episode\": 0}");
        assert_eq!(env.state(), LifecycleState::Idle);
        assert_eq!(fake.stats().connections, 1);
    }

    #[tokio::test]
    async fn reinit_sends_session_token() {
        let (fake, _launcher, mut env) = start(Script::default()).await;

        assert!(env.reinit().await.unwrap());
        let id = env.identity().experiment_id.clone();
        assert!(fake.messages().contains(&format!("<Init>{}:0:0</Init>", id)));
        assert_eq!(env.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn find_server_injects_port() {
        let (fake, _launcher, mut env) = start(Script {
            find_zero: 2,
            find_port: 25565,
            ..Script::default()
        })
        .await;

        assert_eq!(env.find_server().await.unwrap(), 25565);
        assert_eq!(fake.stats().finds, 3);
        let descriptor = env.descriptor().unwrap();
        assert_eq!(descriptor.server_port(), Some(25565));
        assert!(descriptor.document().contains("port=\"25565\""));
    }

    #[tokio::test]
    async fn find_server_gives_up() {
        let (_fake, _launcher, mut env) = start_with(
            Script {
                find_zero: u32::MAX,
                ..Script::default()
            },
            config().with_first_frame_timeout(Duration::from_millis(30)),
        )
        .await;

        let err = env.find_server().await.unwrap_err();
        assert!(matches!(err, EnvError::MissionInitTimeout("finding mission to join")));
    }

    #[tokio::test]
    async fn missing_handler_rejected_at_build() {
        let launcher = MockLauncher::new(1);
        let result = EnvBuilder::new(
            MissionSource::inline(mission_xml(4, 3, false)),
            ObservationSpace::new().with_scalar("life", 0.0, 20.0),
            ActionSpace::new(),
        )
        .with_config(config())
        .build(Arc::new(launcher.clone()))
        .await;

        assert!(matches!(result, Err(EnvError::MissingHandler(key)) if key == "life"));
        assert!(launcher.events().is_empty());
    }

    #[tokio::test]
    async fn custom_handler_fills_extra_key() {
        let fake = FakeMalmo::start(Script::default()).await;
        let launcher = MockLauncher::new(fake.port());
        let geometry = FrameGeometry::new(3, 4, 3);
        let mut env = EnvBuilder::new(
            MissionSource::inline(mission_xml(4, 3, false)),
            ObservationSpace::new()
                .with_pixels("pov", geometry)
                .with_scalar("life", 0.0, 20.0),
            ActionSpace::new(),
        )
        .with_config(config().with_synchronous(false))
        .with_handlers(HandlerRegistry::empty().with("pov", ObservationHandler::Pixel))
        .with_handler(
            "life",
            ObservationHandler::custom(|_, _| ObservationValue::Scalar(20.0)),
        )
        .build(Arc::new(launcher))
        .await
        .unwrap();

        let observation = env.reset().await.unwrap();
        assert_eq!(observation["life"], ObservationValue::Scalar(20.0));
        let id = env.identity().experiment_id.clone();
        assert_eq!(init_tokens(&fake), [format!("{}:0:1:1:false", id)]);
    }

    #[tokio::test]
    async fn replaced_registry_must_cover_space() {
        let result = builder()
            .with_handlers(HandlerRegistry::empty())
            .build(Arc::new(MockLauncher::new(1)))
            .await;
        assert!(matches!(result, Err(EnvError::MissingHandler(key)) if key == "pov"));
    }

    #[tokio::test]
    async fn role_without_agent_section_is_rejected() {
        let fake = FakeMalmo::start(Script::default()).await;
        let mut env = builder()
            .with_role(1)
            .build(Arc::new(MockLauncher::new(fake.port())))
            .await
            .unwrap();

        let err = env.reset().await.unwrap_err();
        assert!(matches!(
            err,
            EnvError::Descriptor(crate::mission::DescriptorError::MissingVideoProducer { role: 1 })
        ));
        assert_eq!(fake.stats().connections, 0);
    }

    #[tokio::test]
    async fn intermittent_launch_failures_are_retried() {
        let launcher = MockLauncher::new(1).with_intermittent_failures(2);
        builder().build(Arc::new(launcher.clone())).await.unwrap();
        assert_eq!(launcher.events(), ["failed_launch", "failed_launch", "launch"]);

        let launcher = MockLauncher::new(1).with_intermittent_failures(3);
        let result = builder().build(Arc::new(launcher)).await;
        assert!(matches!(result, Err(EnvError::LaunchExhausted { attempts: 3 })));
    }

    #[tokio::test]
    async fn turn_based_mission_is_not_retried() {
        let xml = mission_xml(4, 3, false)
            .replace("<AgentHandlers>", "<AgentHandlers><TurnBasedCommands/>");
        let fake = FakeMalmo::start(Script::default()).await;
        let mut env = EnvBuilder::new(
            MissionSource::inline(xml),
            ObservationSpace::new(),
            ActionSpace::new(),
        )
        .with_config(config())
        .build(Arc::new(MockLauncher::new(fake.port())))
        .await
        .unwrap();

        let err = env.reset().await.unwrap_err();
        assert!(matches!(
            err,
            EnvError::Descriptor(crate::mission::DescriptorError::UnsupportedMode)
        ));
        assert_eq!(fake.stats().connections, 0);
        assert_eq!(env.state(), LifecycleState::Idle);
    }
}
