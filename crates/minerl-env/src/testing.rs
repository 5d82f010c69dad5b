//! Test support: a scripted Malmo client on a loopback socket and a mock
//! instance provider that points at it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::bridge::codec::MessageCodec;
use crate::instance::{Instance, InstanceProvider, LaunchError};
use crate::mission::FrameGeometry;

/// Mission template with one VideoProducer.
pub fn mission_xml(width: usize, height: usize, want_depth: bool) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>
<Mission xmlns="http://ProjectMalmo.microsoft.com" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <About><Summary>$(ENV_NAME)</Summary></About>
  <ServerSection>
    <ServerHandlers>
      <FileWorldGenerator src="worlds/treechop" forceReset="true"/>
      <ServerQuitFromTimeUp timeLimitMs="300000"/>
    </ServerHandlers>
  </ServerSection>
  <AgentSection mode="Survival">
    <Name>MineRLAgent</Name>
    <AgentHandlers>
      <VideoProducer want_depth="{depth}">
        <Width>{width}</Width>
        <Height>{height}</Height>
      </VideoProducer>
      <ObservationFromFullInventory/>
    </AgentHandlers>
  </AgentSection>
</Mission>
"#,
        depth = want_depth,
        width = width,
        height = height,
    )
}

/// A port nothing listens on.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// How the fake client answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub geometry: FrameGeometry,
    /// Mission-init replies of 0 before the first 1.
    pub init_nacks: u32,
    /// Peeks answered with an empty frame before a real one.
    pub peek_empty: u32,
    /// Done flag returned by peeks.
    pub peek_done: bool,
    /// Steps (1-based, counted across connections) from which done is reported.
    pub step_done_after: Option<u32>,
    /// Steps on which the connection is dropped without a reply.
    pub drop_on_steps: Vec<u32>,
    /// Step on which the fake stops replying.
    pub stall_on_step: Option<u32>,
    /// Steps answered with an empty frame.
    pub step_empty_frames: u32,
    pub reward: f64,
    pub quit_nacks: u32,
    pub close_on_accept: bool,
    /// Connections served before further ones are closed on accept.
    pub max_connections: Option<u32>,
    pub info: serde_json::Value,
    /// Whether step replies carry an info frame.
    pub step_info: bool,
    pub status: String,
    /// Find replies of 0 before `find_port`.
    pub find_zero: u32,
    pub find_port: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            geometry: FrameGeometry::new(3, 4, 3),
            init_nacks: 0,
            peek_empty: 0,
            peek_done: false,
            step_done_after: None,
            drop_on_steps: Vec::new(),
            stall_on_step: None,
            step_empty_frames: 0,
            reward: 1.5,
            quit_nacks: 0,
            close_on_accept: false,
            max_connections: None,
            info: serde_json::json!({"compassAngle": 45.0}),
            step_info: true,
            status: "{}".to_string(),
            find_zero: 0,
            find_port: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub connections: u32,
    pub open: u32,
    pub inits: u32,
    pub peeks: u32,
    pub steps: u32,
    pub quits: u32,
    pub finds: u32,
}

#[derive(Default)]
struct Shared {
    messages: Vec<String>,
    stats: Stats,
}

pub struct FakeMalmo {
    port: u16,
    shared: Arc<Mutex<Shared>>,
}

impl FakeMalmo {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let script = Arc::new(script);

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok((stream, _)) = listener.accept().await {
                accepted += 1;
                if script.close_on_accept || script.max_connections.is_some_and(|m| accepted > m) {
                    drop(stream);
                    continue;
                }
                {
                    let mut s = accept_shared.lock().unwrap();
                    s.stats.connections += 1;
                    s.stats.open += 1;
                }
                let shared = Arc::clone(&accept_shared);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    serve(stream, &script, &shared).await;
                    shared.lock().unwrap().stats.open -= 1;
                });
            }
        });

        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn messages(&self) -> Vec<String> {
        self.shared.lock().unwrap().messages.clone()
    }

    pub fn stats(&self) -> Stats {
        self.shared.lock().unwrap().stats
    }

    pub async fn wait_for_messages(&self, n: usize) {
        self.wait_until(|shared| shared.messages.len() >= n).await;
    }

    pub async fn wait_for_open(&self, open: u32) {
        self.wait_until(|shared| shared.stats.open == open).await;
    }

    async fn wait_until(&self, cond: impl Fn(&Shared) -> bool) {
        for _ in 0..500 {
            {
                let shared = self.shared.lock().unwrap();
                if cond(&*shared) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake Malmo condition not reached");
    }
}

fn u32_frame(v: u32) -> Bytes {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

/// Frame in wire order: row `r` (bottom-up) filled with byte `r`.
pub fn wire_frame(geometry: FrameGeometry) -> Bytes {
    let mut data = Vec::with_capacity(geometry.frame_len());
    for row in 0..geometry.height {
        data.extend(std::iter::repeat_n(row as u8, geometry.row_len()));
    }
    Bytes::from(data)
}

async fn serve(stream: TcpStream, script: &Script, shared: &Mutex<Shared>) {
    let mut framed = Framed::new(stream, MessageCodec::new());
    let info = Bytes::from(script.info.to_string());

    while let Some(Ok(frame)) = framed.next().await {
        let text = String::from_utf8_lossy(&frame).into_owned();
        shared.lock().unwrap().messages.push(text.clone());

        let replies: Vec<Bytes> = if text.starts_with("<MalmoEnv") {
            Vec::new()
        } else if text.starts_with("<MissionInit") {
            let Some(Ok(token)) = framed.next().await else {
                return;
            };
            let mut s = shared.lock().unwrap();
            s.messages.push(String::from_utf8_lossy(&token).into_owned());
            s.stats.inits += 1;
            let ok = s.stats.inits > script.init_nacks;
            vec![u32_frame(ok as u32)]
        } else if text == "<Peek/>" {
            let peeks = {
                let mut s = shared.lock().unwrap();
                s.stats.peeks += 1;
                s.stats.peeks
            };
            let pixels = if peeks <= script.peek_empty {
                Bytes::new()
            } else {
                wire_frame(script.geometry)
            };
            vec![pixels, info.clone(), Bytes::from(vec![script.peek_done as u8])]
        } else if text == "<Quit/>" {
            let mut s = shared.lock().unwrap();
            s.stats.quits += 1;
            vec![u32_frame((s.stats.quits > script.quit_nacks) as u32)]
        } else if text == "<Status/>" {
            vec![Bytes::from(script.status.clone())]
        } else if text.starts_with("<Find>") {
            let mut s = shared.lock().unwrap();
            s.stats.finds += 1;
            let port = if s.stats.finds > script.find_zero {
                script.find_port
            } else {
                0
            };
            vec![u32_frame(port)]
        } else if text.starts_with("<Init>") {
            vec![u32_frame(1)]
        } else if text.starts_with("<Step") {
            let step = {
                let mut s = shared.lock().unwrap();
                s.stats.steps += 1;
                s.stats.steps
            };
            if script.drop_on_steps.contains(&step) {
                return;
            }
            if script.stall_on_step == Some(step) {
                std::future::pending::<()>().await;
            }
            let pixels = if step <= script.step_empty_frames {
                Bytes::new()
            } else {
                wire_frame(script.geometry)
            };
            let done = script.step_done_after.is_some_and(|d| step >= d);
            let mut reply = script.reward.to_be_bytes().to_vec();
            reply.extend_from_slice(&[done as u8, script.step_info as u8]);
            if script.step_info {
                vec![pixels, Bytes::from(reply), info.clone()]
            } else {
                vec![pixels, Bytes::from(reply)]
            }
        } else {
            Vec::new()
        };

        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct MockState {
    events: Vec<&'static str>,
    intermittent_failures: u32,
}

/// Provider whose instances all point at one fake client.
#[derive(Clone)]
pub struct MockLauncher {
    port: u16,
    log_dir: Option<PathBuf>,
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            log_dir: None,
            state: Arc::default(),
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Fail the next `n` launches as intermittent build errors.
    pub fn with_intermittent_failures(self, n: u32) -> Self {
        self.state.lock().unwrap().intermittent_failures = n;
        self
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl InstanceProvider for MockLauncher {
    async fn launch(&self) -> Result<Box<dyn Instance>, LaunchError> {
        let mut state = self.state.lock().unwrap();
        if state.intermittent_failures > 0 {
            state.intermittent_failures -= 1;
            state.events.push("failed_launch");
            return Err(LaunchError::IntermittentBuild("gradle race".to_string()));
        }
        state.events.push("launch");
        Ok(Box::new(MockInstance {
            port: self.port,
            log_dir: self.log_dir.clone(),
            running: true,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockInstance {
    port: u16,
    log_dir: Option<PathBuf>,
    running: bool,
    state: Arc<Mutex<MockState>>,
}

impl Instance for MockInstance {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn kill(&mut self) {
        self.running = false;
        self.state.lock().unwrap().events.push("kill");
    }

    fn minecraft_dir(&self) -> Option<&std::path::Path> {
        self.log_dir.as_deref()
    }
}
