//! Session descriptor: the finalized mission document sent at mission init.
//!
//! A mission template is trimmed to its `<Mission>` root, checked for
//! unsupported coordination modes, has relative world paths rewritten and is
//! wrapped in a `MissionInit` envelope carrying the experiment id and role.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::DEFAULT_ENV_NAME;
use crate::version::MALMO_VERSION;

const MISSION_TAG: &str = "<Mission";

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("mission xml must contain <Mission> tag")]
    MissingMissionTag,
    #[error("malformed mission xml: {0}")]
    Malformed(String),
    #[error("turn based or multi-agent environments not supported")]
    UnsupportedMode,
    #[error("no VideoProducer declared for role {role}")]
    MissingVideoProducer { role: u32 },
    #[error("invalid VideoProducer for role {role}: {reason}")]
    InvalidVideoProducer { role: u32, reason: String },
    #[error("failed to read mission template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the mission template comes from.
#[derive(Debug, Clone)]
pub enum MissionSource {
    /// Template file; relative world paths resolve against its directory.
    File(PathBuf),
    /// In-memory template with an optional directory for relative paths.
    Inline {
        xml: String,
        base_dir: Option<PathBuf>,
    },
}

impl MissionSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn inline(xml: impl Into<String>) -> Self {
        Self::Inline {
            xml: xml.into(),
            base_dir: None,
        }
    }

    fn load(&self) -> Result<(String, Option<PathBuf>), DescriptorError> {
        match self {
            Self::File(path) => {
                let xml = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
                    path: path.clone(),
                    source,
                })?;
                Ok((xml, path.parent().map(Path::to_path_buf)))
            }
            Self::Inline { xml, base_dir } => Ok((xml.clone(), base_dir.clone())),
        }
    }
}

/// Run-time parameters applied while building a descriptor.
#[derive(Debug, Clone)]
pub struct MissionParams {
    pub role: u32,
    pub env_name: String,
    pub missions_dir: Option<PathBuf>,
    pub platform_version: String,
}

impl Default for MissionParams {
    fn default() -> Self {
        Self {
            role: 0,
            env_name: DEFAULT_ENV_NAME.to_string(),
            missions_dir: None,
            platform_version: MALMO_VERSION.to_string(),
        }
    }
}

/// Frame geometry declared by the role's VideoProducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    pub height: usize,
    pub width: usize,
    /// 4 when a depth channel is requested, otherwise 3.
    pub depth: usize,
}

impl FrameGeometry {
    pub fn new(height: usize, width: usize, depth: usize) -> Self {
        Self {
            height,
            width,
            depth,
        }
    }

    /// Bytes in one frame.
    pub fn frame_len(&self) -> usize {
        self.height * self.width * self.depth
    }

    /// Bytes in one row of pixels.
    pub fn row_len(&self) -> usize {
        self.width * self.depth
    }
}

/// Identity of the session as seen by the remote client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub experiment_id: String,
    pub role: u32,
    /// Incremented once per start-up attempt.
    pub reset_count: u64,
    /// Single-shot: cleared at the end of every reset.
    pub seed: Option<i64>,
}

impl SessionIdentity {
    pub fn new(role: u32) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// `experiment_id:role:reset_count`, used by find/reinit.
    pub fn token(&self) -> String {
        format!("{}:{}:{}", self.experiment_id, self.role, self.reset_count)
    }

    /// Mission-init token: `token:agent_count:synchronous[:seed]`.
    pub fn init_token(&self, agent_count: u32, synchronous: bool) -> String {
        let mut token = format!("{}:{}:{}", self.token(), agent_count, synchronous);
        if let Some(seed) = self.seed {
            token.push_str(&format!(":{}", seed));
        }
        token
    }
}

/// Finalized mission document plus what the session needs from it.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    mission: String,
    experiment_id: String,
    role: u32,
    geometry: FrameGeometry,
    platform_version: String,
    server_port: Option<u16>,
}

impl SessionDescriptor {
    pub fn build(source: &MissionSource, params: &MissionParams) -> Result<Self, DescriptorError> {
        let (template, origin_dir) = source.load()?;
        Self::from_template(&template, origin_dir.as_deref(), params)
    }

    pub fn from_template(
        template: &str,
        origin_dir: Option<&Path>,
        params: &MissionParams,
    ) -> Result<Self, DescriptorError> {
        let mut xml = template.replace("$(ENV_NAME)", &params.env_name);
        if let Some(dir) = &params.missions_dir {
            xml = xml.replace("$(MISSIONS_DIR)", &dir.to_string_lossy());
        }

        let start = xml.find(MISSION_TAG).ok_or(DescriptorError::MissingMissionTag)?;
        let mut mission = xml[start..].to_string();

        let (rewrites, geometry) = {
            let doc = roxmltree::Document::parse(&mission)
                .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
            if doc.root_element().tag_name().name() != "Mission" {
                return Err(DescriptorError::MissingMissionTag);
            }
            if doc
                .descendants()
                .any(|n| n.tag_name().name() == "TurnBasedCommands")
            {
                return Err(DescriptorError::UnsupportedMode);
            }
            let rewrites = match origin_dir {
                Some(dir) => world_path_rewrites(&doc, &mission, dir),
                None => Vec::new(),
            };
            (rewrites, video_geometry(&doc, params.role)?)
        };

        // Apply back to front so earlier offsets stay valid.
        for (range, value) in rewrites.into_iter().rev() {
            mission.replace_range(range, &value);
        }

        let experiment_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            %experiment_id,
            role = params.role,
            height = geometry.height,
            width = geometry.width,
            depth = geometry.depth,
            "Built session descriptor"
        );

        Ok(Self {
            mission,
            experiment_id,
            role: params.role,
            geometry,
            platform_version: params.platform_version.clone(),
            server_port: None,
        })
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn role(&self) -> u32 {
        self.role
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// The `<Mission>` element after rewriting.
    pub fn mission(&self) -> &str {
        &self.mission
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    /// Inject the integrated server port discovered by `find_server`.
    pub fn set_server_port(&mut self, port: u16) {
        self.server_port = Some(port);
    }

    /// Render the `MissionInit` document sent at mission init.
    pub fn document(&self) -> String {
        let server_connection = match self.server_port {
            Some(port) => format!(
                "<MinecraftServerConnection address=\"127.0.0.1\" port=\"{}\"/>",
                port
            ),
            None => String::new(),
        };
        format!(
            concat!(
                "<MissionInit xmlns=\"http://ProjectMalmo.microsoft.com\" ",
                "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" ",
                "SchemaVersion=\"\" PlatformVersion=\"{version}\">",
                "{mission}",
                "<ExperimentUID>{uid}</ExperimentUID>",
                "{server}",
                "<ClientRole>{role}</ClientRole>",
                "<ClientAgentConnection>",
                "<ClientIPAddress>127.0.0.1</ClientIPAddress>",
                "<ClientMissionControlPort>0</ClientMissionControlPort>",
                "<ClientCommandsPort>0</ClientCommandsPort>",
                "<AgentIPAddress>127.0.0.1</AgentIPAddress>",
                "<AgentMissionControlPort>0</AgentMissionControlPort>",
                "<AgentVideoPort>0</AgentVideoPort>",
                "<AgentDepthPort>0</AgentDepthPort>",
                "<AgentLuminancePort>0</AgentLuminancePort>",
                "<AgentObservationsPort>0</AgentObservationsPort>",
                "<AgentRewardsPort>0</AgentRewardsPort>",
                "<AgentColourMapPort>0</AgentColourMapPort>",
                "</ClientAgentConnection>",
                "</MissionInit>"
            ),
            version = self.platform_version,
            mission = self.mission,
            uid = self.experiment_id,
            server = server_connection,
            role = self.role,
        )
    }
}

/// Byte ranges of relative `FileWorldGenerator src` values and their
/// replacements, resolved against the template's directory.
fn world_path_rewrites(
    doc: &roxmltree::Document<'_>,
    text: &str,
    origin_dir: &Path,
) -> Vec<(std::ops::Range<usize>, String)> {
    let mut rewrites = Vec::new();
    for node in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "FileWorldGenerator")
    {
        let Some(src) = node.attribute("src") else {
            continue;
        };
        if Path::new(src).is_absolute() {
            continue;
        }
        let range = node.range();
        let Some(value_range) = attribute_value_range(&text[range.clone()], "src") else {
            continue;
        };
        let resolved = origin_dir.join(src);
        tracing::debug!(from = %src, to = %resolved.display(), "Rewriting world path");
        rewrites.push((
            range.start + value_range.start..range.start + value_range.end,
            escape_attr(&resolved.to_string_lossy()),
        ));
    }
    rewrites
}

/// Range of an attribute's raw value inside an element's source text.
fn attribute_value_range(element: &str, name: &str) -> Option<std::ops::Range<usize>> {
    let tag_end = element.find('>')?;
    let start_tag = &element[..tag_end];
    let mut search = 0;
    while let Some(found) = start_tag[search..].find(name) {
        let at = search + found;
        search = at + name.len();
        let preceded_by_space = start_tag[..at]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace);
        if !preceded_by_space {
            continue;
        }
        let rest = start_tag[search..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let value_start = start_tag.len() - rest.len() + 1;
        let value_len = start_tag[value_start..].find(quote)?;
        return Some(value_start..value_start + value_len);
    }
    None
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn video_geometry(doc: &roxmltree::Document<'_>, role: u32) -> Result<FrameGeometry, DescriptorError> {
    let producer = doc
        .descendants()
        .filter(|n| n.tag_name().name() == "VideoProducer")
        .nth(role as usize)
        .ok_or(DescriptorError::MissingVideoProducer { role })?;

    let dimension = |name: &str| -> Result<usize, DescriptorError> {
        producer
            .children()
            .find(|n| n.tag_name().name() == name)
            .and_then(|n| n.text())
            .and_then(|t| t.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| DescriptorError::InvalidVideoProducer {
                role,
                reason: format!("missing or invalid <{}>", name),
            })
    };

    let width = dimension("Width")?;
    let height = dimension("Height")?;
    let want_depth = matches!(producer.attribute("want_depth"), Some("true") | Some("1"));

    Ok(FrameGeometry {
        height,
        width,
        depth: if want_depth { 4 } else { 3 },
    })
}
