//! Observation space, pixel frames and info-to-observation handlers.
//!
//! A step or peek yields raw pixels and a JSON info object. The pixels become a
//! `Frame`; the info object plus the frame form an `InfoPayload`, and each key
//! declared by the observation space is produced by the handler registered for
//! it.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use rand::Rng;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::bridge::protocol::ProtocolError;
use crate::mission::FrameGeometry;

/// One video frame in row-major `height x width x depth` layout, top row first.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    height: usize,
    width: usize,
    depth: usize,
    data: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape())
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Frame", 1)?;
        state.serialize_field("shape", &self.shape())?;
        state.end()
    }
}

impl Frame {
    /// Frame from the client's bottom-up pixel buffer. An empty buffer yields
    /// a zero-filled frame.
    pub fn from_remote(raw: &[u8], geometry: FrameGeometry) -> Result<Self, ProtocolError> {
        if raw.is_empty() {
            return Ok(Self::zeros(geometry));
        }
        if raw.len() != geometry.frame_len() {
            return Err(ProtocolError::FrameSize {
                actual: raw.len(),
                height: geometry.height,
                width: geometry.width,
                depth: geometry.depth,
            });
        }

        let row = geometry.row_len();
        let mut data = Vec::with_capacity(raw.len());
        if row > 0 {
            for chunk in raw.chunks_exact(row).rev() {
                data.extend_from_slice(chunk);
            }
        }
        Ok(Self {
            height: geometry.height,
            width: geometry.width,
            depth: geometry.depth,
            data,
        })
    }

    pub fn zeros(geometry: FrameGeometry) -> Self {
        Self {
            height: geometry.height,
            width: geometry.width,
            depth: geometry.depth,
            data: vec![0; geometry.frame_len()],
        }
    }

    fn random<R: Rng>(geometry: FrameGeometry, rng: &mut R) -> Self {
        let mut frame = Self::zeros(geometry);
        rng.fill(&mut frame.data[..]);
        frame
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.depth]
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.height, self.width, self.depth)
    }

    /// Channel values of the pixel at `(row, col)`, row 0 at the top.
    pub fn pixel(&self, row: usize, col: usize) -> Option<&[u8]> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let start = (row * self.width + col) * self.depth;
        self.data.get(start..start + self.depth)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Kind of one declared observation key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationKind {
    Pixels { height: usize, width: usize, depth: usize },
    /// Per-item counts bounded by `max`.
    Counts { items: Vec<String>, max: i64 },
    Scalar { low: f64, high: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ObservationValue {
    Pixels(Frame),
    Counts(IndexMap<String, i64>),
    Scalar(f64),
    Json(Value),
}

/// Observation keyed like its space.
pub type Observation = IndexMap<String, ObservationValue>;

/// Ordered set of declared observation keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservationSpace {
    keys: IndexMap<String, ObservationKind>,
}

impl ObservationSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pixels(mut self, name: impl Into<String>, geometry: FrameGeometry) -> Self {
        self.keys.insert(
            name.into(),
            ObservationKind::Pixels {
                height: geometry.height,
                width: geometry.width,
                depth: geometry.depth,
            },
        );
        self
    }

    pub fn with_counts<I, S>(mut self, name: impl Into<String>, items: I, max: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.insert(
            name.into(),
            ObservationKind::Counts {
                items: items.into_iter().map(Into::into).collect(),
                max,
            },
        );
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.keys
            .insert(name.into(), ObservationKind::Scalar { low, high });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ObservationKind> {
        self.keys.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.keys.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ObservationKind)> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Random observation drawn from the space; stands in for a real one when
    /// a step loses its connection.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Observation {
        self.keys
            .iter()
            .map(|(name, kind)| {
                let value = match kind {
                    ObservationKind::Pixels {
                        height,
                        width,
                        depth,
                    } => ObservationValue::Pixels(Frame::random(
                        FrameGeometry::new(*height, *width, *depth),
                        rng,
                    )),
                    ObservationKind::Counts { items, max } => ObservationValue::Counts(
                        items
                            .iter()
                            .map(|item| (item.clone(), rng.gen_range(0..=(*max).max(0))))
                            .collect(),
                    ),
                    ObservationKind::Scalar { low, high } => {
                        ObservationValue::Scalar(if low < high {
                            rng.gen_range(*low..=*high)
                        } else {
                            *low
                        })
                    }
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// JSON info from the client together with the decoded frame (`pov`).
#[derive(Debug, Clone)]
pub struct InfoPayload {
    pub json: Map<String, Value>,
    pub pov: Frame,
}

impl InfoPayload {
    pub fn new(json: Map<String, Value>, pov: Frame) -> Self {
        Self { json, pov }
    }
}

type CustomHandler = dyn Fn(&InfoPayload, &ObservationKind) -> ObservationValue + Send + Sync;

/// Produces one observation value from an info payload.
#[derive(Clone)]
pub enum ObservationHandler {
    /// The decoded frame.
    Pixel,
    /// Item counts summed over inventory stacks.
    InventoryAggregate,
    /// Compass angle in degrees.
    CompassAngle,
    Custom(Arc<CustomHandler>),
}

impl fmt::Debug for ObservationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pixel => f.write_str("Pixel"),
            Self::InventoryAggregate => f.write_str("InventoryAggregate"),
            Self::CompassAngle => f.write_str("CompassAngle"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ObservationHandler {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&InfoPayload, &ObservationKind) -> ObservationValue + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn apply(&self, payload: &InfoPayload, kind: &ObservationKind) -> ObservationValue {
        match self {
            Self::Pixel => ObservationValue::Pixels(payload.pov.clone()),
            Self::InventoryAggregate => {
                let items = match kind {
                    ObservationKind::Counts { items, .. } => items.as_slice(),
                    _ => &[],
                };
                ObservationValue::Counts(aggregate_inventory(&payload.json, items))
            }
            Self::CompassAngle => ObservationValue::Scalar(compass_angle(&payload.json)),
            Self::Custom(f) => f(payload, kind),
        }
    }
}

/// Item names the client reports under a different name.
fn canonical_item(name: &str) -> &str {
    match name {
        "log2" => "log",
        other => other,
    }
}

fn aggregate_inventory(info: &Map<String, Value>, items: &[String]) -> IndexMap<String, i64> {
    let mut counts: IndexMap<String, i64> = items.iter().map(|i| (i.clone(), 0)).collect();
    let Some(stacks) = info.get("inventory").and_then(Value::as_array) else {
        return counts;
    };
    for stack in stacks {
        let Some(kind) = stack.get("type").and_then(Value::as_str) else {
            continue;
        };
        let quantity = stack.get("quantity").and_then(Value::as_i64).unwrap_or(0);
        if let Some(count) = counts.get_mut(canonical_item(kind)) {
            *count += quantity;
        }
    }
    counts
}

fn compass_angle(info: &Map<String, Value>) -> f64 {
    info.get("compassAngle")
        .or_else(|| info.get("compass").and_then(|c| c.get("angle")))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Handlers keyed by observation name.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: IndexMap<String, ObservationHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty()
            .with("pov", ObservationHandler::Pixel)
            .with("inventory", ObservationHandler::InventoryAggregate)
            .with("compassAngle", ObservationHandler::CompassAngle)
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: IndexMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, handler: ObservationHandler) -> Self {
        self.register(key, handler);
        self
    }

    pub fn register(&mut self, key: impl Into<String>, handler: ObservationHandler) {
        self.handlers.insert(key.into(), handler);
    }

    pub fn get(&self, key: &str) -> Option<&ObservationHandler> {
        self.handlers.get(key)
    }

    /// First key of `space` with no registered handler.
    pub fn missing_for<'a>(&self, space: &'a ObservationSpace) -> Option<&'a str> {
        space
            .keys()
            .find(|k| !self.handlers.contains_key(k.as_str()))
            .map(String::as_str)
    }

    /// Build the observation for `space`. A key without a handler yields an
    /// empty observation.
    pub fn process(&self, payload: &InfoPayload, space: &ObservationSpace) -> Observation {
        let mut observation = Observation::with_capacity(space.len());
        for (key, kind) in space.iter() {
            let Some(handler) = self.handlers.get(key) else {
                tracing::error!(key = %key, "No observation handler registered");
                return Observation::new();
            };
            observation.insert(key.clone(), handler.apply(payload, kind));
        }
        observation
    }
}
