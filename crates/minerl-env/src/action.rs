//! Action space and action marshalling.
//!
//! Component kinds are resolved when the space is declared; marshalling an
//! action is a single match per component. Commands render as
//! `"<name> <value>"`, newline-joined in declaration order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Kind of one named action component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Enumerated choice over an ordered list of members.
    Enum { values: Vec<String> },
    /// Continuous box; `shape` is the declared array shape (empty for scalars).
    Box {
        shape: Vec<usize>,
        low: f64,
        high: f64,
    },
}

impl ActionKind {
    fn element_count(shape: &[usize]) -> usize {
        shape.iter().product()
    }
}

/// Value supplied for one action component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    Index(i64),
    Scalar(f64),
    Member(String),
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
}

impl From<i64> for ActionValue {
    fn from(v: i64) -> Self {
        Self::Index(v)
    }
}

impl From<f64> for ActionValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<&str> for ActionValue {
    fn from(v: &str) -> Self {
        Self::Member(v.to_string())
    }
}

impl From<Vec<f64>> for ActionValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<Vec<Vec<f64>>> for ActionValue {
    fn from(v: Vec<Vec<f64>>) -> Self {
        Self::Matrix(v)
    }
}

/// One action: component name → value.
pub type Action = IndexMap<String, ActionValue>;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action component '{0}'")]
    UnknownComponent(String),
    #[error("enum action {name} must be str or int, got {value:?}")]
    EnumType { name: String, value: ActionValue },
    #[error("enum action {name} index {index} out of range for {len} values")]
    EnumIndex { name: String, index: i64, len: usize },
    #[error("invalid string value for enum action {name}: {value}")]
    EnumMember { name: String, value: String },
    #[error("box action {name} is a string, expected numbers: {value}")]
    BoxString { name: String, value: String },
    #[error("box action {name} expects {expected} values, got {actual}")]
    BoxShape {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Ordered set of named action components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpace {
    components: IndexMap<String, ActionKind>,
}

impl ActionSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enum<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components.insert(
            name.into(),
            ActionKind::Enum {
                values: values.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn with_box(mut self, name: impl Into<String>, shape: Vec<usize>, low: f64, high: f64) -> Self {
        self.components
            .insert(name.into(), ActionKind::Box { shape, low, high });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ActionKind> {
        self.components.get(name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ActionKind)> {
        self.components.iter()
    }

    /// Render an action as the newline-joined command body of a step.
    ///
    /// Components absent from `action` are skipped.
    pub fn marshal(&self, action: &Action) -> Result<String, ActionError> {
        if let Some(unknown) = action.keys().find(|k| !self.components.contains_key(*k)) {
            return Err(ActionError::UnknownComponent(unknown.clone()));
        }

        let mut lines = Vec::with_capacity(action.len());
        for (name, kind) in &self.components {
            let Some(value) = action.get(name) else {
                continue;
            };
            let rendered = match kind {
                ActionKind::Enum { values } => render_enum(name, values, value)?,
                ActionKind::Box { shape, .. } => render_box(name, shape, value)?,
            };
            lines.push(format!("{} {}", name, rendered));
        }
        Ok(lines.join("\n"))
    }
}

fn render_enum(name: &str, values: &[String], value: &ActionValue) -> Result<String, ActionError> {
    match value {
        ActionValue::Index(index) => usize::try_from(*index)
            .ok()
            .and_then(|i| values.get(i))
            .cloned()
            .ok_or_else(|| ActionError::EnumIndex {
                name: name.to_string(),
                index: *index,
                len: values.len(),
            }),
        ActionValue::Member(member) => {
            if values.iter().any(|v| v == member) {
                Ok(member.clone())
            } else {
                Err(ActionError::EnumMember {
                    name: name.to_string(),
                    value: member.clone(),
                })
            }
        }
        other => Err(ActionError::EnumType {
            name: name.to_string(),
            value: other.clone(),
        }),
    }
}

fn render_box(name: &str, shape: &[usize], value: &ActionValue) -> Result<String, ActionError> {
    let flat: Vec<f64> = match value {
        ActionValue::Member(s) => {
            return Err(ActionError::BoxString {
                name: name.to_string(),
                value: s.clone(),
            });
        }
        ActionValue::Index(i) => vec![*i as f64],
        ActionValue::Scalar(x) => vec![*x],
        ActionValue::Vector(v) => v.clone(),
        ActionValue::Matrix(rows) => rows.iter().flatten().copied().collect(),
    };

    let expected = ActionKind::element_count(shape);
    if flat.len() != expected {
        return Err(ActionError::BoxShape {
            name: name.to_string(),
            expected,
            actual: flat.len(),
        });
    }

    // Integers render without a fractional part.
    if let ActionValue::Index(i) = value {
        return Ok(i.to_string());
    }
    Ok(flat
        .iter()
        .map(|x| format_number(*x))
        .collect::<Vec<_>>()
        .join(" "))
}

/// Float rendering the client parses: whole numbers keep one decimal place.
fn format_number(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}
