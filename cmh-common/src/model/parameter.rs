// cmh-common/src/model/parameter.rs
use std::fmt;

use serde::{Deserialize, Serialize};

/// A configuration value passed to a module (`SANITIZE_ADDRESS ON`,
/// `CXX_STANDARD 20`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            Self::Bool(_) => ParameterKind::Bool,
            Self::Int(_) => ParameterKind::Int,
            Self::String(_) => ParameterKind::String,
        }
    }

    /// Type-tagged form used when hashing, so `1` and `"1"` never collide.
    pub fn canonical(&self) -> String {
        match self {
            Self::Bool(b) => format!("bool:{b}"),
            Self::Int(i) => format!("int:{i}"),
            Self::String(s) => format!("str:{s}"),
        }
    }

    /// The value as CMake sees it: `ON`/`OFF`, digits, or the raw string
    /// without any quoting.
    pub fn cmake_value(&self) -> String {
        match self {
            Self::Bool(true) => "ON".to_string(),
            Self::Bool(false) => "OFF".to_string(),
            Self::Int(i) => i.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, "ON"),
            Self::Bool(false) => write!(f, "OFF"),
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Bool,
    Int,
    String,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::String => write!(f, "string"),
        }
    }
}

/// Declared schema of one module parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<ParameterValue>,
    /// Empty means any value of the right kind.
    #[serde(default)]
    pub allowed: Vec<ParameterValue>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Checks a value against the schema, returning the reason on mismatch.
    pub fn validate(&self, value: &ParameterValue) -> std::result::Result<(), String> {
        if value.kind() != self.kind {
            return Err(format!("expected a {} value, got {}", self.kind, value));
        }
        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            let allowed = self
                .allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!("{value} is not one of [{allowed}]"));
        }
        Ok(())
    }
}
