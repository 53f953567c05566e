use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use thiserror::Error;

use crate::dependency::{ConstraintOrigin, Requester};
use crate::model::ParameterValue;

#[derive(Error, Debug, Clone)]
pub enum CmhError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Cache Error: {0}")]
    Cache(String),

    #[error("Checksum Error: {0}")]
    Checksum(String),

    #[error("Generic Error: {0}")]
    Generic(String),

    #[error("Registry load error in {origin}{}: {message}", entry_suffix(.entry))]
    RegistryLoad {
        origin: String,
        entry: Option<String>,
        message: String,
    },

    #[error("Module '{name}' not found{}", requested_by(.requesters))]
    ModuleNotFound {
        name: String,
        requesters: Vec<Requester>,
    },

    #[error("Invalid version constraint '{expression}': {reason}")]
    InvalidConstraint { expression: String, reason: String },

    #[error("Invalid parameter '{parameter}' for module '{module}': {reason}")]
    InvalidParameter {
        module: String,
        parameter: String,
        reason: String,
    },

    #[error(
        "Version conflict for module '{module}': no version satisfies {}; available: [{}]",
        join(.requesters, " and "),
        join(.available, ", ")
    )]
    VersionConflict {
        module: String,
        requesters: Vec<ConstraintOrigin>,
        available: Vec<Version>,
    },

    #[error(
        "Parameter conflict for module '{module}': '{parameter}' is {first_value} from {first} but {second_value} from {second}"
    )]
    ParameterConflict {
        module: String,
        parameter: String,
        first: Requester,
        first_value: ParameterValue,
        second: Requester,
        second_value: ParameterValue,
    },

    #[error("Module '{module}' conflicts with '{conflicts_with}', both are part of the resolution")]
    ModuleConflict {
        module: String,
        conflicts_with: String,
    },

    #[error("Resolution depth exceeded at module '{module}': depth {depth} is over the limit of {limit}")]
    ResolutionDepthExceeded {
        module: String,
        depth: usize,
        limit: usize,
    },

    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Module '{0}' appears more than once in the dependency graph")]
    DuplicateModule(String),

    #[error("Module '{module}' depends on '{dependency}', which is not part of the graph")]
    MissingDependency { module: String, dependency: String },

    #[error("Failed to materialize '{module}' ({fingerprint}): {cause}")]
    Materialization {
        module: String,
        fingerprint: String,
        #[source]
        cause: Arc<CmhError>,
    },

    #[error("Materialization of '{module}' ({fingerprint}) timed out after {}", fmt_duration(.timeout))]
    MaterializationTimeout {
        module: String,
        fingerprint: String,
        timeout: Duration,
    },

    #[error("Module '{module}' was not materialized because dependency '{dependency}' failed")]
    DependencyFailed { module: String, dependency: String },
}

impl CmhError {
    /// Name of the module the error is about, when there is exactly one.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::ModuleNotFound { name, .. } => Some(name),
            Self::InvalidParameter { module, .. }
            | Self::VersionConflict { module, .. }
            | Self::ParameterConflict { module, .. }
            | Self::ModuleConflict { module, .. }
            | Self::ResolutionDepthExceeded { module, .. }
            | Self::MissingDependency { module, .. }
            | Self::Materialization { module, .. }
            | Self::MaterializationTimeout { module, .. }
            | Self::DependencyFailed { module, .. } => Some(module),
            Self::DuplicateModule(name) => Some(name),
            _ => None,
        }
    }
}

fn join<T: Display>(items: &[T], separator: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

fn requested_by(requesters: &[Requester]) -> String {
    if requesters.is_empty() {
        String::new()
    } else {
        format!(" (requested by {})", join(requesters, ", "))
    }
}

fn entry_suffix(entry: &Option<String>) -> String {
    entry
        .as_ref()
        .map(|e| format!(" (entry {e})"))
        .unwrap_or_default()
}

fn fmt_duration(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

impl From<std::io::Error> for CmhError {
    fn from(err: std::io::Error) -> Self {
        CmhError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CmhError {
    fn from(err: serde_json::Error) -> Self {
        CmhError::Json(Arc::new(err))
    }
}

impl From<semver::Error> for CmhError {
    fn from(err: semver::Error) -> Self {
        CmhError::SemVer(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CmhError>;
