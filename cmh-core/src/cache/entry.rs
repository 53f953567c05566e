// cmh-core/src/cache/entry.rs
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use cmh_common::model::ParameterValue;
use semver::Version;
use serde::{Deserialize, Serialize};

/// File written next to every cached artifact. Its presence marks the
/// artifact as complete.
pub const MANIFEST_FILENAME: &str = "cmh-entry.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// A materialization is in flight.
    Pending,
    Ready,
    /// The last attempt failed. Failed entries are dropped right after their
    /// waiters are told, so this state is only ever observed transiently.
    Failed,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// On-disk record of one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryManifest {
    pub fingerprint: String,
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    pub size_bytes: u64,
    /// Tree digest of the artifact, manifest excluded.
    pub digest: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub created_at: u64,
}

/// Read-only view of an entry, as returned by `CacheManager::info`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntrySnapshot {
    pub fingerprint: String,
    pub name: String,
    pub version: Version,
    pub parameters: BTreeMap<String, ParameterValue>,
    pub path: PathBuf,
    pub state: CacheState,
    pub size_bytes: u64,
    pub last_used: SystemTime,
}

/// Selects entries for `CacheManager::clear`. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheFilter {
    pub name: Option<String>,
    pub version: Option<Version>,
}

impl CacheFilter {
    pub fn module(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn matches(&self, name: &str, version: &Version) -> bool {
        self.name.as_deref().is_none_or(|n| n == name)
            && self.version.as_ref().is_none_or(|v| v == version)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub ready: usize,
    pub pending: usize,
    pub total_bytes: u64,
}
