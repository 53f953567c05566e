// cmh-common/src/dependency/requirement.rs
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ParameterValue, VersionConstraint};

/// Who asked for a module during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Requester {
    /// A top-level request, by position in the request list.
    Root(usize),
    /// Another module declaring a dependency.
    Module(String),
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(index) => write!(f, "root request #{}", index + 1),
            Self::Module(name) => write!(f, "module '{name}'"),
        }
    }
}

/// A constraint together with the requester that imposed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintOrigin {
    pub requester: Requester,
    pub constraint: VersionConstraint,
}

impl fmt::Display for ConstraintOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.requester, self.constraint)
    }
}

/// A top-level module request handed to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRequest {
    pub name: String,
    #[serde(default)]
    pub constraint: VersionConstraint,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl RootRequest {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
            parameters: BTreeMap::new(),
        }
    }

    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, VersionConstraint::Latest)
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}
