// cmh-common/src/dependency/definition.rs
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ParameterValue, VersionConstraint};

/// A dependency edge declared by a module: target name, the constraint it
/// places on the target's version and parameter values it requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    #[serde(default, alias = "version")]
    pub constraint: VersionConstraint,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.constraint)
    }
}

/// modules.json accepts either a bare module name or a detailed object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawDependency {
    Name(String),
    Detailed(DependencySpec),
}

impl From<RawDependency> for DependencySpec {
    fn from(raw: RawDependency) -> Self {
        match raw {
            RawDependency::Name(name) => DependencySpec::new(name, VersionConstraint::Latest),
            RawDependency::Detailed(spec) => spec,
        }
    }
}
