// cmh-common/src/model/descriptor.rs
// A module definition as listed in a modules.json index.

use std::collections::BTreeMap;

use semver::Version;
use serde::Deserialize;

use super::parameter::ParameterSpec;
use super::platform::Platforms;
use super::version::parse_version;
use crate::dependency::definition::RawDependency;
use crate::dependency::DependencySpec;

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub repository: Option<String>,
    /// Path of the module file inside the repository.
    pub path: Option<String>,
    pub license: Option<String>,
    /// Highest first, no duplicates.
    pub versions: Vec<Version>,
    pub dependencies: Vec<DependencySpec>,
    pub conflicts: Vec<String>,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub platforms: Platforms,
    pub cmake_minimum_required: Option<Version>,
    pub cpp_minimum_required: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawModule {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default, alias = "platform")]
    platforms: Platforms,
    #[serde(default)]
    cmake_minimum_required: Option<String>,
    #[serde(default)]
    cpp_minimum_required: Option<serde_json::Value>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, mut versions: Vec<Version>) -> Self {
        versions.sort_by(|a, b| b.cmp(a));
        versions.dedup();
        Self {
            name: name.into(),
            description: None,
            category: None,
            tags: Vec::new(),
            repository: None,
            path: None,
            license: None,
            versions,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            parameters: BTreeMap::new(),
            platforms: Platforms::empty(),
            cmake_minimum_required: None,
            cpp_minimum_required: None,
        }
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    pub fn with_conflict(mut self, name: impl Into<String>) -> Self {
        self.conflicts.push(name.into());
        self
    }

    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.first()
    }

    pub fn has_version(&self, version: &Version) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    /// Case-insensitive substring match on name, description and tags.
    /// `needle` must already be lowercase.
    pub fn matches(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(needle))
            || self.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }

    /// Builds a descriptor from one raw `modules.json` entry, validating it.
    /// The error string explains why the entry was rejected.
    pub fn from_entry(entry: serde_json::Value) -> Result<Self, String> {
        let raw: RawModule = serde_json::from_value(entry).map_err(|e| e.to_string())?;

        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err("module name is empty".to_string());
        }
        if name.starts_with('.') || name.contains(['/', '\\']) || name.contains(char::is_whitespace) {
            return Err(format!("module name '{name}' is not a valid identifier"));
        }

        let mut version_strings = raw.versions;
        version_strings.extend(raw.version);
        if version_strings.is_empty() {
            return Err("no versions declared".to_string());
        }
        let versions = version_strings
            .iter()
            .map(|v| parse_version(v).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;

        let dependencies: Vec<DependencySpec> =
            raw.dependencies.into_iter().map(DependencySpec::from).collect();
        for dep in &dependencies {
            if dep.name.trim().is_empty() {
                return Err("dependency with an empty name".to_string());
            }
            if dep.name == name {
                return Err("module depends on itself".to_string());
            }
        }

        for (param, spec) in &raw.parameters {
            if let Some(default) = &spec.default {
                spec.validate(default)
                    .map_err(|reason| format!("default of parameter '{param}': {reason}"))?;
            }
        }

        let cmake_minimum_required = raw
            .cmake_minimum_required
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_version(&s).map_err(|e| e.to_string()))
            .transpose()?;

        let cpp_minimum_required = match raw.cpp_minimum_required {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Number(n)) => Some(
                n.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| format!("invalid C++ standard '{n}'"))?,
            ),
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(
                s.trim()
                    .trim_start_matches("c++")
                    .trim_start_matches("C++")
                    .parse::<u32>()
                    .map_err(|_| format!("invalid C++ standard '{s}'"))?,
            ),
            Some(other) => return Err(format!("invalid C++ standard '{other}'")),
        };

        let mut descriptor = ModuleDescriptor::new(name, versions);
        descriptor.description = raw.description;
        descriptor.category = raw.category;
        descriptor.tags = raw.tags;
        descriptor.repository = raw.repository;
        descriptor.path = raw.path;
        descriptor.license = raw.license;
        descriptor.dependencies = dependencies;
        descriptor.conflicts = raw.conflicts;
        descriptor.parameters = raw.parameters;
        descriptor.platforms = raw.platforms;
        descriptor.cmake_minimum_required = cmake_minimum_required;
        descriptor.cpp_minimum_required = cpp_minimum_required;
        Ok(descriptor)
    }
}
