// cmh-core/src/check.rs
//! Static compatibility of a module with a toolchain and a registry.

use std::fmt;

use cmh_common::model::{ModuleDescriptor, Platforms};
use cmh_common::registry::ModuleRegistry;
use semver::Version;
use tracing::debug;

/// The build environment a module is checked against. Unknown fields yield
/// `CheckStatus::Unknown` instead of a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub platform: Platforms,
    pub cmake_version: Option<Version>,
    /// C++ standard as a year suffix (11, 14, 17, 20, 23).
    pub cxx_standard: Option<u32>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            platform: Platforms::current(),
            cmake_version: None,
            cxx_standard: None,
        }
    }
}

impl Toolchain {
    pub fn with_cmake(mut self, version: Version) -> Self {
        self.cmake_version = Some(version);
        self
    }

    pub fn with_cxx_standard(mut self, standard: u32) -> Self {
        self.cxx_standard = Some(standard);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Compatible,
    Incompatible,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    Platform,
    CMakeVersion,
    CxxStandard,
    Dependency(String),
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Platform => write!(f, "platform"),
            Self::CMakeVersion => write!(f, "cmake"),
            Self::CxxStandard => write!(f, "c++ standard"),
            Self::Dependency(name) => write!(f, "dependency '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckItem {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityReport {
    pub module: String,
    pub checks: Vec<CheckItem>,
    /// Modules that cannot be used together with this one.
    pub conflicts: Vec<String>,
}

impl CompatibilityReport {
    pub fn is_compatible(&self) -> bool {
        self.checks
            .iter()
            .all(|c| c.status != CheckStatus::Incompatible)
    }

    pub fn status_of(&self, kind: &CheckKind) -> Option<CheckStatus> {
        self.checks.iter().find(|c| &c.kind == kind).map(|c| c.status)
    }
}

impl fmt::Display for CompatibilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compatibility of '{}':", self.module)?;
        for check in &self.checks {
            let mark = match check.status {
                CheckStatus::Compatible => "ok",
                CheckStatus::Incompatible => "FAIL",
                CheckStatus::Unknown => "??",
            };
            writeln!(f, "  [{mark}] {}: {}", check.kind, check.detail)?;
        }
        if !self.conflicts.is_empty() {
            writeln!(f, "  conflicts with: {}", self.conflicts.join(", "))?;
        }
        Ok(())
    }
}

pub fn check_compatibility(
    descriptor: &ModuleDescriptor,
    registry: &ModuleRegistry,
    toolchain: &Toolchain,
) -> CompatibilityReport {
    let mut checks = Vec::new();

    let platform_ok = descriptor.platforms.supports(toolchain.platform);
    checks.push(CheckItem {
        kind: CheckKind::Platform,
        status: if platform_ok {
            CheckStatus::Compatible
        } else {
            CheckStatus::Incompatible
        },
        detail: format!(
            "requires {}, host is {}",
            descriptor.platforms, toolchain.platform
        ),
    });

    if let Some(required) = &descriptor.cmake_minimum_required {
        checks.push(match &toolchain.cmake_version {
            Some(have) => CheckItem {
                kind: CheckKind::CMakeVersion,
                status: if have >= required {
                    CheckStatus::Compatible
                } else {
                    CheckStatus::Incompatible
                },
                detail: format!("requires >= {required}, found {have}"),
            },
            None => CheckItem {
                kind: CheckKind::CMakeVersion,
                status: CheckStatus::Unknown,
                detail: format!("requires >= {required}, CMake version unknown"),
            },
        });
    }

    if let Some(required) = descriptor.cpp_minimum_required {
        checks.push(match toolchain.cxx_standard {
            Some(have) => CheckItem {
                kind: CheckKind::CxxStandard,
                status: if cxx_rank(have) >= cxx_rank(required) {
                    CheckStatus::Compatible
                } else {
                    CheckStatus::Incompatible
                },
                detail: format!("requires C++{required}, using C++{have}"),
            },
            None => CheckItem {
                kind: CheckKind::CxxStandard,
                status: CheckStatus::Unknown,
                detail: format!("requires C++{required}, standard unknown"),
            },
        });
    }

    for dependency in &descriptor.dependencies {
        let item = match registry.get(&dependency.name) {
            None => CheckItem {
                kind: CheckKind::Dependency(dependency.name.clone()),
                status: CheckStatus::Incompatible,
                detail: "not in the registry".to_string(),
            },
            Some(found) => match dependency.constraint.select_highest(&found.versions) {
                Some(version) => CheckItem {
                    kind: CheckKind::Dependency(dependency.name.clone()),
                    status: CheckStatus::Compatible,
                    detail: format!("{} satisfied by {version}", dependency.constraint),
                },
                None => CheckItem {
                    kind: CheckKind::Dependency(dependency.name.clone()),
                    status: CheckStatus::Incompatible,
                    detail: format!("no version satisfies {}", dependency.constraint),
                },
            },
        };
        checks.push(item);
    }

    let report = CompatibilityReport {
        module: descriptor.name.clone(),
        checks,
        conflicts: descriptor.conflicts.clone(),
    };
    debug!(
        "Compatibility of '{}': {}",
        report.module,
        if report.is_compatible() { "ok" } else { "incompatible" }
    );
    report
}

/// Orders two-digit standard years, where 98 predates 03 and 11.
fn cxx_rank(standard: u32) -> u32 {
    match standard {
        98 => 1998,
        s if s < 100 => 2000 + s,
        s => s,
    }
}
