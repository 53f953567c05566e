// cmh-common/src/model/version.rs
//! Version constraints over module versions.
//!
//! Constraints are a closed set of variants. Any two constraints can be
//! intersected into a single constraint, which is how the resolver combines
//! requirements coming from different requesters.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CmhError, Result};

/// Parses a module version leniently: a leading `v` is dropped and missing
/// minor/patch components are filled with zero (`2` → `2.0.0`).
pub fn parse_version(input: &str) -> Result<Version> {
    parse_partial(input).map(|(version, _)| version)
}

/// Returns the parsed version together with the number of numeric
/// components that were actually written (1..=3).
fn parse_partial(input: &str) -> Result<(Version, usize)> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(invalid(input, "empty version"));
    }

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let components = core.split('.').count();
    if components > 3 {
        return Err(invalid(input, "more than three numeric components"));
    }
    let mut padded = core.to_string();
    for _ in components..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);

    let version = Version::parse(&padded).map_err(|e| invalid(input, &e.to_string()))?;
    Ok((version, components))
}

fn invalid(expression: &str, reason: &str) -> CmhError {
    CmhError::InvalidConstraint {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

/// One end of a version range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

impl Bound {
    pub fn inclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: true,
        }
    }

    pub fn exclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    /// Any version; the newest available one is selected.
    Latest,
    Exact(Version),
    Minimum(Version),
    Range {
        lower: Option<Bound>,
        upper: Option<Bound>,
    },
}

impl Default for VersionConstraint {
    fn default() -> Self {
        Self::Latest
    }
}

impl VersionConstraint {
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            Self::Latest => true,
            Self::Exact(v) => version == v,
            Self::Minimum(v) => version >= v,
            Self::Range { lower, upper } => {
                let above = lower.as_ref().is_none_or(|b| match version.cmp(&b.version) {
                    Ordering::Greater => true,
                    Ordering::Equal => b.inclusive,
                    Ordering::Less => false,
                });
                let below = upper.as_ref().is_none_or(|b| match version.cmp(&b.version) {
                    Ordering::Less => true,
                    Ordering::Equal => b.inclusive,
                    Ordering::Greater => false,
                });
                above && below
            }
        }
    }

    /// Picks the first satisfying version from a list ordered highest first.
    pub fn select_highest<'a>(&self, descending: &'a [Version]) -> Option<&'a Version> {
        descending.iter().find(|v| self.satisfies(v))
    }

    fn bounds(&self) -> (Option<Bound>, Option<Bound>) {
        match self {
            Self::Latest => (None, None),
            Self::Exact(v) => (Some(Bound::inclusive(v.clone())), Some(Bound::inclusive(v.clone()))),
            Self::Minimum(v) => (Some(Bound::inclusive(v.clone())), None),
            Self::Range { lower, upper } => (lower.clone(), upper.clone()),
        }
    }

    fn from_bounds(lower: Option<Bound>, upper: Option<Bound>) -> Self {
        match (lower, upper) {
            (None, None) => Self::Latest,
            (Some(l), Some(u)) if l.inclusive && u.inclusive && l.version == u.version => {
                Self::Exact(l.version)
            }
            (Some(l), None) if l.inclusive => Self::Minimum(l.version),
            (lower, upper) => Self::Range { lower, upper },
        }
    }

    /// Intersects two constraints. `None` means no version can satisfy both.
    pub fn intersect(&self, other: &VersionConstraint) -> Option<VersionConstraint> {
        let (a_lower, a_upper) = self.bounds();
        let (b_lower, b_upper) = other.bounds();

        let lower = match (a_lower, b_lower) {
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Greater => a,
                Ordering::Less => b,
                Ordering::Equal => Bound {
                    version: a.version,
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
            (a, b) => a.or(b),
        };
        let upper = match (a_upper, b_upper) {
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Less => a,
                Ordering::Greater => b,
                Ordering::Equal => Bound {
                    version: a.version,
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
            (a, b) => a.or(b),
        };

        if let (Some(l), Some(u)) = (&lower, &upper) {
            match l.version.cmp(&u.version) {
                Ordering::Greater => return None,
                Ordering::Equal if !(l.inclusive && u.inclusive) => return None,
                _ => {}
            }
        }
        Some(Self::from_bounds(lower, upper))
    }

    fn parse_comparator(part: &str, expression: &str) -> Result<VersionConstraint> {
        let (op, rest) = if let Some(rest) = part.strip_prefix(">=") {
            (">=", rest)
        } else if let Some(rest) = part.strip_prefix("<=") {
            ("<=", rest)
        } else if let Some(rest) = part.strip_prefix("==") {
            ("=", rest)
        } else if let Some(rest) = part.strip_prefix('>') {
            (">", rest)
        } else if let Some(rest) = part.strip_prefix('<') {
            ("<", rest)
        } else if let Some(rest) = part.strip_prefix('=') {
            ("=", rest)
        } else if let Some(rest) = part.strip_prefix('^') {
            ("^", rest)
        } else if let Some(rest) = part.strip_prefix('~') {
            ("~", rest)
        } else {
            ("=", part)
        };

        let (version, components) =
            parse_partial(rest).map_err(|_| invalid(expression, &format!("bad version in '{part}'")))?;

        let constraint = match op {
            ">=" => Self::Minimum(version),
            ">" => Self::Range {
                lower: Some(Bound::exclusive(version)),
                upper: None,
            },
            "<=" => Self::Range {
                lower: None,
                upper: Some(Bound::inclusive(version)),
            },
            "<" => Self::Range {
                lower: None,
                upper: Some(Bound::exclusive(version)),
            },
            "^" => {
                let upper = if version.major > 0 || components == 1 {
                    Version::new(version.major + 1, 0, 0)
                } else if version.minor > 0 || components == 2 {
                    Version::new(0, version.minor + 1, 0)
                } else {
                    Version::new(0, 0, version.patch + 1)
                };
                Self::Range {
                    lower: Some(Bound::inclusive(version)),
                    upper: Some(Bound::exclusive(upper)),
                }
            }
            "~" => {
                let upper = if components == 1 {
                    Version::new(version.major + 1, 0, 0)
                } else {
                    Version::new(version.major, version.minor + 1, 0)
                };
                Self::Range {
                    lower: Some(Bound::inclusive(version)),
                    upper: Some(Bound::exclusive(upper)),
                }
            }
            _ => Self::Exact(version),
        };
        Ok(constraint)
    }
}

impl FromStr for VersionConstraint {
    type Err = CmhError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }

        let mut combined = Self::Latest;
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid(s, "empty comparator"));
            }
            let next = Self::parse_comparator(part, s)?;
            combined = combined
                .intersect(&next)
                .ok_or_else(|| invalid(s, "comparators exclude every version"))?;
        }
        Ok(combined)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "*"),
            Self::Exact(v) => write!(f, "={v}"),
            Self::Minimum(v) => write!(f, ">={v}"),
            Self::Range { lower, upper } => {
                let mut parts = Vec::with_capacity(2);
                if let Some(l) = lower {
                    parts.push(format!("{}{}", if l.inclusive { ">=" } else { ">" }, l.version));
                }
                if let Some(u) = upper {
                    parts.push(format!("{}{}", if u.inclusive { "<=" } else { "<" }, u.version));
                }
                if parts.is_empty() {
                    write!(f, "*")
                } else {
                    write!(f, "{}", parts.join(","))
                }
            }
        }
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
