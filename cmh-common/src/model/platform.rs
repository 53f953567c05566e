// cmh-common/src/model/platform.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Host platforms a module supports. Empty means platform-independent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Platforms: u8 {
        const LINUX   = 0b0000_0001;
        const MACOS   = 0b0000_0010;
        const WINDOWS = 0b0000_0100;
    }
}

impl Default for Platforms {
    fn default() -> Self {
        Self::empty()
    }
}

impl Platforms {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::WINDOWS
        } else if cfg!(target_os = "macos") {
            Self::MACOS
        } else {
            Self::LINUX
        }
    }

    /// Parses a platform name case-insensitively, accepting common aliases.
    pub fn from_platform_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "linux" => Some(Self::LINUX),
            "macos" | "darwin" | "osx" => Some(Self::MACOS),
            "windows" | "win32" => Some(Self::WINDOWS),
            _ => None,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::LINUX) {
            names.push("linux");
        }
        if self.contains(Self::MACOS) {
            names.push("macos");
        }
        if self.contains(Self::WINDOWS) {
            names.push("windows");
        }
        names
    }

    /// True when `host` is supported; an empty set supports everything.
    pub fn supports(&self, host: Platforms) -> bool {
        self.is_empty() || self.intersects(host)
    }
}

impl fmt::Display for Platforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "all platforms")
        } else {
            write!(f, "{}", self.names().join(", "))
        }
    }
}

// modules.json lists platforms as names: ["linux", "macos"].
impl Serialize for Platforms {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Platforms {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Platforms::empty(), |acc, name| {
            Platforms::from_platform_name(name)
                .map(|p| acc | p)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown platform '{name}'")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_supports_every_host() {
        assert!(Platforms::empty().supports(Platforms::WINDOWS));
        assert!(!Platforms::LINUX.supports(Platforms::WINDOWS));
        assert!((Platforms::LINUX | Platforms::MACOS).supports(Platforms::MACOS));
    }

    #[test]
    fn deserializes_from_names() {
        let p: Platforms = serde_json::from_str(r#"["Linux", "darwin"]"#).unwrap();
        assert_eq!(p, Platforms::LINUX | Platforms::MACOS);
        assert!(serde_json::from_str::<Platforms>(r#"["beos"]"#).is_err());
    }

    #[test]
    fn platform_names_accept_aliases_in_any_case() {
        assert_eq!(Platforms::from_platform_name("WIN32"), Some(Platforms::WINDOWS));
        assert_eq!(Platforms::from_platform_name("OSX"), Some(Platforms::MACOS));
        assert_eq!(Platforms::from_platform_name("linux"), Some(Platforms::LINUX));
        assert_eq!(Platforms::from_platform_name("haiku"), None);
    }
}
